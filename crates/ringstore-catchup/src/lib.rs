//! The sample-catchup session (§4.4): a thin, stateful wrapper over ring
//! reads that aggregates everything new since its last tick and forwards
//! the result to a sink.
//!
//! Same "remember a cursor, poll, forward downstream" shape as a
//! subscription that tracks its own durability watermark, but synchronous
//! rather than `tokio`-driven, since the ring engine itself has no
//! scheduler (§5) and this session rides directly on top of it.

use ringstore_core::aggregate::{aggregate, AggFn};
use ringstore_core::backend::Backend;
use ringstore_core::error::{Result, RingStoreError};
use ringstore_core::ring::RingHandle;
use ringstore_core::table::Table;

/// Where a catch-up session's result table goes. The URL-addressed
/// sink/source abstraction that resolves this for the shipped CLI tools
/// lives outside this crate's scope (§1); `RingSink` is the one concrete
/// implementation needed to exercise the session end-to-end.
pub trait Sink {
    fn write(&mut self, table: &Table) -> Result<()>;
}

/// A sink that appends the result into another open ring.
pub struct RingSink<'a, B: Backend> {
    pub backend: &'a B,
    pub ring: &'a mut RingHandle<B>,
}

impl<'a, B: Backend> Sink for RingSink<'a, B> {
    fn write(&mut self, table: &Table) -> Result<()> {
        self.ring.put(self.backend, table)
    }
}

/// Statistics accumulated across ticks, for observability.
#[derive(Debug, Default, Clone)]
pub struct CatchupStats {
    pub ticks: u64,
    pub samples_read: u64,
    pub samples_written: u64,
}

/// A stateful catch-up reader over one source ring (§4.4).
pub struct CatchupSession<B: Backend> {
    func: AggFn,
    last_seq: u64,
    stats: CatchupStats,
    _marker: std::marker::PhantomData<B>,
}

impl<B: Backend> CatchupSession<B> {
    /// Creates a session remembering the source's `youngest + 1` as the
    /// starting point, so the first tick only sees samples written after
    /// creation (§4.4).
    pub fn new(source: &RingHandle<B>, func: AggFn) -> Self {
        let start = (source.youngest() + 1).max(0) as u64;
        Self {
            func,
            last_seq: start,
            stats: CatchupStats::default(),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn stats(&self) -> &CatchupStats {
        &self.stats
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Runs one tick: read everything new, reduce it if there's more than
    /// one sample, write the result, advance the remembered sequence
    /// (§4.4 steps 1-4).
    pub fn tick(&mut self, backend: &B, source: &mut RingHandle<B>, sink: &mut impl Sink) -> Result<()> {
        self.stats.ticks += 1;

        let batch = source.mget_range(backend, Some(self.last_seq), None, None, None)?;
        let batch = match batch {
            Some(t) => t,
            None => return Ok(()),
        };
        if batch.is_empty() {
            return Ok(());
        }

        let seq_idx = batch
            .column_index("_seq")
            .ok_or_else(|| RingStoreError::Invalid("catchup batch missing _seq".into()))?;
        let max_seq: u64 = batch
            .rows
            .iter()
            .filter_map(|r| r[seq_idx].parse::<u64>().ok())
            .max()
            .unwrap_or(self.last_seq);

        self.stats.samples_read += batch.rows.len() as u64;

        let result = if batch.rows.len() == 1 {
            batch
        } else {
            aggregate(&batch, self.func)?
        };

        sink.write(&result)?;
        self.stats.samples_written += 1;
        self.last_seq = max_seq + 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringstore_core::backend::{BackendDescriptor, CreatePerm, DataBlock, LockMode};
    use ringstore_core::headers::HeaderDict;
    use ringstore_core::index::RingIndex;
    use ringstore_core::ring::OpenSpec;
    use ringstore_core::ringdir::RingDirectory;
    use ringstore_core::superblock::Superblock;
    use std::collections::HashMap;
    use std::sync::Mutex;

    // A minimal in-memory backend mirroring ringstore-core's own test
    // double, duplicated here since it isn't exported as test
    // infrastructure across crate boundaries.
    struct FileState {
        super_: Superblock,
        ringdir: RingDirectory,
        headers: HeaderDict,
        indexes: HashMap<u64, RingIndex>,
        blocks: HashMap<(u64, u64), DataBlock>,
    }

    #[derive(Default)]
    struct MemBackend {
        files: Mutex<HashMap<String, FileState>>,
    }

    struct MemDesc(String);
    impl BackendDescriptor for MemDesc {}

    impl Backend for MemBackend {
        type Descriptor = MemDesc;

        fn open(&self, path: &str, _perm: CreatePerm, create: bool) -> Result<Self::Descriptor> {
            let mut files = self.files.lock().unwrap();
            if !files.contains_key(path) {
                if !create {
                    return Err(RingStoreError::NotFound(path.to_string()));
                }
                files.insert(
                    path.to_string(),
                    FileState {
                        super_: Superblock::new_for_host(),
                        ringdir: RingDirectory::default(),
                        headers: HeaderDict::default(),
                        indexes: HashMap::new(),
                        blocks: HashMap::new(),
                    },
                );
            }
            Ok(MemDesc(path.to_string()))
        }
        fn close(&self, _desc: Self::Descriptor) -> Result<()> {
            Ok(())
        }
        fn lock(&self, _desc: &Self::Descriptor, _mode: LockMode, _tag: &str) -> Result<()> {
            Ok(())
        }
        fn lock_now(&self, _desc: &Self::Descriptor, _mode: LockMode, _tag: &str) -> Result<()> {
            Ok(())
        }
        fn unlock(&self, _desc: &Self::Descriptor) -> Result<()> {
            Ok(())
        }
        fn read_super(&self, desc: &Self::Descriptor) -> Result<Superblock> {
            Ok(self.files.lock().unwrap()[&desc.0].super_.clone())
        }
        fn write_super(&self, desc: &Self::Descriptor, sb: &Superblock) -> Result<()> {
            self.files.lock().unwrap().get_mut(&desc.0).unwrap().super_ = sb.clone();
            Ok(())
        }
        fn mark_damaged(&self, _desc: &Self::Descriptor) -> Result<()> {
            Ok(())
        }
        fn is_damaged(&self, _desc: &Self::Descriptor) -> Result<bool> {
            Ok(false)
        }
        fn read_ringdir(&self, desc: &Self::Descriptor) -> Result<RingDirectory> {
            Ok(self.files.lock().unwrap()[&desc.0].ringdir.clone())
        }
        fn write_ringdir(&self, desc: &Self::Descriptor, dir: &RingDirectory) -> Result<()> {
            self.files.lock().unwrap().get_mut(&desc.0).unwrap().ringdir = dir.clone();
            Ok(())
        }
        fn read_headers(&self, desc: &Self::Descriptor) -> Result<HeaderDict> {
            Ok(self.files.lock().unwrap()[&desc.0].headers.clone())
        }
        fn write_headers(&self, desc: &Self::Descriptor, dict: &HeaderDict) -> Result<()> {
            self.files.lock().unwrap().get_mut(&desc.0).unwrap().headers = dict.clone();
            Ok(())
        }
        fn read_index(&self, desc: &Self::Descriptor, ring_id: u64) -> Result<RingIndex> {
            Ok(self.files.lock().unwrap()[&desc.0]
                .indexes
                .get(&ring_id)
                .cloned()
                .unwrap_or_default())
        }
        fn write_index(&self, desc: &Self::Descriptor, ring_id: u64, idx: &RingIndex) -> Result<()> {
            self.files
                .lock()
                .unwrap()
                .get_mut(&desc.0)
                .unwrap()
                .indexes
                .insert(ring_id, idx.clone());
            Ok(())
        }
        fn rm_index(&self, desc: &Self::Descriptor, ring_id: u64) -> Result<()> {
            self.files.lock().unwrap().get_mut(&desc.0).unwrap().indexes.remove(&ring_id);
            Ok(())
        }
        fn append_dblocks(
            &self,
            desc: &Self::Descriptor,
            ring_id: u64,
            _start_seq: u64,
            blocks: &[DataBlock],
        ) -> Result<usize> {
            let mut files = self.files.lock().unwrap();
            let f = files.get_mut(&desc.0).unwrap();
            for b in blocks {
                f.blocks.insert((ring_id, b.seq), b.clone());
            }
            Ok(blocks.len())
        }
        fn read_dblocks(
            &self,
            desc: &Self::Descriptor,
            ring_id: u64,
            start_seq: u64,
            n: usize,
        ) -> Result<Vec<DataBlock>> {
            let files = self.files.lock().unwrap();
            let f = &files[&desc.0];
            Ok((0..n as u64)
                .filter_map(|i| f.blocks.get(&(ring_id, start_seq + i)).cloned())
                .collect())
        }
        fn expire_dblocks(
            &self,
            desc: &Self::Descriptor,
            ring_id: u64,
            from_seq: u64,
            to_seq: u64,
        ) -> Result<usize> {
            let mut files = self.files.lock().unwrap();
            let f = files.get_mut(&desc.0).unwrap();
            let mut removed = 0;
            for seq in from_seq..=to_seq {
                if f.blocks.remove(&(ring_id, seq)).is_some() {
                    removed += 1;
                }
            }
            Ok(removed)
        }
        fn checkpoint(&self, _desc: &Self::Descriptor) -> Result<()> {
            Ok(())
        }
        fn footprint(&self, _desc: &Self::Descriptor) -> Result<u64> {
            Ok(0)
        }
    }

    fn spec(name: &str) -> OpenSpec {
        OpenSpec {
            path: "mem://catchup".into(),
            perm: CreatePerm::default(),
            ring_name: name.into(),
            long_name: String::new(),
            about: String::new(),
            slot_capacity: 0,
            duration: 0,
            create: true,
        }
    }

    struct VecSink(Vec<Table>);
    impl Sink for VecSink {
        fn write(&mut self, table: &Table) -> Result<()> {
            self.0.push(table.clone());
            Ok(())
        }
    }

    #[test]
    fn no_new_samples_is_a_noop() {
        let backend = MemBackend::default();
        let source = RingHandle::open(&backend, &spec("src")).unwrap();
        let mut session = CatchupSession::new(&source, AggFn::Avg);
        let mut source = source;
        let mut sink = VecSink(Vec::new());
        session.tick(&backend, &mut source, &mut sink).unwrap();
        assert!(sink.0.is_empty());
    }

    #[test]
    fn single_new_sample_passes_through_unchanged() {
        let backend = MemBackend::default();
        let mut source = RingHandle::open(&backend, &spec("src")).unwrap();
        let mut session = CatchupSession::new(&source, AggFn::Avg);

        let mut t = Table::new(vec!["_time".into(), "val".into()]);
        t.push_row(vec!["10".into(), "5".into()]);
        source.put(&backend, &t).unwrap();

        let mut sink = VecSink(Vec::new());
        session.tick(&backend, &mut source, &mut sink).unwrap();
        assert_eq!(sink.0.len(), 1);
        assert_eq!(sink.0[0].get(0, "val"), Some("5"));
        assert_eq!(session.last_seq(), 1);
    }

    #[test]
    fn multiple_new_samples_are_aggregated() {
        let backend = MemBackend::default();
        let mut source = RingHandle::open(&backend, &spec("src")).unwrap();
        let mut session = CatchupSession::new(&source, AggFn::Sum);

        for (t, v) in [(10, "1"), (20, "2"), (30, "3")] {
            let mut tab = Table::new(vec!["_time".into(), "val".into()]);
            tab.push_row(vec![t.to_string(), v.to_string()]);
            source.put(&backend, &tab).unwrap();
        }

        let mut sink = VecSink(Vec::new());
        session.tick(&backend, &mut source, &mut sink).unwrap();
        assert_eq!(sink.0.len(), 1);
        assert_eq!(sink.0[0].rows.len(), 1);
        assert_eq!(sink.0[0].get(0, "val"), Some("6.00"));
        assert_eq!(session.last_seq(), 3);

        // A second tick with nothing new is a no-op.
        session.tick(&backend, &mut source, &mut sink).unwrap();
        assert_eq!(sink.0.len(), 1);
    }
}
