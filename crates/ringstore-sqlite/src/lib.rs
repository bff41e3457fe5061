//! A concrete [`Backend`] for `ringstore-core`, storing the engine's
//! reserved keys (`superblock`, `ringdir`, `headdict`, `ri<id>`,
//! `rd<id>_<seq>`, §6) as rows in a single SQLite table, and providing
//! genuine cross-process advisory locking via `fs2` on a side-car lock
//! file next to the database.
//!
//! Uses a `Mutex<Connection>`-wrapped `rusqlite` connection with
//! schema-init-on-open and prepared statements. SQLite's own connection
//! locking only serializes access within one process; the engine's lock
//! escalation protocol (§4.2.7) requires a real OS-level advisory lock
//! with explicit read/write modes, which `fs2`'s `flock`/`LockFileEx`
//! wrapper provides directly.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use fs2::FileExt;
use rusqlite::{params, Connection, OptionalExtension};

use ringstore_core::backend::{Backend, BackendDescriptor, CreatePerm, DataBlock, LockMode};
use ringstore_core::error::{Result, RingStoreError};
use ringstore_core::headers::HeaderDict;
use ringstore_core::index::RingIndex;
use ringstore_core::ringdir::RingDirectory;
use ringstore_core::superblock::Superblock;

const KEY_SUPERBLOCK: &str = "superblock";
const KEY_RINGDIR: &str = "ringdir";
const KEY_HEADERS: &str = "headdict";
const KEY_DAMAGED: &str = "damaged";

/// Bounded retry/backoff for blocking lock acquisition (§4.1 "bounded
/// retries and a small backoff").
const LOCK_RETRIES: u32 = 50;
const LOCK_BACKOFF: Duration = Duration::from_millis(20);

pub struct SqliteDescriptor {
    conn: Mutex<Connection>,
    lock_file: File,
    path: PathBuf,
}

impl BackendDescriptor for SqliteDescriptor {}

#[derive(Default)]
pub struct SqliteBackend;

impl SqliteBackend {
    pub fn new() -> Self {
        Self
    }

    fn index_key(ring_id: u64) -> String {
        format!("ri{}", ring_id)
    }

    fn dblock_key(ring_id: u64, seq: u64) -> String {
        format!("rd{}_{}", ring_id, seq)
    }

    fn get_raw(conn: &Connection, key: &str) -> Result<Option<String>> {
        conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |r| {
            r.get::<_, String>(0)
        })
        .optional()
        .map_err(|e| RingStoreError::Io(std::io::Error::other(e.to_string())))
    }

    fn put_raw(conn: &Connection, key: &str, value: &str) -> Result<()> {
        conn.execute(
            "INSERT INTO kv(key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .map_err(|e| RingStoreError::Io(std::io::Error::other(e.to_string())))?;
        Ok(())
    }

    fn del_raw(conn: &Connection, key: &str) -> Result<()> {
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
            .map_err(|e| RingStoreError::Io(std::io::Error::other(e.to_string())))?;
        Ok(())
    }
}

impl Backend for SqliteBackend {
    type Descriptor = SqliteDescriptor;

    fn open(&self, path: &str, _perm: CreatePerm, create: bool) -> Result<Self::Descriptor> {
        let exists = Path::new(path).exists();
        if !exists && !create {
            return Err(RingStoreError::NotFound(path.to_string()));
        }

        let lock_path = format!("{}.lock", path);
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)?;

        let conn = Connection::open(path)
            .map_err(|e| RingStoreError::Io(std::io::Error::other(e.to_string())))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .map_err(|e| RingStoreError::Io(std::io::Error::other(e.to_string())))?;

        let existing_super = Self::get_raw(&conn, KEY_SUPERBLOCK)?;
        match existing_super {
            Some(text) => {
                // Validates the magic; rejects without modification on
                // mismatch (§6).
                Superblock::parse(&text)?;
            }
            None => {
                if !create {
                    return Err(RingStoreError::WrongFormat(
                        "no superblock record".into(),
                    ));
                }
                let sb = Superblock::new_for_host();
                Self::put_raw(&conn, KEY_SUPERBLOCK, &sb.serialize())?;
                Self::put_raw(&conn, KEY_RINGDIR, &RingDirectory::default().serialize())?;
                Self::put_raw(&conn, KEY_HEADERS, &HeaderDict::default().serialize())?;
            }
        }

        Ok(SqliteDescriptor {
            conn: Mutex::new(conn),
            lock_file,
            path: PathBuf::from(path),
        })
    }

    fn close(&self, _desc: Self::Descriptor) -> Result<()> {
        Ok(())
    }

    fn lock(&self, desc: &Self::Descriptor, mode: LockMode, caller_tag: &str) -> Result<()> {
        let exclusive = !matches!(mode, LockMode::Read);
        for attempt in 0..LOCK_RETRIES {
            let acquired = if exclusive {
                desc.lock_file.try_lock_exclusive()
            } else {
                desc.lock_file.try_lock_shared()
            };
            if acquired.is_ok() {
                return Ok(());
            }
            tracing::trace!(caller_tag, attempt, "lock contended, retrying");
            thread::sleep(LOCK_BACKOFF);
        }
        Err(RingStoreError::Locked(format!(
            "{}: lock not acquired after {} retries",
            caller_tag, LOCK_RETRIES
        )))
    }

    fn lock_now(&self, desc: &Self::Descriptor, mode: LockMode, caller_tag: &str) -> Result<()> {
        let exclusive = !matches!(mode, LockMode::Read);
        let acquired = if exclusive {
            desc.lock_file.try_lock_exclusive()
        } else {
            desc.lock_file.try_lock_shared()
        };
        acquired.map_err(|_| RingStoreError::Locked(caller_tag.to_string()))
    }

    fn unlock(&self, desc: &Self::Descriptor) -> Result<()> {
        fs2::FileExt::unlock(&desc.lock_file)?;
        Ok(())
    }

    fn read_super(&self, desc: &Self::Descriptor) -> Result<Superblock> {
        let conn = desc.conn.lock().unwrap();
        let text = Self::get_raw(&conn, KEY_SUPERBLOCK)?
            .ok_or_else(|| RingStoreError::WrongFormat("no superblock record".into()))?;
        Superblock::parse(&text)
    }

    fn write_super(&self, desc: &Self::Descriptor, sb: &Superblock) -> Result<()> {
        let conn = desc.conn.lock().unwrap();
        Self::put_raw(&conn, KEY_SUPERBLOCK, &sb.serialize())
    }

    fn mark_damaged(&self, desc: &Self::Descriptor) -> Result<()> {
        let conn = desc.conn.lock().unwrap();
        Self::put_raw(&conn, KEY_DAMAGED, "1")
    }

    fn is_damaged(&self, desc: &Self::Descriptor) -> Result<bool> {
        let conn = desc.conn.lock().unwrap();
        Ok(Self::get_raw(&conn, KEY_DAMAGED)?.is_some())
    }

    fn read_ringdir(&self, desc: &Self::Descriptor) -> Result<RingDirectory> {
        let conn = desc.conn.lock().unwrap();
        let text = Self::get_raw(&conn, KEY_RINGDIR)?.unwrap_or_default();
        RingDirectory::parse(&text)
    }

    fn write_ringdir(&self, desc: &Self::Descriptor, dir: &RingDirectory) -> Result<()> {
        let conn = desc.conn.lock().unwrap();
        Self::put_raw(&conn, KEY_RINGDIR, &dir.serialize())
    }

    fn read_headers(&self, desc: &Self::Descriptor) -> Result<HeaderDict> {
        let conn = desc.conn.lock().unwrap();
        let text = Self::get_raw(&conn, KEY_HEADERS)?.unwrap_or_default();
        Ok(HeaderDict::parse(&text))
    }

    fn write_headers(&self, desc: &Self::Descriptor, dict: &HeaderDict) -> Result<()> {
        let conn = desc.conn.lock().unwrap();
        Self::put_raw(&conn, KEY_HEADERS, &dict.serialize())
    }

    fn read_index(&self, desc: &Self::Descriptor, ring_id: u64) -> Result<RingIndex> {
        let conn = desc.conn.lock().unwrap();
        let text = Self::get_raw(&conn, &Self::index_key(ring_id))?.unwrap_or_default();
        Ok(RingIndex::parse(&text))
    }

    fn write_index(&self, desc: &Self::Descriptor, ring_id: u64, idx: &RingIndex) -> Result<()> {
        let conn = desc.conn.lock().unwrap();
        Self::put_raw(&conn, &Self::index_key(ring_id), &idx.serialize())
    }

    fn rm_index(&self, desc: &Self::Descriptor, ring_id: u64) -> Result<()> {
        let conn = desc.conn.lock().unwrap();
        Self::del_raw(&conn, &Self::index_key(ring_id))
    }

    fn append_dblocks(
        &self,
        desc: &Self::Descriptor,
        ring_id: u64,
        _start_seq: u64,
        blocks: &[DataBlock],
    ) -> Result<usize> {
        let conn = desc.conn.lock().unwrap();
        for b in blocks {
            let value = format!("{}|{}|{}", b.time, b.hd_hash, b.body);
            Self::put_raw(&conn, &Self::dblock_key(ring_id, b.seq), &value)?;
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
        let conn = desc.conn.lock().unwrap();
        let mut out = Vec::with_capacity(n);
        for i in 0..n as u64 {
            let seq = start_seq + i;
            let key = Self::dblock_key(ring_id, seq);
            if let Some(text) = Self::get_raw(&conn, &key)? {
                let mut parts = text.splitn(3, '|');
                let time = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                let hd_hash = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                let body = parts.next().unwrap_or("").to_string();
                out.push(DataBlock {
                    seq,
                    time,
                    hd_hash,
                    body,
                });
            }
            // Missing blocks are silently skipped, not fatal (§4.1).
        }
        Ok(out)
    }

    fn expire_dblocks(
        &self,
        desc: &Self::Descriptor,
        ring_id: u64,
        from_seq: u64,
        to_seq: u64,
    ) -> Result<usize> {
        let conn = desc.conn.lock().unwrap();
        let mut removed = 0;
        for seq in from_seq..=to_seq {
            let key = Self::dblock_key(ring_id, seq);
            if Self::get_raw(&conn, &key)?.is_some() {
                Self::del_raw(&conn, &key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn checkpoint(&self, desc: &Self::Descriptor) -> Result<()> {
        let conn = desc.conn.lock().unwrap();
        conn.execute_batch("VACUUM;")
            .map_err(|e| RingStoreError::Io(std::io::Error::other(e.to_string())))
    }

    fn footprint(&self, desc: &Self::Descriptor) -> Result<u64> {
        let meta = std::fs::metadata(&desc.path)?;
        Ok(meta.len())
    }
}
