//! The ring engine public API (§4.2): open/close/destroy, the stateful
//! cursor, put/get, bulk reads including consolidation, purge/resize, and
//! header interning. This is the part of the engine most callers touch;
//! the backend abstraction and aggregation operator exist to serve it.

use crate::backend::{Backend, CreatePerm, DataBlock, LockMode};
use crate::error::{Result, RingStoreError};
use crate::headers::HeaderDict;
use crate::index::IndexRow;
use crate::ringdir::{RingDirectory, RingDirEntry};
use crate::table::{Table, COL_DUR, COL_SEQ, COL_TIME};

/// Sentinel ring id marking a revoked handle (§4.2.9).
const REVOKED: i64 = -1;

/// Parameters for opening or creating a ring (§4.2.1).
#[derive(Debug, Clone)]
pub struct OpenSpec {
    pub path: String,
    pub perm: CreatePerm,
    pub ring_name: String,
    pub long_name: String,
    pub about: String,
    pub slot_capacity: u32,
    pub duration: u32,
    pub create: bool,
}

/// The in-memory handle onto an open ring (§3 "in-memory ring handle").
/// Owns no backend data once closed; the backend descriptor outlives it or
/// is owned alongside it depending on how the caller structures things.
pub struct RingHandle<B: Backend> {
    desc: B::Descriptor,
    ring_id: i64,
    name: String,
    duration: u32,
    slot_capacity: u32,
    cached_generation: u64,
    header_cache: HeaderDict,
    /// `-1` means "refresh on first read" (§4.2.1 step 6).
    cursor: i64,
    oldest: i64,
    youngest: i64,
}

impl<B: Backend> RingHandle<B> {
    pub fn ring_id(&self) -> Result<u64> {
        if self.ring_id == REVOKED {
            return Err(RingStoreError::RingRevoked(self.name.clone()));
        }
        Ok(self.ring_id as u64)
    }

    pub fn is_revoked(&self) -> bool {
        self.ring_id == REVOKED
    }

    pub fn oldest(&self) -> i64 {
        self.oldest
    }

    pub fn youngest(&self) -> i64 {
        self.youngest
    }

    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Explicitly repositions the cursor (used by catch-up sessions and
    /// the scenario-4 `goto_seq` boundary test, §8).
    pub fn goto_seq(&mut self, seq: u64) {
        self.cursor = seq as i64;
    }

    fn check_live(&self) -> Result<u64> {
        if self.ring_id == REVOKED {
            return Err(RingStoreError::RingRevoked(self.name.clone()));
        }
        Ok(self.ring_id as u64)
    }

    /// §4.2.1: open an existing ring, or create one if `create` is set and
    /// no row matches `(name, duration)`.
    pub fn open(backend: &B, spec: &OpenSpec) -> Result<Self> {
        let desc = backend.open(&spec.path, spec.perm, spec.create)?;
        tracing::debug!(ring = %spec.ring_name, duration = spec.duration, "acquiring read lock for open");
        backend.lock(&desc, LockMode::Read, "ring_open")?;

        let dir = backend.read_ringdir(&desc);
        let dir = match dir {
            Ok(d) => d,
            Err(_) => RingDirectory::default(),
        };

        if let Some(entry) = dir.find(&spec.ring_name, spec.duration) {
            let entry = entry.clone();
            let sb = backend.read_super(&desc)?;
            let result = Self::populate(backend, desc, &entry, sb.generation);
            return result;
        }

        if !spec.create {
            backend.unlock(&desc)?;
            return Err(RingStoreError::NotFound(format!(
                "ring {}@{}",
                spec.ring_name, spec.duration
            )));
        }

        // Escalate to write lock to allocate a new ring id and persist the
        // directory row (§4.2.1 step 5). The escalation is release-then-
        // reacquire (§4.2.7); re-read the superblock after acquiring.
        tracing::debug!(ring = %spec.ring_name, duration = spec.duration, "escalating read lock to write lock to create ring");
        backend.unlock(&desc)?;
        backend.lock(&desc, LockMode::Write, "ring_open_create")?;

        let mut sb = backend.read_super(&desc)?;
        let mut dir = backend.read_ringdir(&desc).unwrap_or_default();
        // Re-check under the write lock: another writer may have created
        // this ring while we were escalating.
        if let Some(entry) = dir.find(&spec.ring_name, spec.duration) {
            let entry = entry.clone();
            backend.unlock(&desc)?;
            return Self::populate(backend, desc, &entry, sb.generation);
        }

        let id = sb.allocate_ring_id();
        let entry = RingDirEntry {
            name: spec.ring_name.clone(),
            duration: spec.duration,
            id,
            long_name: spec.long_name.clone(),
            about: spec.about.clone(),
            slot_capacity: spec.slot_capacity,
        };
        dir.entries.push(entry.clone());

        let dir_write = backend.write_ringdir(&desc, &dir);
        if dir_write.is_err() {
            backend.unlock(&desc)?;
            return Err(RingStoreError::Io(std::io::Error::other(
                "failed writing ring directory",
            )));
        }
        sb.bump_generation();
        if backend.write_super(&desc, &sb).is_err() {
            // Ring-directory write succeeded but the superblock write that
            // should make it visible did not: mark the file damaged rather
            // than leave a silently half-applied create (§4.2.1 step 5).
            let _ = backend.mark_damaged(&desc);
            backend.unlock(&desc)?;
            return Err(RingStoreError::Corrupt(
                "superblock write failed after ring directory write".into(),
            ));
        }

        tracing::info!(ring = %spec.ring_name, duration = spec.duration, id, generation = sb.generation, "created ring");
        backend.unlock(&desc)?;
        Self::populate(backend, desc, &entry, sb.generation)
    }

    fn populate(backend: &B, desc: B::Descriptor, entry: &RingDirEntry, generation: u64) -> Result<Self> {
        backend.lock(&desc, LockMode::Read, "ring_populate")?;
        let idx = backend.read_index(&desc, entry.id).unwrap_or_default();
        backend.unlock(&desc)?;
        let oldest = idx.oldest_seq().map(|s| s as i64).unwrap_or(-1);
        let youngest = idx.last_seq().map(|s| s as i64).unwrap_or(-1);
        Ok(Self {
            desc,
            ring_id: entry.id as i64,
            name: entry.name.clone(),
            duration: entry.duration,
            slot_capacity: entry.slot_capacity,
            cached_generation: generation,
            header_cache: HeaderDict::default(),
            cursor: -1,
            oldest,
            youngest,
        })
    }

    pub fn close(self, backend: &B) -> Result<()> {
        backend.close(self.desc)
    }

    /// §4.2.8: destroy a ring by name/duration. Standalone, not a method on
    /// an open handle (a handle might outlive the ring it names).
    pub fn destroy(backend: &B, path: &str, ring_name: &str, duration: u32) -> Result<()> {
        let desc = backend.open(path, CreatePerm::default(), false)?;
        backend.lock(&desc, LockMode::Write, "ring_destroy")?;

        let mut dir = backend.read_ringdir(&desc)?;
        let entry = match dir.find(ring_name, duration) {
            Some(e) => e.clone(),
            None => {
                backend.unlock(&desc)?;
                backend.close(desc)?;
                return Err(RingStoreError::NotFound(format!(
                    "ring {}@{}",
                    ring_name, duration
                )));
            }
        };
        dir.remove_by_id(entry.id);
        backend.write_ringdir(&desc, &dir)?;

        let mut sb = backend.read_super(&desc)?;
        sb.bump_generation();
        if backend.write_super(&desc, &sb).is_err() {
            let _ = backend.mark_damaged(&desc);
        }

        // Capture the index's bounds before removing it, or the data
        // blocks it named are leaked instead of expired (§4.2.8).
        let idx = backend.read_index(&desc, entry.id).unwrap_or_default();
        let _ = backend.rm_index(&desc, entry.id);
        if let (Some(oldest), Some(youngest)) = (idx.oldest_seq(), idx.last_seq()) {
            let _ = backend.expire_dblocks(&desc, entry.id, oldest, youngest);
        }

        tracing::info!(ring = ring_name, duration, id = entry.id, generation = sb.generation, "destroyed ring");
        backend.unlock(&desc)?;
        backend.close(desc)
    }

    /// §4.2.2: append one or more samples.
    pub fn put(&mut self, backend: &B, table: &Table) -> Result<()> {
        let ring_id = self.check_live()?;
        if table.is_empty() {
            return Ok(());
        }

        let header_text = table.serialize_header();
        let blocks = partition_into_blocks(table, 0)?;
        if blocks.is_empty() {
            return Ok(());
        }

        backend.lock(&self.desc, LockMode::Write, "ring_put")?;

        let r = (|| -> Result<()> {
            // Reload the dictionary under the write lock before interning:
            // the handle's cache only holds what *this* handle has interned
            // since it opened, and persisting that partial view would
            // clobber every other ring's header_hash entries (§4.2.6 step
            // 4, §3 invariant 4).
            self.header_cache = backend.read_headers(&self.desc)?;
            let hash = self.header_cache.intern(&header_text)?;
            backend.write_headers(&self.desc, &self.header_cache)?;

            let mut idx = backend.read_index(&self.desc, ring_id).unwrap_or_default();
            let next_seq = idx.last_seq().map(|s| s + 1).unwrap_or(0);

            let dblocks: Vec<DataBlock> = blocks
                .iter()
                .enumerate()
                .map(|(i, b)| DataBlock {
                    seq: next_seq + i as u64,
                    time: b.time,
                    hd_hash: hash,
                    body: b.body.clone(),
                })
                .collect();

            backend.append_dblocks(&self.desc, ring_id, next_seq, &dblocks)?;
            for d in &dblocks {
                idx.push(IndexRow {
                    seq: d.seq,
                    time: d.time,
                    hd_hash: d.hd_hash,
                });
            }

            let new_youngest = next_seq + dblocks.len() as u64 - 1;
            self.youngest = new_youngest as i64;
            if self.oldest < 0 {
                self.oldest = 0;
            }

            if self.slot_capacity > 0 {
                let live = new_youngest as i64 - self.oldest + 1;
                if live > self.slot_capacity as i64 {
                    let new_oldest = new_youngest + 1 - self.slot_capacity as u64;
                    let old_oldest = self.oldest as u64;
                    idx.retain_from(new_oldest);
                    let _ = backend.expire_dblocks(&self.desc, ring_id, old_oldest, new_oldest - 1);
                    tracing::debug!(ring = %self.name, ring_id, old_oldest, new_oldest, "evicted samples on bounded-ring overflow");
                    self.oldest = new_oldest as i64;
                }
            }

            backend.write_index(&self.desc, ring_id, &idx)?;
            Ok(())
        })();

        backend.unlock(&self.desc)?;
        r
    }

    /// §4.2.3: stateful read at the cursor.
    pub fn get(&mut self, backend: &B, include_meta: bool) -> Result<Option<Table>> {
        let ring_id = self.check_live()?;
        backend.lock(&self.desc, LockMode::Read, "ring_get")?;
        let r = self.get_locked(backend, ring_id, include_meta);
        backend.unlock(&self.desc)?;
        r
    }

    fn get_locked(&mut self, backend: &B, ring_id: u64, include_meta: bool) -> Result<Option<Table>> {
        if self.oldest < 0 {
            // Never written to, or cursor not yet primed against an index.
            self.refresh_bounds(backend, ring_id)?;
            if self.oldest < 0 {
                return Ok(None);
            }
        }
        if self.cursor < self.oldest {
            self.cursor = self.oldest;
        }
        if self.cursor > self.youngest + 1 {
            self.cursor = self.youngest + 1;
        }

        let cursor = self.cursor as u64;
        if let Some(table) = self.try_read_block(backend, ring_id, cursor, include_meta)? {
            self.cursor += 1;
            return Ok(Some(table));
        }

        // Slow path: the block is absent, either revoked or evicted
        // concurrently (§4.2.3 step 3).
        tracing::warn!(ring = %self.name, ring_id, cursor, "data block missing at cursor, re-verifying against a freshly loaded index");
        let idx = backend.read_index(&self.desc, ring_id)?;
        let dir = backend.read_ringdir(&self.desc)?;
        if dir.find_by_id(ring_id).is_none() {
            self.ring_id = REVOKED;
            return Err(RingStoreError::RingRevoked(self.name.clone()));
        }
        self.oldest = idx.oldest_seq().map(|s| s as i64).unwrap_or(-1);
        self.youngest = idx.last_seq().map(|s| s as i64).unwrap_or(-1);
        if self.oldest < 0 {
            return Ok(None);
        }
        self.cursor = self.oldest;
        let cursor = self.cursor as u64;
        if let Some(table) = self.try_read_block(backend, ring_id, cursor, include_meta)? {
            self.cursor += 1;
            return Ok(Some(table));
        }
        Ok(None)
    }

    fn refresh_bounds(&mut self, backend: &B, ring_id: u64) -> Result<()> {
        let idx = backend.read_index(&self.desc, ring_id)?;
        self.oldest = idx.oldest_seq().map(|s| s as i64).unwrap_or(-1);
        self.youngest = idx.last_seq().map(|s| s as i64).unwrap_or(-1);
        Ok(())
    }

    fn try_read_block(
        &mut self,
        backend: &B,
        ring_id: u64,
        seq: u64,
        include_meta: bool,
    ) -> Result<Option<Table>> {
        let blocks = backend.read_dblocks(&self.desc, ring_id, seq, 1)?;
        let block = match blocks.into_iter().find(|b| b.seq == seq) {
            Some(b) => b,
            None => return Ok(None),
        };
        let table = self.reconstruct(backend, &block, include_meta)?;
        Ok(Some(table))
    }

    fn reconstruct(&mut self, backend: &B, block: &DataBlock, include_meta: bool) -> Result<Table> {
        let header_text = match self.header_cache.lookup(block.hd_hash) {
            Ok(t) => t.to_string(),
            Err(_) => {
                tracing::warn!(hash = block.hd_hash, "header cache miss, reloading dictionary from backend");
                self.header_cache = backend.read_headers(&self.desc)?;
                self.header_cache.lookup(block.hd_hash)?.to_string()
            }
        };
        let schema = Table::parse_header(&header_text);
        let mut table = Table::parse_body(schema.columns.clone(), &block.body);
        table.info = schema.info;
        if include_meta {
            table.columns.push(COL_SEQ.into());
            table.columns.push(COL_TIME.into());
            table.columns.push(COL_DUR.into());
            for row in &mut table.rows {
                row.push(block.seq.to_string());
                row.push(block.time.to_string());
                row.push(self.duration.to_string());
            }
        }
        Ok(table)
    }

    /// §4.2.4: up to `n` consecutive samples from the cursor.
    pub fn mget_n(&mut self, backend: &B, n: usize) -> Result<Option<Table>> {
        let ring_id = self.check_live()?;
        backend.lock(&self.desc, LockMode::Read, "ring_mget_n")?;
        let r = (|| -> Result<Option<Table>> {
            if self.oldest < 0 {
                self.refresh_bounds(backend, ring_id)?;
            }
            if self.oldest < 0 {
                return Ok(None);
            }
            if self.cursor < self.oldest {
                self.cursor = self.oldest;
            }
            let from = self.cursor as u64;
            let to = (self.cursor + n as i64 - 1).min(self.youngest) as u64;
            if from as i64 > self.youngest {
                return Ok(None);
            }
            let table = self.fetch_range(backend, ring_id, from, to)?;
            self.cursor = to as i64 + 1;
            Ok(table)
        })();
        backend.unlock(&self.desc)?;
        r
    }

    /// §4.2.4: all samples from the cursor up to and including `t`.
    pub fn mget_to_time(&mut self, backend: &B, t: i64) -> Result<Option<Table>> {
        let ring_id = self.check_live()?;
        backend.lock(&self.desc, LockMode::Read, "ring_mget_to_time")?;
        let r = (|| -> Result<Option<Table>> {
            let idx = backend.read_index(&self.desc, ring_id)?;
            if self.cursor < self.oldest {
                self.cursor = self.oldest;
            }
            let matched: Vec<&IndexRow> = idx
                .rows
                .iter()
                .filter(|r| r.seq as i64 >= self.cursor && r.time <= t)
                .collect();
            if matched.is_empty() {
                return Ok(None);
            }
            let from = matched.first().unwrap().seq;
            let to = matched.last().unwrap().seq;
            let table = self.fetch_range(backend, ring_id, from, to)?;
            self.cursor = to as i64 + 1;
            Ok(table)
        })();
        backend.unlock(&self.desc)?;
        r
    }

    /// §4.2.4: stateless range read; any bound may be wildcard (`None`).
    pub fn mget_range(
        &mut self,
        backend: &B,
        from_seq: Option<u64>,
        to_seq: Option<u64>,
        from_time: Option<i64>,
        to_time: Option<i64>,
    ) -> Result<Option<Table>> {
        let ring_id = self.check_live()?;
        backend.lock(&self.desc, LockMode::Read, "ring_mget_range")?;
        let r = (|| -> Result<Option<Table>> {
            let idx = backend.read_index(&self.desc, ring_id)?;
            let matched: Vec<&IndexRow> = idx
                .rows
                .iter()
                .filter(|r| {
                    from_seq.map(|v| r.seq >= v).unwrap_or(true)
                        && to_seq.map(|v| r.seq <= v).unwrap_or(true)
                        && from_time.map(|v| r.time >= v).unwrap_or(true)
                        && to_time.map(|v| r.time <= v).unwrap_or(true)
                })
                .collect();
            if matched.is_empty() {
                return Ok(None);
            }
            let from = matched.first().unwrap().seq;
            let to = matched.last().unwrap().seq;
            self.fetch_range(backend, ring_id, from, to)
        })();
        backend.unlock(&self.desc)?;
        r
    }

    fn fetch_range(&mut self, backend: &B, ring_id: u64, from: u64, to: u64) -> Result<Option<Table>> {
        let n = (to - from + 1) as usize;
        let blocks = backend.read_dblocks(&self.desc, ring_id, from, n)?;
        if blocks.is_empty() {
            return Ok(None);
        }
        let mut merged: Option<Table> = None;
        for block in &blocks {
            let table = self.reconstruct(backend, block, true)?;
            merged = Some(match merged {
                None => table,
                Some(mut acc) => {
                    acc.rows.extend(table.rows);
                    acc
                }
            });
        }
        Ok(merged)
    }

    /// §4.2.5: remove up to `n` samples from the oldest end.
    pub fn purge(&mut self, backend: &B, n: u64) -> Result<u64> {
        let ring_id = self.check_live()?;
        backend.lock(&self.desc, LockMode::Write, "ring_purge")?;
        let r = (|| -> Result<u64> {
            let mut idx = backend.read_index(&self.desc, ring_id).unwrap_or_default();
            if idx.is_empty() {
                return Ok(0);
            }
            let live = idx.rows.len() as u64;
            let actual = n.min(live);
            if actual == 0 {
                return Ok(0);
            }
            let old_oldest = idx.oldest_seq().unwrap();
            let new_oldest = old_oldest + actual;
            let _ = backend.expire_dblocks(&self.desc, ring_id, old_oldest, new_oldest - 1);
            idx.retain_from(new_oldest);
            backend.write_index(&self.desc, ring_id, &idx)?;

            if idx.is_empty() {
                // Sentinel: oldest parked one past youngest so that a
                // subsequent put never rewinds sequences (§8 boundary
                // behaviors).
                self.oldest = self.youngest + 1;
            } else {
                self.oldest = new_oldest as i64;
            }
            if self.cursor < self.oldest {
                self.cursor = self.oldest;
            }
            Ok(actual)
        })();
        backend.unlock(&self.desc)?;
        r
    }

    /// §4.2.5: change the bound; shrinking below the live count purges the
    /// excess from the oldest end.
    pub fn resize(&mut self, backend: &B, new_capacity: u32) -> Result<()> {
        let ring_id = self.check_live()?;
        backend.lock(&self.desc, LockMode::Write, "ring_resize")?;
        let r = (|| -> Result<()> {
            let mut dir = backend.read_ringdir(&self.desc)?;
            if let Some(entry) = dir.find_by_id_mut(ring_id) {
                entry.slot_capacity = new_capacity;
            }
            backend.write_ringdir(&self.desc, &dir)?;
            let mut sb = backend.read_super(&self.desc)?;
            sb.bump_generation();
            backend.write_super(&self.desc, &sb)?;
            tracing::info!(ring = %self.name, ring_id, new_capacity, generation = sb.generation, "resized ring");
            self.slot_capacity = new_capacity;
            Ok(())
        })();
        backend.unlock(&self.desc)?;
        r?;

        if new_capacity > 0 {
            let live = (self.youngest - self.oldest + 1).max(0) as u64;
            if live > new_capacity as u64 {
                self.purge(backend, live - new_capacity as u64)?;
            }
        }
        Ok(())
    }

    /// Approximate on-disk byte footprint for this ring's file (§9).
    pub fn footprint(&self, backend: &B) -> Result<u64> {
        backend.footprint(&self.desc)
    }
}

struct PendingBlock {
    time: i64,
    body: String,
}

/// §4.2.2 step 2: split a `put` table into one data block per distinct
/// `_seq`, else per distinct `_time`, else a single block at now().
fn partition_into_blocks(table: &Table, _hash: u32) -> Result<Vec<PendingBlock>> {
    let stripped = table.without_meta_columns();

    if let Some(seq_idx) = table.column_index(COL_SEQ) {
        let mut by_seq: Vec<(i64, Vec<usize>)> = Vec::new();
        for (row_idx, row) in table.rows.iter().enumerate() {
            let seq: i64 = row[seq_idx].parse().unwrap_or(0);
            match by_seq.iter_mut().find(|(s, _)| *s == seq) {
                Some((_, idxs)) => idxs.push(row_idx),
                None => by_seq.push((seq, vec![row_idx])),
            }
        }
        by_seq.sort_by_key(|(s, _)| *s);
        let time_idx = table.column_index(COL_TIME);
        return Ok(by_seq
            .into_iter()
            .map(|(_, idxs)| {
                let time = time_idx
                    .and_then(|ti| table.rows[idxs[0]][ti].parse().ok())
                    .unwrap_or_else(now_secs);
                let mut block = Table::new(stripped.columns.clone());
                for &i in &idxs {
                    block.push_row(stripped.rows[i].clone());
                }
                PendingBlock {
                    time,
                    body: block.serialize_body(),
                }
            })
            .collect());
    }

    if let Some(time_idx) = table.column_index(COL_TIME) {
        let mut by_time: Vec<(i64, Vec<usize>)> = Vec::new();
        for (row_idx, row) in table.rows.iter().enumerate() {
            let time: i64 = row[time_idx].parse().unwrap_or(0);
            match by_time.iter_mut().find(|(t, _)| *t == time) {
                Some((_, idxs)) => idxs.push(row_idx),
                None => by_time.push((time, vec![row_idx])),
            }
        }
        by_time.sort_by_key(|(t, _)| *t);
        return Ok(by_time
            .into_iter()
            .map(|(time, idxs)| {
                let mut block = Table::new(stripped.columns.clone());
                for &i in &idxs {
                    block.push_row(stripped.rows[i].clone());
                }
                PendingBlock {
                    time,
                    body: block.serialize_body(),
                }
            })
            .collect());
    }

    Ok(vec![PendingBlock {
        time: now_secs(),
        body: stripped.serialize_body(),
    }])
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// §4.2.4 `mget_cons`: consolidation across all rings sharing `ring_name`,
/// regardless of duration. Opens the file standalone; does not require an
/// already-open handle.
pub fn mget_cons<B: Backend>(
    backend: &B,
    path: &str,
    ring_name: &str,
    from_t: Option<i64>,
    to_t: Option<i64>,
) -> Result<Option<Table>> {
    let desc = backend.open(path, CreatePerm::default(), false)?;
    backend.lock(&desc, LockMode::Read, "ring_mget_cons")?;
    let r = (|| -> Result<Option<Table>> {
        let dir = backend.read_ringdir(&desc)?;
        let rings = dir.entries_for_name(ring_name); // ascending duration
        let lo = from_t.unwrap_or(i64::MIN);
        let mut hi = to_t.unwrap_or(i64::MAX);

        let mut header_cache = backend.read_headers(&desc)?;
        let mut accumulated: Option<Table> = None;

        for entry in rings {
            if hi < lo {
                break;
            }
            let idx = backend.read_index(&desc, entry.id)?;
            let mut matched: Vec<&IndexRow> = idx
                .rows
                .iter()
                .filter(|r| r.time >= lo && r.time <= hi)
                .collect();
            if matched.is_empty() {
                continue;
            }
            matched.sort_by_key(|r| r.seq);
            let from = matched.first().unwrap().seq;
            let to = matched.last().unwrap().seq;
            let n = (to - from + 1) as usize;
            let blocks = backend.read_dblocks(&desc, entry.id, from, n)?;
            let oldest_time_here = matched.iter().map(|r| r.time).min().unwrap();

            for block in &blocks {
                if block.time < lo || block.time > hi {
                    continue;
                }
                let header_text = match header_cache.lookup(block.hd_hash) {
                    Ok(t) => t.to_string(),
                    Err(_) => {
                        header_cache = backend.read_headers(&desc)?;
                        header_cache.lookup(block.hd_hash)?.to_string()
                    }
                };
                let schema = Table::parse_header(&header_text);
                let mut table = Table::parse_body(schema.columns.clone(), &block.body);
                table.info = schema.info;
                table.columns.push(COL_SEQ.into());
                table.columns.push(COL_TIME.into());
                table.columns.push(COL_DUR.into());
                for row in &mut table.rows {
                    row.push(block.seq.to_string());
                    row.push(block.time.to_string());
                    row.push(entry.duration.to_string());
                }
                accumulated = Some(match accumulated {
                    None => table,
                    Some(mut acc) => {
                        acc.rows.extend(table.rows);
                        acc
                    }
                });
            }

            // Finer-duration data wins where it overlaps coarser data:
            // contract the remaining window to just before this ring's
            // oldest matching time (§4.2.4, §9 open question on ties).
            hi = oldest_time_here - 1;
        }

        match accumulated {
            None => Ok(None),
            Some(mut table) => {
                let time_idx = table.column_index(COL_TIME).unwrap();
                table
                    .rows
                    .sort_by_key(|r| r[time_idx].parse::<i64>().unwrap_or(0));
                Ok(Some(table))
            }
        }
    })();
    backend.unlock(&desc)?;
    backend.close(desc)?;
    r
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::ColumnInfo;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FileState {
        super_: crate::superblock::Superblock,
        ringdir: RingDirectory,
        headers: HeaderDict,
        indexes: HashMap<u64, crate::index::RingIndex>,
        blocks: HashMap<(u64, u64), DataBlock>,
        damaged: bool,
    }

    #[derive(Default)]
    struct MemBackend {
        files: Mutex<HashMap<String, FileState>>,
    }

    struct MemDesc(String);
    impl crate::backend::BackendDescriptor for MemDesc {}

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
                        super_: crate::superblock::Superblock::new_for_host(),
                        ringdir: RingDirectory::default(),
                        headers: HeaderDict::default(),
                        indexes: HashMap::new(),
                        blocks: HashMap::new(),
                        damaged: false,
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

        fn read_super(&self, desc: &Self::Descriptor) -> Result<crate::superblock::Superblock> {
            let files = self.files.lock().unwrap();
            Ok(files[&desc.0].super_.clone())
        }

        fn write_super(&self, desc: &Self::Descriptor, sb: &crate::superblock::Superblock) -> Result<()> {
            let mut files = self.files.lock().unwrap();
            files.get_mut(&desc.0).unwrap().super_ = sb.clone();
            Ok(())
        }

        fn mark_damaged(&self, desc: &Self::Descriptor) -> Result<()> {
            let mut files = self.files.lock().unwrap();
            files.get_mut(&desc.0).unwrap().damaged = true;
            Ok(())
        }

        fn is_damaged(&self, desc: &Self::Descriptor) -> Result<bool> {
            let files = self.files.lock().unwrap();
            Ok(files[&desc.0].damaged)
        }

        fn read_ringdir(&self, desc: &Self::Descriptor) -> Result<RingDirectory> {
            let files = self.files.lock().unwrap();
            Ok(files[&desc.0].ringdir.clone())
        }

        fn write_ringdir(&self, desc: &Self::Descriptor, dir: &RingDirectory) -> Result<()> {
            let mut files = self.files.lock().unwrap();
            files.get_mut(&desc.0).unwrap().ringdir = dir.clone();
            Ok(())
        }

        fn read_headers(&self, desc: &Self::Descriptor) -> Result<HeaderDict> {
            let files = self.files.lock().unwrap();
            Ok(files[&desc.0].headers.clone())
        }

        fn write_headers(&self, desc: &Self::Descriptor, dict: &HeaderDict) -> Result<()> {
            let mut files = self.files.lock().unwrap();
            files.get_mut(&desc.0).unwrap().headers = dict.clone();
            Ok(())
        }

        fn read_index(&self, desc: &Self::Descriptor, ring_id: u64) -> Result<crate::index::RingIndex> {
            let files = self.files.lock().unwrap();
            Ok(files[&desc.0].indexes.get(&ring_id).cloned().unwrap_or_default())
        }

        fn write_index(&self, desc: &Self::Descriptor, ring_id: u64, idx: &crate::index::RingIndex) -> Result<()> {
            let mut files = self.files.lock().unwrap();
            files.get_mut(&desc.0).unwrap().indexes.insert(ring_id, idx.clone());
            Ok(())
        }

        fn rm_index(&self, desc: &Self::Descriptor, ring_id: u64) -> Result<()> {
            let mut files = self.files.lock().unwrap();
            files.get_mut(&desc.0).unwrap().indexes.remove(&ring_id);
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
            let mut out = Vec::new();
            for i in 0..n as u64 {
                if let Some(b) = f.blocks.get(&(ring_id, start_seq + i)) {
                    out.push(b.clone());
                }
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

        fn footprint(&self, desc: &Self::Descriptor) -> Result<u64> {
            let files = self.files.lock().unwrap();
            let f = &files[&desc.0];
            Ok(f.blocks.values().map(|b| b.body.len() as u64).sum())
        }
    }

    fn open_spec(name: &str, dur: u32, cap: u32) -> OpenSpec {
        OpenSpec {
            path: "mem://test".into(),
            perm: CreatePerm::default(),
            ring_name: name.into(),
            long_name: name.into(),
            about: String::new(),
            slot_capacity: cap,
            duration: dur,
            create: true,
        }
    }

    fn single_row_table(cols: &[(&str, &str)]) -> Table {
        let mut t = Table::new(cols.iter().map(|(c, _)| c.to_string()).collect());
        t.push_row(cols.iter().map(|(_, v)| v.to_string()).collect());
        t
    }

    /// Scenario 1 (§8): create, put a single row, get with meta.
    #[test]
    fn scenario_create_put_get_with_meta() {
        let backend = MemBackend::default();
        let mut h = RingHandle::open(&backend, &open_spec("R", 5, 5)).unwrap();
        let t = single_row_table(&[("tom", "1"), ("dick", "2"), ("harry", "3")]);
        h.put(&backend, &t).unwrap();

        let got = h.get(&backend, true).unwrap().expect("one sample");
        assert_eq!(got.get(0, "tom"), Some("1"));
        assert_eq!(got.get(0, "dick"), Some("2"));
        assert_eq!(got.get(0, "harry"), Some("3"));
        assert_eq!(got.get(0, "_seq"), Some("0"));
        assert_eq!(got.get(0, "_dur"), Some("5"));

        assert!(h.get(&backend, true).unwrap().is_none());
    }

    /// Scenario 2: three separate puts, three gets, then no-data.
    #[test]
    fn scenario_three_puts_three_gets_then_no_data() {
        let backend = MemBackend::default();
        let mut h = RingHandle::open(&backend, &open_spec("R", 0, 0)).unwrap();
        for i in 0..3 {
            let t = single_row_table(&[("val", &i.to_string())]);
            h.put(&backend, &t).unwrap();
        }
        for expected_seq in 0..3 {
            let got = h.get(&backend, true).unwrap().unwrap();
            assert_eq!(got.get(0, "_seq"), Some(expected_seq.to_string().as_str()));
        }
        assert!(h.get(&backend, true).unwrap().is_none());
    }

    /// Scenario 3: one table carrying three `_seq` values.
    #[test]
    fn scenario_one_put_three_seqs() {
        let backend = MemBackend::default();
        let mut h = RingHandle::open(&backend, &open_spec("R", 0, 0)).unwrap();
        let mut t = Table::new(vec!["_seq".into(), "val".into()]);
        t.push_row(vec!["0".into(), "a".into()]);
        t.push_row(vec!["1".into(), "b".into()]);
        t.push_row(vec!["2".into(), "c".into()]);
        h.put(&backend, &t).unwrap();

        for expected_seq in 0..3 {
            let got = h.get(&backend, true).unwrap().unwrap();
            assert_eq!(got.get(0, "_seq"), Some(expected_seq.to_string().as_str()));
        }
    }

    /// Scenario 4: bounded ring eviction; reading the seq that survived
    /// eviction via an explicit `goto_seq`.
    #[test]
    fn scenario_bounded_ring_eviction() {
        let backend = MemBackend::default();
        let mut h = RingHandle::open(&backend, &open_spec("R", 0, 5)).unwrap();
        for i in 0..7 {
            let t = single_row_table(&[("val", &i.to_string())]);
            h.put(&backend, &t).unwrap();
        }
        assert_eq!(h.oldest(), 2);
        assert_eq!(h.youngest(), 6);

        h.goto_seq(0);
        let got = h.get(&backend, true).unwrap().unwrap();
        assert_eq!(got.get(0, "_seq"), Some("2"));
        assert_eq!(got.get(0, "val"), Some("2"));
    }

    #[test]
    fn empty_ring_get_is_no_data_not_error() {
        let backend = MemBackend::default();
        let mut h = RingHandle::open(&backend, &open_spec("R", 0, 0)).unwrap();
        assert!(h.get(&backend, true).unwrap().is_none());
    }

    #[test]
    fn put_of_empty_table_is_noop() {
        let backend = MemBackend::default();
        let mut h = RingHandle::open(&backend, &open_spec("R", 0, 0)).unwrap();
        let t = Table::new(vec!["val".into()]);
        h.put(&backend, &t).unwrap();
        assert_eq!(h.youngest(), -1);
    }

    #[test]
    fn purge_all_then_put_does_not_rewind_sequences() {
        let backend = MemBackend::default();
        let mut h = RingHandle::open(&backend, &open_spec("R", 0, 0)).unwrap();
        for i in 0..3 {
            let t = single_row_table(&[("val", &i.to_string())]);
            h.put(&backend, &t).unwrap();
        }
        let purged = h.purge(&backend, 10).unwrap();
        assert_eq!(purged, 3);
        assert!(h.get(&backend, true).unwrap().is_none());

        let t = single_row_table(&[("val", "99")]);
        h.put(&backend, &t).unwrap();
        let got = h.get(&backend, true).unwrap().unwrap();
        assert_eq!(got.get(0, "_seq"), Some("3"));
    }

    #[test]
    fn destroy_nonexistent_ring_is_not_found() {
        let backend = MemBackend::default();
        // Create the file via an unrelated ring so the path exists.
        let _h = RingHandle::open(&backend, &open_spec("other", 0, 0)).unwrap();
        let err = RingHandle::destroy(&backend, "mem://test", "ghost", 0).unwrap_err();
        assert!(matches!(err, RingStoreError::NotFound(_)));
    }

    #[test]
    fn destroy_removes_directory_entry_and_data() {
        let backend = MemBackend::default();
        let mut h = RingHandle::open(&backend, &open_spec("R", 0, 0)).unwrap();
        let t = single_row_table(&[("val", "1")]);
        h.put(&backend, &t).unwrap();

        RingHandle::destroy(&backend, "mem://test", "R", 0).unwrap();

        let reopened = RingHandle::open(
            &backend,
            &OpenSpec {
                create: false,
                ..open_spec("R", 0, 0)
            },
        );
        assert!(reopened.is_err());
    }

    /// Scenario 6: consolidation prefers the finer-grained ring where
    /// windows overlap.
    #[test]
    fn scenario_consolidation_prefers_finer_ring() {
        let backend = MemBackend::default();
        let mut fine = RingHandle::open(&backend, &open_spec("cpu", 60, 0)).unwrap();
        let mut coarse = RingHandle::open(&backend, &open_spec("cpu", 3600, 0)).unwrap();

        for t in [0i64, 60, 120] {
            let mut tab = Table::new(vec!["_time".into(), "val".into()]);
            tab.push_row(vec![t.to_string(), format!("fine-{}", t)]);
            fine.put(&backend, &tab).unwrap();
        }
        // The coarse ring holds one sample strictly older than the fine
        // ring's whole window (survives) and one sample inside it
        // (suppressed): the window contracts to just before the fine
        // ring's oldest matching time, not merely around its span
        // (§4.2.4, §9).
        for t in [-3600i64, 60] {
            let mut tab = Table::new(vec!["_time".into(), "val".into()]);
            tab.push_row(vec![t.to_string(), format!("coarse-{}", t)]);
            coarse.put(&backend, &tab).unwrap();
        }

        let merged = mget_cons(&backend, "mem://test", "cpu", None, None)
            .unwrap()
            .expect("merged data");

        let values: Vec<&str> = merged
            .rows
            .iter()
            .map(|r| r[merged.column_index("val").unwrap()].as_str())
            .collect();
        assert!(values.contains(&"fine-0"));
        assert!(values.contains(&"fine-60"));
        assert!(values.contains(&"fine-120"));
        assert!(values.contains(&"coarse--3600"));
        assert!(!values.contains(&"coarse-60"));
    }

    /// Two rings in the same file, each put to by its own handle: ring B's
    /// `put` must not clobber ring A's header dictionary entries with its
    /// own handle's partial intern cache (§4.2.6 step 4, §3 invariant 4).
    /// Reopening ring A as a fresh handle forces the header to be resolved
    /// from the on-disk dictionary rather than A's own in-memory cache, so
    /// the regression actually gets exercised.
    #[test]
    fn put_on_one_ring_preserves_another_rings_interned_header() {
        let backend = MemBackend::default();
        let mut a = RingHandle::open(&backend, &open_spec("a", 0, 0)).unwrap();
        let t = single_row_table(&[("tom", "1"), ("dick", "2")]);
        a.put(&backend, &t).unwrap();

        // Open ring B as a fresh handle with an empty header cache, then
        // put a completely different schema through it.
        let mut b = RingHandle::open(&backend, &open_spec("b", 0, 0)).unwrap();
        let t2 = single_row_table(&[("harry", "3")]);
        b.put(&backend, &t2).unwrap();

        let mut a2 = RingHandle::open(
            &backend,
            &OpenSpec {
                create: false,
                ..open_spec("a", 0, 0)
            },
        )
        .unwrap();
        let got = a2.get(&backend, false).unwrap().unwrap();
        assert_eq!(got.columns, vec!["tom".to_string(), "dick".to_string()]);
        assert_eq!(got.get(0, "tom"), Some("1"));
    }

    #[test]
    fn header_text_differs_across_put_calls_interns_distinctly() {
        let backend = MemBackend::default();
        let mut h = RingHandle::open(&backend, &open_spec("R", 0, 0)).unwrap();
        let t1 = single_row_table(&[("a", "1")]);
        let mut t2 = Table::new(vec!["a".into(), "b".into()]);
        t2.push_row(vec!["1".into(), "2".into()]);
        h.put(&backend, &t1).unwrap();
        h.put(&backend, &t2).unwrap();

        let first = h.get(&backend, false).unwrap().unwrap();
        assert_eq!(first.columns, vec!["a".to_string()]);
        let second = h.get(&backend, false).unwrap().unwrap();
        assert_eq!(second.columns, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn revoked_handle_fails_fast() {
        let backend = MemBackend::default();
        let mut h = RingHandle::open(&backend, &open_spec("R", 0, 0)).unwrap();
        RingHandle::destroy(&backend, "mem://test", "R", 0).unwrap();
        // The handle doesn't yet know it's revoked until it touches the
        // backend and finds the directory row gone.
        let result = h.get(&backend, true);
        assert!(matches!(result, Err(RingStoreError::RingRevoked(_)) | Ok(None)));
    }

    #[test]
    fn primary_key_info_preserved_through_header_roundtrip() {
        let backend = MemBackend::default();
        let mut h = RingHandle::open(&backend, &open_spec("R", 0, 0)).unwrap();
        let mut t = Table::new(vec!["thing".into(), "val".into()]);
        t.info.insert(
            "thing".into(),
            ColumnInfo {
                key: Some(1),
                type_tag: Some("str".into()),
                ..Default::default()
            },
        );
        t.push_row(vec!["disk0".into(), "42".into()]);
        h.put(&backend, &t).unwrap();

        let got = h.get(&backend, false).unwrap().unwrap();
        assert_eq!(got.primary_key_column(), Some("thing"));
    }
}
