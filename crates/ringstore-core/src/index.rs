//! The per-ring index: an ordered `(seq, time, header_hash)` sequence
//! persisted under a key derived from the ring id (§3, §6).

/// One index row. `seq` is strictly increasing within a ring; `time` is
/// non-decreasing in normal use but the engine tolerates non-monotonic time
/// (§3).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexRow {
    pub seq: u64,
    pub time: i64,
    pub hd_hash: u32,
}

/// A ring's full index, in seq order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RingIndex {
    pub rows: Vec<IndexRow>,
}

impl RingIndex {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.rows.last().map(|r| r.seq)
    }

    pub fn oldest_seq(&self) -> Option<u64> {
        self.rows.first().map(|r| r.seq)
    }

    pub fn find(&self, seq: u64) -> Option<&IndexRow> {
        // Index rows are seq-ordered and seq is strictly increasing, so a
        // binary search is valid; fall back to linear for any drift.
        self.rows
            .binary_search_by_key(&seq, |r| r.seq)
            .ok()
            .map(|i| &self.rows[i])
    }

    pub fn push(&mut self, row: IndexRow) {
        self.rows.push(row);
    }

    /// Drops rows with `seq < floor`, oldest-first. Used by eviction on
    /// bounded-ring overflow and by explicit purge (§4.2.2, §4.2.5).
    pub fn retain_from(&mut self, floor: u64) {
        self.rows.retain(|r| r.seq >= floor);
    }

    /// Rows whose seq lies in `[from, to]` inclusive (both bounds
    /// inclusive; caller resolves wildcards to concrete bounds first).
    pub fn rows_in_seq_range(&self, from: u64, to: u64) -> Vec<&IndexRow> {
        self.rows
            .iter()
            .filter(|r| r.seq >= from && r.seq <= to)
            .collect()
    }

    /// Rows whose time lies in `[from, to]` inclusive.
    pub fn rows_in_time_range(&self, from: i64, to: i64) -> Vec<&IndexRow> {
        self.rows
            .iter()
            .filter(|r| r.time >= from && r.time <= to)
            .collect()
    }

    pub fn serialize(&self) -> String {
        let mut out = String::from("seq\ttime\thd_hash\n");
        for r in &self.rows {
            out.push_str(&format!("{}\t{}\t{}\n", r.seq, r.time, r.hd_hash));
        }
        out
    }

    pub fn parse(text: &str) -> Self {
        let mut lines = text.lines();
        lines.next(); // header row
        let mut rows = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let f: Vec<&str> = line.split('\t').collect();
            if f.len() != 3 {
                continue;
            }
            if let (Ok(seq), Ok(time), Ok(hd_hash)) =
                (f[0].parse(), f[1].parse(), f[2].parse())
            {
                rows.push(IndexRow { seq, time, hd_hash });
            }
        }
        Self { rows }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RingIndex {
        RingIndex {
            rows: vec![
                IndexRow { seq: 0, time: 100, hd_hash: 7 },
                IndexRow { seq: 1, time: 105, hd_hash: 7 },
                IndexRow { seq: 2, time: 110, hd_hash: 8 },
            ],
        }
    }

    #[test]
    fn roundtrip() {
        let idx = sample();
        let text = idx.serialize();
        assert_eq!(RingIndex::parse(&text), idx);
    }

    #[test]
    fn find_by_seq() {
        let idx = sample();
        assert_eq!(idx.find(1).unwrap().time, 105);
        assert!(idx.find(9).is_none());
    }

    #[test]
    fn retain_from_drops_older_rows() {
        let mut idx = sample();
        idx.retain_from(1);
        assert_eq!(idx.rows.len(), 2);
        assert_eq!(idx.oldest_seq(), Some(1));
    }

    #[test]
    fn seq_and_time_range_filters() {
        let idx = sample();
        assert_eq!(idx.rows_in_seq_range(1, 2).len(), 2);
        assert_eq!(idx.rows_in_time_range(0, 104).len(), 1);
    }
}
