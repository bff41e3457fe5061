//! The ring directory: the set of all rings' attributes in a file,
//! materialized as a small table under the reserved `ringdir` key (§3, §6).

use crate::error::Result;

/// One ring's durable attributes. `(name, duration)` is the identity pair;
/// `id` is assigned once from the superblock's `ring_counter` and never
/// reused, even across a rename.
#[derive(Debug, Clone, PartialEq)]
pub struct RingDirEntry {
    pub name: String,
    pub duration: u32,
    pub id: u64,
    pub long_name: String,
    pub about: String,
    /// 0 = unbounded queue; >0 = bounded ring buffer capacity.
    pub slot_capacity: u32,
}

/// All ring-directory rows in a file. Rewritten wholesale on every
/// create/destroy/rename/resize (§3).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RingDirectory {
    pub entries: Vec<RingDirEntry>,
}

impl RingDirectory {
    pub fn find(&self, name: &str, duration: u32) -> Option<&RingDirEntry> {
        self.entries
            .iter()
            .find(|e| e.name == name && e.duration == duration)
    }

    pub fn find_by_id(&self, id: u64) -> Option<&RingDirEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn find_by_id_mut(&mut self, id: u64) -> Option<&mut RingDirEntry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }

    pub fn remove_by_id(&mut self, id: u64) -> Option<RingDirEntry> {
        let idx = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(idx))
    }

    /// All distinct ring names across every duration (§4.2.10, consolidation
    /// ring listing).
    pub fn distinct_names(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for e in &self.entries {
            if !seen.contains(&e.name) {
                seen.push(e.name.clone());
            }
        }
        seen
    }

    /// All entries sharing a name, regardless of duration, in ascending
    /// duration order (consolidation read order, §4.2.4).
    pub fn entries_for_name(&self, name: &str) -> Vec<&RingDirEntry> {
        let mut v: Vec<&RingDirEntry> = self.entries.iter().filter(|e| e.name == name).collect();
        v.sort_by_key(|e| e.duration);
        v
    }

    pub fn serialize(&self) -> String {
        let mut out = String::from("name\tdur\tid\tlong\tabout\tnslots\n");
        for e in &self.entries {
            out.push_str(&format!(
                "{}\t{}\t{}\t{}\t{}\t{}\n",
                e.name, e.duration, e.id, e.long_name, e.about, e.slot_capacity
            ));
        }
        out
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines();
        lines.next(); // header row
        let mut entries = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let f: Vec<&str> = line.split('\t').collect();
            if f.len() != 6 {
                continue;
            }
            entries.push(RingDirEntry {
                name: f[0].to_string(),
                duration: f[1].parse().unwrap_or(0),
                id: f[2].parse().unwrap_or(0),
                long_name: f[3].to_string(),
                about: f[4].to_string(),
                slot_capacity: f[5].parse().unwrap_or(0),
            });
        }
        Ok(Self { entries })
    }
}
