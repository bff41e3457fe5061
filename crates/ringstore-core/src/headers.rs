//! The header dictionary: an interning table mapping a 32-bit hash to a
//! serialized `(column-header-line, info-sidecar)` pair (§3, §4.2.6).
//!
//! Collisions are resolved by linear probing (`hash+1`, `hash+2`, …) until
//! an unused slot is found; an inserted mapping is then immutable. This
//! mirrors the original `rs_priv_header_to_hash`/`rs_priv_hash_to_header`
//! pair: hash, probe while the slot holds different text, insert on miss.

use std::collections::BTreeMap;

use crate::error::{Result, RingStoreError};

/// Upper bound on probe attempts before giving up with `Corrupt` (§9, open
/// question on unbounded-collision looping).
const MAX_PROBES: u32 = 10_000;

/// Deterministic string hash, 32-bit. Same CRC-32 the backend's on-disk
/// record layout already pulls in for block checksums (§4.1), reused here
/// rather than hand-rolling a second hash.
pub fn hash_str(s: &str) -> u32 {
    crc32fast::hash(s.as_bytes())
}

/// The on-disk/in-memory header dictionary: hash -> serialized header text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderDict {
    pub entries: BTreeMap<u32, String>,
}

impl HeaderDict {
    pub fn serialize(&self) -> String {
        self.entries
            .iter()
            .map(|(h, t)| format!("{}|{}", h, t))
            .collect::<Vec<_>>()
            .join("\u{1}")
    }

    pub fn parse(text: &str) -> Self {
        let mut entries = BTreeMap::new();
        if text.is_empty() {
            return Self { entries };
        }
        for chunk in text.split('\u{1}') {
            if chunk.is_empty() {
                continue;
            }
            if let Some((h, t)) = chunk.split_once('|') {
                if let Ok(hash) = h.parse::<u32>() {
                    entries.insert(hash, t.to_string());
                }
            }
        }
        Self { entries }
    }

    /// Interns `text`, probing past collisions with distinct text, and
    /// returns the slot's hash. Mutates `self` on a genuine miss; callers
    /// are responsible for persisting the dictionary afterward (§4.2.6).
    pub fn intern(&mut self, text: &str) -> Result<u32> {
        let mut hash = hash_str(text);
        for _ in 0..MAX_PROBES {
            match self.entries.get(&hash) {
                Some(existing) if existing == text => return Ok(hash),
                Some(_) => hash = hash.wrapping_add(1),
                None => {
                    self.entries.insert(hash, text.to_string());
                    return Ok(hash);
                }
            }
        }
        Err(RingStoreError::Corrupt(
            "header dictionary probe exceeded bound".into(),
        ))
    }

    /// Looks up previously-interned text by hash. Returns `NotFound` if the
    /// slot is absent; callers reload from the backend once before giving
    /// up (§4.2.6, §7).
    pub fn lookup(&self, hash: u32) -> Result<&str> {
        self.entries
            .get(&hash)
            .map(|s| s.as_str())
            .ok_or_else(|| RingStoreError::NotFound(format!("header hash {}", hash)))
    }
}
