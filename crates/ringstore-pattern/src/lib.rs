//! The pattern operator (§4.5): periodically stats watched sources,
//! reads the delta as line-oriented text on change, applies compiled
//! regular expressions, and raises embargoed events on match.
//!
//! Only the matching and embargo logic is implemented here; the
//! method-dispatch shell that executes a raised event's action is out of
//! scope (§1).

use std::collections::HashMap;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("invalid regex {pattern:?}: {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

pub type Result<T> = std::result::Result<T, PatternError>;

/// A snapshot of a watched source's change-detection fields (§4.5: "stats
/// each watched source ... by mtime/seq/size"). Backend-agnostic: the
/// concrete stat call is made by whatever reads the source's URL, outside
/// this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceStat {
    pub mtime: i64,
    pub seq: u64,
    pub size: u64,
}

/// Tracks one watched source's last-seen stat, to decide whether there is
/// new content to read (§4.5).
#[derive(Debug, Clone, Default)]
pub struct WatchedSource {
    pub key: String,
    pub last_stat: SourceStat,
}

impl WatchedSource {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            last_stat: SourceStat::default(),
        }
    }

    /// Returns `true` if `current` differs from the last-seen stat in any
    /// of mtime/seq/size, and records `current` as the new baseline.
    pub fn changed(&mut self, current: SourceStat) -> bool {
        let changed = current != self.last_stat;
        self.last_stat = current;
        changed
    }

    /// On shrinkage (size decreased), the entire current content is
    /// treated as new rather than a delta (§4.5 "behavior on source
    /// shrinkage").
    pub fn treat_whole_as_new(&self, current: SourceStat) -> bool {
        current.size < self.last_stat.size
    }
}

/// One compiled pattern with its embargo policy (§4.5, original
/// `struct pattern_action`).
pub struct PatternAction {
    pub text: String,
    regex: Regex,
    /// Minimum interval, in whatever time unit the caller's clock uses,
    /// that must pass since the last raise before another is allowed.
    pub embargo_interval: i64,
    /// Minimum number of matches that must accumulate since the last raise
    /// before another is allowed. Either condition, if configured, can
    /// gate the raise; both are satisfied independently (§4.5).
    pub embargo_count: u32,
    last_raised_at: Option<i64>,
    matches_since_raise: u32,
}

impl PatternAction {
    pub fn new(text: &str, embargo_interval: i64, embargo_count: u32) -> Result<Self> {
        let regex = Regex::new(text).map_err(|source| PatternError::Regex {
            pattern: text.to_string(),
            source,
        })?;
        Ok(Self {
            text: text.to_string(),
            regex,
            embargo_interval,
            embargo_count,
            last_raised_at: None,
            matches_since_raise: 0,
        })
    }

    /// Feeds one line of text at time `now`; returns `true` if this line
    /// caused an event to be raised (i.e. it matched and the embargo
    /// allowed it through).
    pub fn feed_line(&mut self, line: &str, now: i64) -> bool {
        if !self.regex.is_match(line) {
            return false;
        }
        self.matches_since_raise += 1;

        let interval_ok = match self.last_raised_at {
            None => true,
            Some(last) => now - last >= self.embargo_interval,
        };
        let count_ok = self.embargo_count == 0 || self.matches_since_raise >= self.embargo_count;

        if interval_ok && count_ok {
            self.last_raised_at = Some(now);
            self.matches_since_raise = 0;
            true
        } else {
            false
        }
    }
}

/// Applies every pattern in `patterns` to every line in `text`, returning
/// the patterns (by index) that raised an event on this delta (§4.5).
pub fn match_delta(patterns: &mut [PatternAction], text: &str, now: i64) -> Vec<usize> {
    let mut raised = Vec::new();
    for line in text.lines() {
        for (idx, pattern) in patterns.iter_mut().enumerate() {
            if pattern.feed_line(line, now) {
                raised.push(idx);
            }
        }
    }
    raised
}

/// The set of sources being watched, keyed by their address (§4.5
/// "watchlist").
#[derive(Default)]
pub struct WatchList {
    sources: HashMap<String, WatchedSource>,
}

impl WatchList {
    pub fn watch(&mut self, key: &str) {
        self.sources
            .entry(key.to_string())
            .or_insert_with(|| WatchedSource::new(key));
    }

    pub fn unwatch(&mut self, key: &str) {
        self.sources.remove(key);
    }

    /// Records a new stat observation for `key`; returns `Changed` if
    /// content appears to have moved, `Shrunk` if the source shrank (read
    /// it whole rather than delta), or `Unchanged`.
    pub fn observe(&mut self, key: &str, current: SourceStat) -> ChangeKind {
        let entry = self
            .sources
            .entry(key.to_string())
            .or_insert_with(|| WatchedSource::new(key));
        if entry.treat_whole_as_new(current) {
            entry.last_stat = current;
            return ChangeKind::Shrunk;
        }
        if entry.changed(current) {
            ChangeKind::Changed
        } else {
            ChangeKind::Unchanged
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Unchanged,
    Changed,
    Shrunk,
}
