//! The replicator (§4.6): a stateless function of (state, directives),
//! where the state is itself a single-slot ring. On each tick, every
//! directive of the form `A<B` (inbound) or `A>B` (outbound) is applied
//! against the replication-state table and the local/remote rings it
//! names.
//!
//! Each call is a stateless replication of one `from>to`/`to<from` directive
//! against a state table; catching a relationship up uses the same
//! aggregate-since-last-seq shape `ringstore-catchup` implements for its
//! session state.

use ringstore_core::backend::Backend;
use ringstore_core::error::Result;
use ringstore_core::ring::RingHandle;
use ringstore_core::table::Table;

/// One row of the replication-state table (§4.6).
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipState {
    pub relationship: String,
    pub local_ring: String,
    pub remote_ring: String,
    pub last_local_seq: u64,
    pub last_remote_seq: u64,
    pub youngest_replicated_time: i64,
    pub last_attempt_time: i64,
}

impl RelationshipState {
    pub fn new(relationship: &str, local_ring: &str, remote_ring: &str) -> Self {
        Self {
            relationship: relationship.to_string(),
            local_ring: local_ring.to_string(),
            remote_ring: remote_ring.to_string(),
            last_local_seq: 0,
            last_remote_seq: 0,
            youngest_replicated_time: 0,
            last_attempt_time: 0,
        }
    }
}

/// The full replication-state table, persisted in a dedicated single-slot
/// ring; this crate only models the table shape, not the ring I/O (that's
/// an ordinary `RingHandle::put`/`get` round trip the caller performs).
#[derive(Debug, Clone, Default)]
pub struct ReplicationState {
    pub relationships: Vec<RelationshipState>,
}

impl ReplicationState {
    pub fn find_mut(&mut self, relationship: &str) -> Option<&mut RelationshipState> {
        self.relationships
            .iter_mut()
            .find(|r| r.relationship == relationship)
    }

    pub fn find_or_insert(&mut self, relationship: &str, local: &str, remote: &str) -> &mut RelationshipState {
        if !self.relationships.iter().any(|r| r.relationship == relationship) {
            self.relationships
                .push(RelationshipState::new(relationship, local, remote));
        }
        self.find_mut(relationship).unwrap()
    }

    pub fn to_table(&self) -> Table {
        let mut t = Table::new(vec![
            "relationship".into(),
            "local_ring".into(),
            "remote_ring".into(),
            "last_local_seq".into(),
            "last_remote_seq".into(),
            "youngest_replicated_time".into(),
            "last_attempt_time".into(),
        ]);
        for r in &self.relationships {
            t.push_row(vec![
                r.relationship.clone(),
                r.local_ring.clone(),
                r.remote_ring.clone(),
                r.last_local_seq.to_string(),
                r.last_remote_seq.to_string(),
                r.youngest_replicated_time.to_string(),
                r.last_attempt_time.to_string(),
            ]);
        }
        t
    }

    pub fn from_table(table: &Table) -> Self {
        let mut relationships = Vec::new();
        for row in &table.rows {
            let get = |col: &str| -> Option<&str> {
                table.column_index(col).map(|i| row[i].as_str())
            };
            relationships.push(RelationshipState {
                relationship: get("relationship").unwrap_or("").to_string(),
                local_ring: get("local_ring").unwrap_or("").to_string(),
                remote_ring: get("remote_ring").unwrap_or("").to_string(),
                last_local_seq: get("last_local_seq").and_then(|v| v.parse().ok()).unwrap_or(0),
                last_remote_seq: get("last_remote_seq").and_then(|v| v.parse().ok()).unwrap_or(0),
                youngest_replicated_time: get("youngest_replicated_time")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
                last_attempt_time: get("last_attempt_time").and_then(|v| v.parse().ok()).unwrap_or(0),
            });
        }
        Self { relationships }
    }
}

/// A parsed directive: `A<B` (inbound, pull `B` into `A`) or `A>B`
/// (outbound, push `A` to `B`), §4.6.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Inbound { local: String, remote: String },
    Outbound { local: String, remote: String },
}

impl Directive {
    pub fn parse(text: &str) -> Option<Self> {
        if let Some((local, remote)) = text.split_once('<') {
            return Some(Directive::Inbound {
                local: local.trim().to_string(),
                remote: remote.trim().to_string(),
            });
        }
        if let Some((local, remote)) = text.split_once('>') {
            return Some(Directive::Outbound {
                local: local.trim().to_string(),
                remote: remote.trim().to_string(),
            });
        }
        None
    }

    pub fn relationship_key(&self) -> String {
        match self {
            Directive::Inbound { local, remote } => format!("{}<{}", local, remote),
            Directive::Outbound { local, remote } => format!("{}>{}", local, remote),
        }
    }
}

/// Applies one inbound directive: pulls everything past `last_remote_seq`
/// from `remote` into `local`, preserving original sequences as a
/// partition (§4.6). The local ring must already be open with `create`
/// set if it might not exist yet; inheriting the remote's description and
/// capacity on creation is the caller's responsibility at open time, since
/// that's plain `OpenSpec` construction, not replication logic.
pub fn apply_inbound<B: Backend>(
    backend: &B,
    state: &mut RelationshipState,
    remote: &mut RingHandle<B>,
    local: &mut RingHandle<B>,
    now: i64,
) -> Result<usize> {
    state.last_attempt_time = now;
    let batch = remote.mget_range(backend, Some(state.last_remote_seq + 1), None, None, None)?;
    let table = match batch {
        Some(t) if !t.is_empty() => t,
        _ => return Ok(0),
    };

    let seq_idx = table.column_index("_seq");
    let time_idx = table.column_index("_time");
    let count = table.rows.len();

    local.put(backend, &table)?;

    if let Some(idx) = seq_idx {
        if let Some(max_seq) = table.rows.iter().filter_map(|r| r[idx].parse::<u64>().ok()).max() {
            state.last_remote_seq = max_seq;
        }
    }
    if let Some(idx) = time_idx {
        if let Some(max_t) = table.rows.iter().filter_map(|r| r[idx].parse::<i64>().ok()).max() {
            state.youngest_replicated_time = max_t;
        }
    }
    Ok(count)
}

/// Applies one outbound directive: pushes everything past `last_local_seq`
/// from `local` to `remote`. The remote-side status parse that recovers
/// the new remote seq/time is a property of the URL-addressed routing
/// layer (§1, out of scope); here the new remote bookkeeping is taken
/// directly from what was written, which is the same information a
/// well-behaved remote status line would report back.
pub fn apply_outbound<B: Backend>(
    backend: &B,
    state: &mut RelationshipState,
    local: &mut RingHandle<B>,
    remote: &mut RingHandle<B>,
    now: i64,
) -> Result<usize> {
    state.last_attempt_time = now;
    let batch = local.mget_range(backend, Some(state.last_local_seq + 1), None, None, None)?;
    let table = match batch {
        Some(t) if !t.is_empty() => t,
        _ => return Ok(0),
    };

    let seq_idx = table.column_index("_seq");
    let time_idx = table.column_index("_time");
    let count = table.rows.len();

    remote.put(backend, &table)?;

    if let Some(idx) = seq_idx {
        if let Some(max_seq) = table.rows.iter().filter_map(|r| r[idx].parse::<u64>().ok()).max() {
            state.last_local_seq = max_seq;
        }
    }
    if let Some(idx) = time_idx {
        if let Some(max_t) = table.rows.iter().filter_map(|r| r[idx].parse::<i64>().ok()).max() {
            state.youngest_replicated_time = max_t;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_inbound_and_outbound_directives() {
        assert_eq!(
            Directive::parse("tom<sqlrs:kevin,tom,3600"),
            Some(Directive::Inbound {
                local: "tom".into(),
                remote: "sqlrs:kevin,tom,3600".into()
            })
        );
        assert_eq!(
            Directive::parse("tom>sqlrs:kevin,tom,3600"),
            Some(Directive::Outbound {
                local: "tom".into(),
                remote: "sqlrs:kevin,tom,3600".into()
            })
        );
        assert_eq!(Directive::parse("garbage"), None);
    }

    #[test]
    fn state_table_roundtrip() {
        let mut state = ReplicationState::default();
        let rel = state.find_or_insert("tom<remote", "tom", "sqlrs:kevin,tom,3600");
        rel.last_remote_seq = 5;
        rel.last_local_seq = 3;
        let table = state.to_table();
        let back = ReplicationState::from_table(&table);
        assert_eq!(back.relationships.len(), 1);
        assert_eq!(back.relationships[0].last_remote_seq, 5);
        assert_eq!(back.relationships[0].last_local_seq, 3);
    }

    #[test]
    fn find_or_insert_is_idempotent() {
        let mut state = ReplicationState::default();
        state.find_or_insert("a<b", "a", "b");
        state.find_or_insert("a<b", "a", "b");
        assert_eq!(state.relationships.len(), 1);
    }
}
