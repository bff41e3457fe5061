//! The event operator (§4.5): consumes an ordered queue of instructions
//! from a source ring and executes each according to its method tag.
//!
//! Only the "ordered, at-least-once, advance-past-last-handled" contract is
//! implemented here (§4.5); actual execution of a method is the
//! method-dispatch shell's job and is out of scope (§1). The builtin method
//! tags are `exec`, `sh`, `snap`, `tstamp`, `sample`, `pattern`, `event`,
//! `replicate`, and `restart`.

use ringstore_core::backend::Backend;
use ringstore_core::error::Result;
use ringstore_core::ring::RingHandle;
use ringstore_core::table::Table;

/// The built-in method tags the surrounding collector dispatches by name
/// (§1; dispatch itself is out of scope here).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodTag {
    Exec,
    Sh,
    Snap,
    Tstamp,
    Sample,
    Pattern,
    Event,
    Replicate,
    Restart,
    Unknown,
}

impl MethodTag {
    pub fn parse(tag: &str) -> Self {
        match tag {
            "exec" => MethodTag::Exec,
            "sh" => MethodTag::Sh,
            "snap" => MethodTag::Snap,
            "tstamp" => MethodTag::Tstamp,
            "sample" => MethodTag::Sample,
            "pattern" => MethodTag::Pattern,
            "event" => MethodTag::Event,
            "replicate" => MethodTag::Replicate,
            "restart" => MethodTag::Restart,
            _ => MethodTag::Unknown,
        }
    }
}

/// One instruction pulled from the queue: its method tag and free-form
/// argument string, plus the `_seq` it was read at (so the caller can
/// report progress without re-deriving it).
#[derive(Debug, Clone)]
pub struct Instruction {
    pub seq: u64,
    pub method: MethodTag,
    pub arg: String,
}

fn rows_to_instructions(table: &Table) -> Vec<Instruction> {
    let seq_idx = table.column_index("_seq");
    let method_idx = table.column_index("method");
    let arg_idx = table.column_index("arg");
    table
        .rows
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let seq = seq_idx
                .and_then(|idx| row[idx].parse().ok())
                .unwrap_or(i as u64);
            let method = method_idx
                .map(|idx| MethodTag::parse(&row[idx]))
                .unwrap_or(MethodTag::Unknown);
            let arg = arg_idx.map(|idx| row[idx].clone()).unwrap_or_default();
            Instruction { seq, method, arg }
        })
        .collect()
}

/// A handler invoked once per instruction in order. Returning `Err` does
/// not stop the queue from advancing past the instruction on the *next*
/// tick — at-least-once delivery means a handler that fails is expected to
/// be idempotent or to re-raise through its own channel (§4.5, §7
/// replicator precedent: "logs and skips... without aborting the batch").
pub trait EventHandler {
    fn handle(&mut self, instruction: &Instruction) -> Result<()>;
}

/// Consumes queued instructions from `source`, starting at its current
/// cursor, in order, advancing past the last one handled (§4.5).
pub struct EventConsumer<B: Backend> {
    _marker: std::marker::PhantomData<B>,
}

impl<B: Backend> Default for EventConsumer<B> {
    fn default() -> Self {
        Self {
            _marker: std::marker::PhantomData,
        }
    }
}

impl<B: Backend> EventConsumer<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads and handles everything available from `source`'s cursor,
    /// returning the instructions that were handled. A handler error for
    /// one instruction does not stop the rest of the batch; the consumer
    /// still advances past every instruction it attempted (at-least-once,
    /// not at-most-once, delivery).
    pub fn drain(
        &mut self,
        backend: &B,
        source: &mut RingHandle<B>,
        handler: &mut impl EventHandler,
    ) -> Result<Vec<Instruction>> {
        let mut handled = Vec::new();
        loop {
            let batch = source.mget_n(backend, 64)?;
            let table = match batch {
                Some(t) if !t.is_empty() => t,
                _ => break,
            };
            for instruction in rows_to_instructions(&table) {
                let _ = handler.handle(&instruction);
                handled.push(instruction);
            }
        }
        Ok(handled)
    }
}
