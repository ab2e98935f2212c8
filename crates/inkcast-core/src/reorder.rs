//! Sequence-number reordering for accepted operations.
//!
//! Transport delivery may be out of order or duplicated. The buffer releases
//! operations strictly in sequence order, drops anything already released,
//! and reports a gap once waiting for a missing number stops being
//! reasonable, at which point the caller resyncs from a snapshot.

use crate::stroke::StrokeOp;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Default number of operations buffered behind a missing one.
pub const DEFAULT_REORDER_WINDOW: usize = 256;

/// Default time to wait for a missing operation.
pub const DEFAULT_GAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Result of feeding an operation into the buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum ReorderOutcome {
    /// Operations now ready, in order. May be empty.
    Ready(Vec<StrokeOp>),
    /// The buffer overflowed behind a missing sequence number.
    Gap { expected: u64 },
}

/// Orders accepted operations for one session epoch.
#[derive(Debug, Clone)]
pub struct ReorderBuffer {
    next: u64,
    pending: BTreeMap<u64, StrokeOp>,
    window: usize,
    gap_timeout: Duration,
    waiting_since: Option<Instant>,
}

impl ReorderBuffer {
    pub fn new(window: usize, gap_timeout: Duration) -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
            window,
            gap_timeout,
            waiting_since: None,
        }
    }

    /// Sequence number expected next.
    pub fn next_expected(&self) -> u64 {
        self.next
    }

    /// Number of operations held back.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Forget buffered operations and expect `next` from now on.
    pub fn reset(&mut self, next: u64) {
        self.next = next;
        self.pending.clear();
        self.waiting_since = None;
    }

    /// Feed one accepted operation.
    pub fn push(&mut self, op: StrokeOp, now: Instant) -> ReorderOutcome {
        let Some(seq) = op.sequence_number() else {
            log::warn!("Ignoring unstamped operation from {}", op.author_id());
            return ReorderOutcome::Ready(Vec::new());
        };
        if seq < self.next || self.pending.contains_key(&seq) {
            log::debug!("Dropping duplicate operation {}", seq);
            return ReorderOutcome::Ready(Vec::new());
        }

        self.pending.insert(seq, op);

        let mut ready = Vec::new();
        while let Some(op) = self.pending.remove(&self.next) {
            ready.push(op);
            self.next += 1;
        }

        if self.pending.is_empty() {
            self.waiting_since = None;
        } else if !ready.is_empty() || self.waiting_since.is_none() {
            self.waiting_since = Some(now);
        }

        if self.pending.len() > self.window {
            return ReorderOutcome::Gap {
                expected: self.next,
            };
        }
        ReorderOutcome::Ready(ready)
    }

    /// Whether the oldest hole has been open longer than the gap timeout.
    pub fn gap_expired(&self, now: Instant) -> bool {
        self.waiting_since
            .is_some_and(|since| now.saturating_duration_since(since) >= self.gap_timeout)
    }
}

impl Default for ReorderBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_REORDER_WINDOW, DEFAULT_GAP_TIMEOUT)
    }
}
