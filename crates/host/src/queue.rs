// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bounded priority FIFO of pending actions.
//!
//! Ordering is max-priority first, then earliest receive order within a
//! priority. The queue never exceeds its bound: admission under pressure
//! evicts the lowest-priority oldest droppable entry, or rejects the
//! newcomer when nothing may be dropped.

use std::time::Instant;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::action::Action;
use crate::error::ErrorCode;

/// Priority for lock-bypassing thunk/system actions.
pub const PRIORITY_BYPASS_THUNK: u8 = 100;
/// Priority for lock-bypassing actions outside any thunk.
pub const PRIORITY_BYPASS: u8 = 80;
/// Priority for actions belonging to the current holder thunk.
pub const PRIORITY_HOLDER_CHILD: u8 = 70;
/// Priority for actions belonging to any other thunk.
pub const PRIORITY_THUNK_CHILD: u8 = 50;
/// Priority for regular actions.
pub const PRIORITY_REGULAR: u8 = 0;

/// Entries below this priority are droppable under overflow pressure.
const DROPPABLE_BELOW: u8 = PRIORITY_THUNK_CHILD;

/// Completion side of a dispatched action: `Ok` carries the result value
/// (usually null, `{"__timeout": true}` on deadline expiry), `Err` the
/// wire error string.
pub type CompletionSender = oneshot::Sender<Result<Value, String>>;

/// Rank an action for scheduling, given the current lock holder.
pub fn action_priority(action: &Action, holder: Option<&str>) -> u8 {
    if action.bypass_thunk_lock {
        if action.thunk_parent_id.is_some() {
            PRIORITY_BYPASS_THUNK
        } else {
            PRIORITY_BYPASS
        }
    } else if let Some(parent) = action.thunk_parent_id.as_deref() {
        if holder == Some(parent) {
            PRIORITY_HOLDER_CHILD
        } else {
            PRIORITY_THUNK_CHILD
        }
    } else {
        PRIORITY_REGULAR
    }
}

/// A pending action with its admission metadata and completion channel.
pub struct QueuedAction {
    pub action: Action,
    pub priority: u8,
    pub received: Instant,
    seq: u64,
    pub on_complete: CompletionSender,
}

impl QueuedAction {
    /// Reject this entry with a queue-overflow error.
    pub fn reject_overflow(self) {
        let _ = self
            .on_complete
            .send(Err(ErrorCode::QueueOverflow.message(format!(
                "action {} dropped (type {})",
                self.action.id, self.action.action_type
            ))));
    }
}

/// Outcome of an admission attempt.
pub enum Admission {
    /// Entry queued; nothing displaced.
    Queued,
    /// Entry queued after evicting a lower-priority entry. The caller
    /// fires the evicted completion.
    Evicted(QueuedAction),
    /// Queue full of undroppable work and the newcomer is low priority.
    Rejected(QueuedAction),
}

pub struct ActionQueue {
    entries: Vec<QueuedAction>,
    max_size: usize,
    next_seq: u64,
    dropped: u64,
}

impl ActionQueue {
    pub fn new(max_size: usize) -> Self {
        Self { entries: Vec::new(), max_size, next_seq: 0, dropped: 0 }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total entries evicted or rejected under overflow pressure.
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    /// Admit an action. The queue stays within its bound: under pressure
    /// the lowest-priority oldest droppable entry is evicted; when nothing
    /// is droppable, a low-priority newcomer is rejected and a
    /// high-priority one displaces the oldest entry regardless.
    pub fn push(
        &mut self,
        action: Action,
        priority: u8,
        on_complete: CompletionSender,
    ) -> Admission {
        let entry = QueuedAction {
            action,
            priority,
            received: Instant::now(),
            seq: self.next_seq,
            on_complete,
        };
        self.next_seq += 1;

        if self.entries.len() < self.max_size {
            self.insert(entry);
            return Admission::Queued;
        }

        // Overflow. Find the lowest-priority oldest droppable victim.
        let victim = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.priority < DROPPABLE_BELOW)
            .min_by_key(|(_, e)| (e.priority, e.seq))
            .map(|(i, _)| i);

        match victim {
            Some(index) => {
                let dropped = self.entries.remove(index);
                self.dropped += 1;
                debug!(
                    action = dropped.action.id.as_str(),
                    priority = dropped.priority,
                    "queue overflow, dropping lowest-priority entry"
                );
                self.insert(entry);
                Admission::Evicted(dropped)
            }
            None if entry.priority >= DROPPABLE_BELOW => {
                // Nothing droppable but the newcomer outranks: displace
                // the oldest entry regardless of its priority.
                let index = self
                    .entries
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, e)| e.seq)
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                let dropped = self.entries.remove(index);
                self.dropped += 1;
                debug!(
                    action = dropped.action.id.as_str(),
                    "queue overflow, evicting oldest entry for high-priority action"
                );
                self.insert(entry);
                Admission::Evicted(dropped)
            }
            None => {
                self.dropped += 1;
                Admission::Rejected(entry)
            }
        }
    }

    fn insert(&mut self, entry: QueuedAction) {
        self.entries.push(entry);
        self.entries.sort_by_key(|e| (std::cmp::Reverse(e.priority), e.seq));
    }

    /// The entry that would run next.
    pub fn peek(&self) -> Option<&QueuedAction> {
        self.entries.first()
    }

    pub fn pop(&mut self) -> Option<QueuedAction> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0))
        }
    }

    /// Pull a still-queued action by id, for timeouts and cancellation.
    pub fn remove_by_id(&mut self, action_id: &str) -> Option<QueuedAction> {
        let index = self.entries.iter().position(|e| e.action.id == action_id)?;
        Some(self.entries.remove(index))
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
