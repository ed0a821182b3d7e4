// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Acknowledgment tracking for broadcast state updates.
//!
//! Every commit broadcast during a thunk is tagged with a fresh update id
//! and recorded against the subscribers that received it. The thunk may
//! not finish cleanup (or release the lock) until each of those updates
//! settles: all recipients acknowledged, a recipient died, or the update
//! aged out.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::action::SubscriberId;

/// A broadcast update still waiting on acknowledgments.
#[derive(Debug, Clone)]
pub struct PendingStateUpdate {
    pub update_id: String,
    pub thunk_id: String,
    pub subscribed: HashSet<SubscriberId>,
    pub acknowledged: HashSet<SubscriberId>,
    pub created: Instant,
}

impl PendingStateUpdate {
    fn settled(&self) -> bool {
        self.acknowledged.len() == self.subscribed.len()
    }
}

pub struct StateUpdateTracker {
    pending: Mutex<HashMap<String, PendingStateUpdate>>,
}

impl Default for StateUpdateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateUpdateTracker {
    pub fn new() -> Self {
        Self { pending: Mutex::new(HashMap::new()) }
    }

    /// Record a broadcast update awaiting acks from `subscribed`. An
    /// update with no recipients settles immediately and is not recorded.
    pub fn track_update(
        &self,
        thunk_id: &str,
        update_id: &str,
        subscribed: impl IntoIterator<Item = SubscriberId>,
    ) {
        let subscribed: HashSet<SubscriberId> = subscribed.into_iter().collect();
        if subscribed.is_empty() {
            return;
        }
        self.pending.lock().insert(
            update_id.to_owned(),
            PendingStateUpdate {
                update_id: update_id.to_owned(),
                thunk_id: thunk_id.to_owned(),
                subscribed,
                acknowledged: HashSet::new(),
                created: Instant::now(),
            },
        );
    }

    /// Apply one subscriber's ack. Returns the owning thunk id when this
    /// ack settled the update. Duplicate acks and acks from subscribers
    /// the update was never sent to are ignored.
    pub fn acknowledge(&self, update_id: &str, subscriber_id: SubscriberId) -> Option<String> {
        let mut pending = self.pending.lock();
        let update = pending.get_mut(update_id)?;
        if !update.subscribed.contains(&subscriber_id) {
            debug!(update = update_id, subscriber = subscriber_id, "ack from non-subscriber ignored");
            return None;
        }
        update.acknowledged.insert(subscriber_id);
        if update.settled() {
            let update = pending.remove(update_id)?;
            return Some(update.thunk_id);
        }
        None
    }

    /// Remove a dead subscriber from every pending update. Updates that
    /// become fully acknowledged settle immediately; their thunk ids are
    /// returned for completion retries.
    pub fn cleanup_dead_subscriber(&self, subscriber_id: SubscriberId) -> Vec<String> {
        let mut pending = self.pending.lock();
        let mut settled = Vec::new();
        pending.retain(|_, update| {
            update.subscribed.remove(&subscriber_id);
            update.acknowledged.remove(&subscriber_id);
            if update.subscribed.is_empty() || update.settled() {
                settled.push(update.thunk_id.clone());
                false
            } else {
                true
            }
        });
        settled
    }

    /// Settle updates older than `max_age`, treating them as acknowledged.
    /// Returns the thunk ids of reaped updates.
    pub fn cleanup_expired(&self, max_age: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut pending = self.pending.lock();
        let mut settled = Vec::new();
        pending.retain(|update_id, update| {
            if now.duration_since(update.created) > max_age {
                warn!(
                    update = update_id.as_str(),
                    thunk = update.thunk_id.as_str(),
                    missing = update.subscribed.len() - update.acknowledged.len(),
                    "state update expired without full acknowledgment"
                );
                settled.push(update.thunk_id.clone());
                false
            } else {
                true
            }
        });
        settled
    }

    pub fn has_pending_updates(&self, thunk_id: &str) -> bool {
        self.pending.lock().values().any(|u| u.thunk_id == thunk_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
#[path = "update_tracker_tests.rs"]
mod tests;
