// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Global thunk lock: a two-state gate deciding whether foreign actions
//! may run. At most one root thunk holds the lock at any instant; its
//! descendants (and lock-bypassing actions) pass, everything else queues.

use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::action::{Action, SubscriberId};

/// Lock states. Transitions are Idle→Locked on root-thunk registration
/// and Locked→Idle on full completion of that thunk and all descendants.
#[derive(Debug, Clone)]
pub enum LockState {
    Idle,
    Locked { thunk_id: String, subscriber_id: SubscriberId, acquired_at: Instant },
}

/// Emitted on every acquire and release; the scheduler and registration
/// queue drain on `Released`.
#[derive(Debug, Clone)]
pub enum LockEvent {
    Acquired { thunk_id: String, subscriber_id: SubscriberId },
    Released { thunk_id: String },
}

pub struct ThunkLockManager {
    state: Mutex<LockState>,
    event_tx: broadcast::Sender<LockEvent>,
}

impl Default for ThunkLockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ThunkLockManager {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self { state: Mutex::new(LockState::Idle), event_tx }
    }

    /// Watch acquire/release events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<LockEvent> {
        self.event_tx.subscribe()
    }

    /// Idle→Locked, or deny if another thunk holds the lock.
    pub fn try_acquire(&self, thunk_id: &str, subscriber_id: SubscriberId) -> bool {
        let mut state = self.state.lock();
        match &*state {
            LockState::Idle => {
                *state = LockState::Locked {
                    thunk_id: thunk_id.to_owned(),
                    subscriber_id,
                    acquired_at: Instant::now(),
                };
                drop(state);
                debug!(thunk = thunk_id, subscriber = subscriber_id, "thunk lock acquired");
                let _ = self.event_tx.send(LockEvent::Acquired {
                    thunk_id: thunk_id.to_owned(),
                    subscriber_id,
                });
                true
            }
            LockState::Locked { .. } => false,
        }
    }

    /// Locked→Idle. Only the holder may release; anything else is a lock
    /// violation reported as `false`, never raised.
    pub fn release(&self, thunk_id: &str) -> bool {
        let mut state = self.state.lock();
        let is_holder =
            matches!(&*state, LockState::Locked { thunk_id: holder, .. } if holder == thunk_id);
        if !is_holder {
            return false;
        }
        *state = LockState::Idle;
        drop(state);
        debug!(thunk = thunk_id, "thunk lock released");
        let _ = self.event_tx.send(LockEvent::Released { thunk_id: thunk_id.to_owned() });
        true
    }

    /// Id of the holder thunk, if locked.
    pub fn holder(&self) -> Option<String> {
        match &*self.state.lock() {
            LockState::Idle => None,
            LockState::Locked { thunk_id, .. } => Some(thunk_id.clone()),
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(&*self.state.lock(), LockState::Locked { .. })
    }

    /// Whether an action may run right now. Idle allows everything;
    /// Locked allows only the holder's own actions and lock bypasses.
    pub fn can_process_action(&self, action: &Action) -> bool {
        match &*self.state.lock() {
            LockState::Idle => true,
            LockState::Locked { thunk_id, .. } => {
                action.bypass_thunk_lock || action.thunk_parent_id.as_deref() == Some(thunk_id)
            }
        }
    }

    /// Whether a thunk may register right now: always when idle, and when
    /// locked only for children of the holder or lock-bypassing roots.
    pub fn can_register_thunk(&self, parent_id: Option<&str>, bypass_thunk_lock: bool) -> bool {
        match &*self.state.lock() {
            LockState::Idle => true,
            LockState::Locked { thunk_id, .. } => {
                bypass_thunk_lock || parent_id == Some(thunk_id.as_str())
            }
        }
    }
}

#[cfg(test)]
#[path = "lock_tests.rs"]
mod tests;
