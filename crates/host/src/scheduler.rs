// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Action scheduler: admits incoming actions against the thunk lock,
//! executes them one at a time through the state manager, and drains the
//! pending queue whenever the world changes (lock released, thunk done).
//!
//! Execution is strictly one-at-a-time: a non-reentrant `processing` flag
//! guards the drain loop, so holder-thunk actions never interleave with
//! foreign work.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::action::Action;
use crate::config::KernelConfig;
use crate::lock::{LockEvent, ThunkLockManager};
use crate::queue::{action_priority, ActionQueue, Admission};
use crate::state::{ProcessOutcome, StateManager};
use crate::thunk::ThunkTracker;

struct SchedulerState {
    queue: ActionQueue,
    /// Non-reentrant drain guard; true while an action is executing.
    processing: bool,
}

pub struct ActionScheduler {
    store: Arc<dyn StateManager>,
    lock: Arc<ThunkLockManager>,
    thunks: Arc<ThunkTracker>,
    config: KernelConfig,
    state: Mutex<SchedulerState>,
}

impl ActionScheduler {
    pub fn new(
        store: Arc<dyn StateManager>,
        lock: Arc<ThunkLockManager>,
        thunks: Arc<ThunkTracker>,
        config: KernelConfig,
    ) -> Arc<Self> {
        let queue = ActionQueue::new(config.max_queue_size);
        Arc::new(Self {
            store,
            lock,
            thunks,
            config,
            state: Mutex::new(SchedulerState { queue, processing: false }),
        })
    }

    /// Drain the queue whenever the lock releases, until shutdown.
    pub fn spawn_lock_listener(self: &Arc<Self>, shutdown: CancellationToken) {
        let scheduler = Arc::clone(self);
        let mut events = self.lock.subscribe_events();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    event = events.recv() => match event {
                        Ok(LockEvent::Released { .. }) => scheduler.drain().await,
                        Ok(LockEvent::Acquired { .. }) => {}
                        Err(_) => return,
                    },
                }
            }
        });
    }

    /// Admit an action. Executes immediately when nothing is running and
    /// the lock allows it; otherwise queues (or applies the overflow
    /// policy). The returned channel resolves when the action completes,
    /// is dropped, or times out.
    pub async fn submit(
        self: &Arc<Self>,
        mut action: Action,
    ) -> oneshot::Receiver<Result<Value, String>> {
        action.ensure_id();
        if let Some(parent) = action.thunk_parent_id.clone() {
            self.thunks.add_action(&parent, &action.id);
        }
        let (tx, rx) = oneshot::channel();

        let run_now = {
            let mut state = self.state.lock();
            if !state.processing && self.lock.can_process_action(&action) {
                state.processing = true;
                true
            } else {
                false
            }
        };

        if run_now {
            self.execute(action, tx).await;
            let scheduler = Arc::clone(self);
            tokio::spawn(async move { scheduler.drain().await });
            return rx;
        }

        let priority = action_priority(&action, self.lock.holder().as_deref());
        let action_id = action.id.clone();
        debug!(action = action_id.as_str(), priority, "queueing action");
        let admission = self.state.lock().queue.push(action, priority, tx);
        match admission {
            Admission::Queued => self.spawn_completion_watchdog(action_id),
            Admission::Evicted(dropped) => {
                dropped.reject_overflow();
                self.spawn_completion_watchdog(action_id);
            }
            Admission::Rejected(rejected) => rejected.reject_overflow(),
        }
        // The in-flight action may have finished between the admission
        // check and the push; re-drive so the entry cannot strand.
        self.drain().await;
        rx
    }

    /// Complete a queued action with `{"__timeout": true}` if it is still
    /// waiting when the per-action deadline elapses.
    fn spawn_completion_watchdog(self: &Arc<Self>, action_id: String) {
        let scheduler = Arc::clone(self);
        let deadline = self.config.action_completion_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let entry = scheduler.state.lock().queue.remove_by_id(&action_id);
            if let Some(entry) = entry {
                warn!(action = action_id.as_str(), "queued action timed out");
                let _ = entry.on_complete.send(Ok(json!({"__timeout": true})));
            }
        });
    }

    /// Run queued actions until the head cannot execute.
    pub async fn drain(self: &Arc<Self>) {
        loop {
            let entry = {
                let mut state = self.state.lock();
                if state.processing {
                    return;
                }
                let Some(head) = state.queue.peek() else { return };
                if !self.lock.can_process_action(&head.action) {
                    return;
                }
                state.processing = true;
                state.queue.pop()
            };
            let Some(entry) = entry else { return };
            self.execute(entry.action, entry.on_complete).await;
        }
    }

    /// Run one action through the state manager and resolve its
    /// completion. Clears the processing flag on the way out.
    async fn execute(&self, action: Action, on_complete: oneshot::Sender<Result<Value, String>>) {
        debug!(action = action.id.as_str(), kind = action.action_type.as_str(), "executing action");
        let result = match self.store.process_action(&action) {
            ProcessOutcome::Sync(result) => result.map(|()| Value::Null),
            ProcessOutcome::Async(fut) => {
                match tokio::time::timeout(self.config.action_completion_timeout, fut).await {
                    Ok(result) => result.map(|()| Value::Null),
                    Err(_) => {
                        warn!(action = action.id.as_str(), "action completion timed out");
                        Ok(json!({"__timeout": true}))
                    }
                }
            }
        };
        if let Err(ref error) = result {
            debug!(action = action.id.as_str(), error = error.as_str(), "action failed");
        }
        self.state.lock().processing = false;
        let _ = on_complete.send(result);
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.state.lock().queue.dropped_count()
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
