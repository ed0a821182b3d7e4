// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Serialized root-thunk registration.
//!
//! Concurrent subscribers race to register root thunks; this queue makes
//! lock acquisition linearizable by processing registrations FIFO.
//! A registration either executes immediately (the lock is acquirable, or
//! the thunk rides a bypass/parent relationship) or waits until the lock
//! changes hands.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::action::SubscriberId;
use crate::error::ErrorCode;
use crate::lock::ThunkLockManager;
use crate::thunk::ThunkTracker;

/// A thunk waiting to be registered.
pub struct RegistrationRequest {
    pub thunk_id: String,
    pub parent_id: Option<String>,
    pub subscriber_id: SubscriberId,
    pub bypass_thunk_lock: bool,
    pub bypass_access_control: bool,
    done: oneshot::Sender<Result<(), String>>,
}

pub struct ThunkRegistrationQueue {
    lock: Arc<ThunkLockManager>,
    thunks: Arc<ThunkTracker>,
    pending: Mutex<VecDeque<RegistrationRequest>>,
}

impl ThunkRegistrationQueue {
    pub fn new(lock: Arc<ThunkLockManager>, thunks: Arc<ThunkTracker>) -> Arc<Self> {
        Arc::new(Self { lock, thunks, pending: Mutex::new(VecDeque::new()) })
    }

    /// Drain pending registrations whenever the lock changes hands.
    pub fn spawn_lock_listener(self: &Arc<Self>, shutdown: CancellationToken) {
        let queue = Arc::clone(self);
        let mut events = self.lock.subscribe_events();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    event = events.recv() => {
                        if event.is_err() {
                            return;
                        }
                        queue.drain();
                    }
                }
            }
        });
    }

    /// Register a thunk, queueing if the lock denies it for now. The
    /// returned channel resolves once the thunk is fully registered (or
    /// the registration is refused).
    pub fn register(
        &self,
        thunk_id: &str,
        parent_id: Option<&str>,
        subscriber_id: SubscriberId,
        bypass_thunk_lock: bool,
        bypass_access_control: bool,
    ) -> oneshot::Receiver<Result<(), String>> {
        let (done, rx) = oneshot::channel();
        if self.thunks.contains(thunk_id) {
            let _ = done.send(Err(ErrorCode::ThunkRegistrationError
                .message(format!("thunk {thunk_id} already registered"))));
            return rx;
        }
        let request = RegistrationRequest {
            thunk_id: thunk_id.to_owned(),
            parent_id: parent_id.map(str::to_owned),
            subscriber_id,
            bypass_thunk_lock,
            bypass_access_control,
            done,
        };
        if self.lock.can_register_thunk(parent_id, bypass_thunk_lock) {
            self.activate(request);
        } else {
            debug!(thunk = thunk_id, "thunk registration queued behind lock");
            self.pending.lock().push_back(request);
        }
        rx
    }

    /// Process queued registrations FIFO until the head is still blocked.
    pub fn drain(&self) {
        loop {
            let request = {
                let mut pending = self.pending.lock();
                let Some(head) = pending.front() else { return };
                if !self
                    .lock
                    .can_register_thunk(head.parent_id.as_deref(), head.bypass_thunk_lock)
                {
                    return;
                }
                pending.pop_front()
            };
            let Some(request) = request else { return };
            self.activate(request);
        }
    }

    /// Complete a registration: acquire the lock for plain roots, create
    /// the tracker record, and mark it executing.
    fn activate(&self, request: RegistrationRequest) {
        let RegistrationRequest {
            thunk_id,
            parent_id,
            subscriber_id,
            bypass_thunk_lock,
            bypass_access_control,
            done,
        } = request;
        let is_root = parent_id.is_none();
        if is_root && !bypass_thunk_lock && !self.lock.try_acquire(&thunk_id, subscriber_id) {
            // Lost a race for the lock; park the registration again.
            debug!(thunk = thunk_id.as_str(), "lock acquisition raced, requeueing registration");
            self.pending.lock().push_front(RegistrationRequest {
                thunk_id,
                parent_id,
                subscriber_id,
                bypass_thunk_lock,
                bypass_access_control,
                done,
            });
            return;
        }

        let tracker = Arc::clone(&self.thunks);
        let handle = tracker.register_with_id(&thunk_id, parent_id.as_deref());
        handle.set_source_subscriber(subscriber_id);
        tracker.set_bypass_flags(&thunk_id, bypass_thunk_lock, bypass_access_control);
        handle.mark_executing();
        debug!(
            thunk = thunk_id.as_str(),
            parent = parent_id.as_deref().unwrap_or("-"),
            subscriber = subscriber_id,
            "thunk registered"
        );
        let _ = done.send(Ok(()));
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
#[path = "registration_tests.rs"]
mod tests;
