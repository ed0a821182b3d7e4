// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Windowed coalescing of subscriber dispatches.
//!
//! Actions dispatched in rapid succession collect into a batch and ship
//! as one request at the end of a short window. High-priority actions and
//! full batches flush immediately. At most one flush is in flight; later
//! enqueues land in a successor batch. Each action resolves individually
//! from its result row in the batch acknowledgment.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use zubridge::action::Action;
use zubridge::error::ErrorCode;
use zubridge::protocol::{ActionBatch, ActionBatchAck, BatchedAction};

/// Batching knobs.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Coalescing window; one frame's worth by default.
    pub window: Duration,
    /// Flush immediately once a batch reaches this many actions.
    pub max_batch_size: usize,
    /// Actions at or above this priority flush the batch immediately.
    pub priority_flush_threshold: u8,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(16),
            max_batch_size: 25,
            priority_flush_threshold: 80,
        }
    }
}

/// Rank an action locally, without knowledge of the host-side lock
/// holder. Used only against the flush threshold.
pub fn local_priority(action: &Action) -> u8 {
    if action.bypass_thunk_lock {
        if action.thunk_parent_id.is_some() {
            100
        } else {
            80
        }
    } else if action.thunk_parent_id.is_some() {
        50
    } else {
        0
    }
}

/// Where flushed batches go. The dispatch client backs this with a
/// `zubridge/dispatch_batch` invoke; tests plug in closures.
pub trait BatchSink: Send + Sync + 'static {
    fn send_batch(&self, batch: ActionBatch) -> BoxFuture<'static, Result<ActionBatchAck, String>>;
}

impl<F> BatchSink for F
where
    F: Fn(ActionBatch) -> BoxFuture<'static, Result<ActionBatchAck, String>>
        + Send
        + Sync
        + 'static,
{
    fn send_batch(&self, batch: ActionBatch) -> BoxFuture<'static, Result<ActionBatchAck, String>> {
        self(batch)
    }
}

struct PendingDispatch {
    action: Action,
    parent_id: Option<String>,
    reply: oneshot::Sender<Result<(), String>>,
}

struct BatcherState {
    queued: Vec<PendingDispatch>,
    in_flight: Vec<PendingDispatch>,
    flush_in_flight: bool,
    timer_armed: bool,
    /// A flush trigger fired while a flush was in flight; honor it as
    /// soon as the in-flight batch resolves.
    trigger_pending: bool,
    destroyed: bool,
}

struct BatcherInner {
    config: BatcherConfig,
    sink: Box<dyn BatchSink>,
    state: Mutex<BatcherState>,
}

/// Subscriber-side action coalescer.
pub struct ActionBatcher {
    inner: Arc<BatcherInner>,
}

impl ActionBatcher {
    pub fn new(config: BatcherConfig, sink: impl BatchSink) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                config,
                sink: Box::new(sink),
                state: Mutex::new(BatcherState {
                    queued: Vec::new(),
                    in_flight: Vec::new(),
                    flush_in_flight: false,
                    timer_armed: false,
                    trigger_pending: false,
                    destroyed: false,
                }),
            }),
        }
    }

    /// Append an action to the open batch. The returned channel resolves
    /// from this action's result row once the batch is acknowledged.
    pub fn enqueue(
        &self,
        action: Action,
        priority: u8,
        parent_id: Option<String>,
    ) -> oneshot::Receiver<Result<(), String>> {
        let (reply, rx) = oneshot::channel();
        let flush_now = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                let _ = reply.send(Err(ErrorCode::Destroyed.message("batcher destroyed")));
                return rx;
            }
            state.queued.push(PendingDispatch { action, parent_id, reply });
            let triggered = priority >= self.inner.config.priority_flush_threshold
                || state.queued.len() >= self.inner.config.max_batch_size;
            if state.flush_in_flight {
                if triggered {
                    state.trigger_pending = true;
                }
                false
            } else if triggered {
                true
            } else {
                if !state.timer_armed {
                    state.timer_armed = true;
                    arm_window_timer(&self.inner);
                }
                false
            }
        };
        if flush_now {
            start_flush(&self.inner);
        }
        rx
    }

    /// Reject a still-queued action. No-op once the action has flushed.
    pub fn remove_action(&self, action_id: &str) -> bool {
        let entry = {
            let mut state = self.inner.state.lock();
            let index = state.queued.iter().position(|e| e.action.id == action_id);
            index.map(|i| state.queued.remove(i))
        };
        match entry {
            Some(entry) => {
                let _ = entry
                    .reply
                    .send(Err(ErrorCode::Destroyed.message("action removed before flush")));
                true
            }
            None => false,
        }
    }

    /// Reject everything queued and in flight; further enqueues fail.
    pub fn destroy(&self) {
        let entries = {
            let mut state = self.inner.state.lock();
            state.destroyed = true;
            let mut entries = std::mem::take(&mut state.queued);
            entries.append(&mut state.in_flight);
            entries
        };
        for entry in entries {
            let _ = entry.reply.send(Err(ErrorCode::Destroyed.message("batcher destroyed")));
        }
    }

    pub fn queued_len(&self) -> usize {
        self.inner.state.lock().queued.len()
    }
}

/// Flush after the window elapses, unless a flush beat us to it.
fn arm_window_timer(inner: &Arc<BatcherInner>) {
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        tokio::time::sleep(inner.config.window).await;
        let ready = {
            let mut state = inner.state.lock();
            state.timer_armed = false;
            !state.destroyed && !state.flush_in_flight && !state.queued.is_empty()
        };
        if ready {
            start_flush(&inner);
        }
    });
}

/// Ship the open batch. Exactly one flush runs at a time; the successor
/// batch is scheduled once this one's acknowledgment lands.
fn start_flush(inner: &Arc<BatcherInner>) {
    let batch = {
        let mut state = inner.state.lock();
        if state.flush_in_flight || state.destroyed || state.queued.is_empty() {
            return;
        }
        state.flush_in_flight = true;
        let entries = std::mem::take(&mut state.queued);
        let actions = entries
            .iter()
            .map(|e| BatchedAction {
                id: e.action.id.clone(),
                action: e.action.clone(),
                parent_id: e.parent_id.clone(),
            })
            .collect();
        state.in_flight = entries;
        ActionBatch { batch_id: Uuid::new_v4().to_string(), actions }
    };

    debug!(batch = batch.batch_id.as_str(), len = batch.actions.len(), "flushing action batch");
    let fut = inner.sink.send_batch(batch);
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        let result = fut.await;
        let entries = {
            let mut state = inner.state.lock();
            state.flush_in_flight = false;
            std::mem::take(&mut state.in_flight)
        };
        resolve_entries(entries, result);

        // Drive the successor batch.
        let (flush_now, arm) = {
            let mut state = inner.state.lock();
            if state.destroyed || state.queued.is_empty() {
                state.trigger_pending = false;
                (false, false)
            } else if state.trigger_pending
                || state.queued.len() >= inner.config.max_batch_size
            {
                state.trigger_pending = false;
                (true, false)
            } else if !state.timer_armed {
                state.timer_armed = true;
                (false, true)
            } else {
                (false, false)
            }
        };
        if flush_now {
            start_flush(&inner);
        } else if arm {
            arm_window_timer(&inner);
        }
    });
}

/// Resolve each flushed action from its result row. A missing row is a
/// protocol error and rejects the action.
fn resolve_entries(entries: Vec<PendingDispatch>, result: Result<ActionBatchAck, String>) {
    match result {
        Ok(ack) => {
            for entry in entries {
                let row = ack.results.iter().find(|r| r.action_id == entry.action.id);
                let outcome = match row {
                    Some(row) if row.success => Ok(()),
                    Some(row) => Err(row
                        .error
                        .clone()
                        .unwrap_or_else(|| ErrorCode::Internal.message("unspecified failure"))),
                    None => Err(ErrorCode::ProtocolError.message(format!(
                        "batch {} missing result for action {}",
                        ack.batch_id, entry.action.id
                    ))),
                };
                let _ = entry.reply.send(outcome);
            }
        }
        Err(error) => {
            for entry in entries {
                let _ = entry.reply.send(Err(error.clone()));
            }
        }
    }
}

#[cfg(test)]
#[path = "batcher_tests.rs"]
mod tests;
