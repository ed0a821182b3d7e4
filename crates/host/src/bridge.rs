// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bridge: the request surface tying the scheduler, lock, trackers, and
//! subscription engine to subscriber transports.
//!
//! One bridge owns one state store and any number of attached subscriber
//! channels. Incoming frames are validated, annotated, and routed;
//! outgoing state updates carry fresh update ids and are tracked for
//! acknowledgment whenever a thunk is on the hook for them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::action::{Action, SubscriberId};
use crate::config::KernelConfig;
use crate::error::ErrorCode;
use crate::lock::ThunkLockManager;
use crate::protocol::{
    ActionBatch, ActionBatchAck, BatchActionResult, CompleteThunkPayload, DispatchAck,
    DispatchPayload, GetStatePayload, GetSubscriptionsPayload, RegisterThunkAck,
    RegisterThunkPayload, StateUpdateAckPayload, StateUpdatePayload, SubscriptionPayload,
};
use crate::registration::ThunkRegistrationQueue;
use crate::scheduler::ActionScheduler;
use crate::state::{StateCommit, StateManager};
use crate::subscription::SubscriptionManager;
use crate::thunk::ThunkTracker;
use crate::transport::{envelope, Envelope, Frame, HostEndpoint};
use crate::update_tracker::StateUpdateTracker;
use crate::{keypath, protocol};

/// Host kernel facade: owns every coordination structure and speaks the
/// wire protocol with attached subscribers.
pub struct Bridge {
    config: KernelConfig,
    store: Arc<dyn StateManager>,
    subs: Arc<SubscriptionManager>,
    lock: Arc<ThunkLockManager>,
    thunks: Arc<ThunkTracker>,
    updates: Arc<StateUpdateTracker>,
    scheduler: Arc<ActionScheduler>,
    registration: Arc<ThunkRegistrationQueue>,
    subscribers: Mutex<HashMap<SubscriberId, mpsc::Sender<Envelope>>>,
    next_subscriber: AtomicU32,
    shutdown: CancellationToken,
}

impl Bridge {
    /// Build a kernel over a state manager and start its background
    /// tasks (commit broadcasting, lock-event draining, expiry sweeps).
    pub fn new(store: Arc<dyn StateManager>, config: KernelConfig) -> Arc<Self> {
        let lock = Arc::new(ThunkLockManager::new());
        let thunks = Arc::new(ThunkTracker::new());
        let updates = Arc::new(StateUpdateTracker::new());
        let scheduler = ActionScheduler::new(
            Arc::clone(&store),
            Arc::clone(&lock),
            Arc::clone(&thunks),
            config.clone(),
        );
        let registration = ThunkRegistrationQueue::new(Arc::clone(&lock), Arc::clone(&thunks));
        let shutdown = CancellationToken::new();

        let bridge = Arc::new(Self {
            config,
            store,
            subs: Arc::new(SubscriptionManager::new()),
            lock,
            thunks,
            updates,
            scheduler,
            registration,
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU32::new(1),
            shutdown,
        });

        bridge.scheduler.spawn_lock_listener(bridge.shutdown.clone());
        bridge.registration.spawn_lock_listener(bridge.shutdown.clone());
        bridge.spawn_commit_broadcaster();
        bridge.spawn_expiry_sweep();
        bridge
    }

    /// Stop background tasks and subscriber loops.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Attach one subscriber channel; returns its minted id. The frame
    /// loop runs until the channel closes, then the subscriber is cleaned
    /// up as dead.
    pub fn attach(self: &Arc<Self>, endpoint: HostEndpoint) -> SubscriberId {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().insert(id, endpoint.outgoing.clone());
        debug!(subscriber = id, "subscriber attached");

        let bridge = Arc::clone(self);
        let mut incoming = endpoint.incoming;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    frame = incoming.recv() => match frame {
                        Some(frame) => bridge.handle_frame(id, frame).await,
                        None => break,
                    },
                }
            }
            bridge.detach(id);
        });
        id
    }

    /// Remove a departed subscriber everywhere it is tracked. Updates it
    /// never acknowledged settle immediately, which may in turn complete
    /// thunks and release the lock.
    pub fn detach(&self, id: SubscriberId) {
        if self.subscribers.lock().remove(&id).is_none() {
            return;
        }
        debug!(subscriber = id, "subscriber detached");
        self.subs.remove_subscriber(id);
        for thunk_id in self.updates.cleanup_dead_subscriber(id) {
            self.try_finalize(&thunk_id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    // -- Frame routing --------------------------------------------------

    async fn handle_frame(self: &Arc<Self>, subscriber: SubscriberId, frame: Frame) {
        match frame {
            Frame::Send(env) => self.handle_send(subscriber, env).await,
            Frame::Invoke { envelope: env, reply } => {
                // Batches await per-action completions, which may depend
                // on later frames from this same subscriber (a
                // complete_thunk releasing the lock); handle them off the
                // frame loop so they cannot starve it.
                if env.channel == protocol::DISPATCH_BATCH {
                    let bridge = Arc::clone(self);
                    tokio::spawn(async move {
                        let result = bridge.handle_invoke(subscriber, env).await;
                        let _ = reply.send(result);
                    });
                } else {
                    let result = self.handle_invoke(subscriber, env).await;
                    let _ = reply.send(result);
                }
            }
        }
    }

    async fn handle_send(self: &Arc<Self>, subscriber: SubscriberId, env: Envelope) {
        match env.channel.as_str() {
            protocol::DISPATCH => match parse::<DispatchPayload>(env.payload) {
                Ok(payload) => self.dispatch(subscriber, payload.action, payload.parent_id).await,
                Err(error) => warn!(subscriber, error = error.as_str(), "malformed dispatch"),
            },
            protocol::REGISTER_THUNK => match parse::<RegisterThunkPayload>(env.payload) {
                Ok(payload) => self.register_thunk(subscriber, payload),
                Err(error) => {
                    warn!(subscriber, error = error.as_str(), "malformed thunk registration");
                }
            },
            protocol::COMPLETE_THUNK => match parse::<CompleteThunkPayload>(env.payload) {
                Ok(payload) => self.complete_thunk(subscriber, payload),
                Err(error) => warn!(subscriber, error = error.as_str(), "malformed thunk completion"),
            },
            protocol::STATE_UPDATE_ACK => match parse::<StateUpdateAckPayload>(env.payload) {
                Ok(payload) => {
                    if let Some(thunk_id) = self.updates.acknowledge(&payload.update_id, subscriber)
                    {
                        self.try_finalize(&thunk_id);
                    }
                }
                Err(error) => warn!(subscriber, error = error.as_str(), "malformed update ack"),
            },
            other => warn!(subscriber, channel = other, "unknown send channel"),
        }
    }

    async fn handle_invoke(
        self: &Arc<Self>,
        subscriber: SubscriberId,
        env: Envelope,
    ) -> Result<Value, String> {
        match env.channel.as_str() {
            protocol::GET_STATE => {
                let payload: GetStatePayload = parse(env.payload)?;
                self.get_state(subscriber, payload)
            }
            protocol::GET_WINDOW_ID => Ok(json!(subscriber)),
            protocol::GET_WINDOW_SUBSCRIPTIONS => {
                let payload: GetSubscriptionsPayload = parse(env.payload)?;
                let target = payload.subscriber_id.unwrap_or(subscriber);
                Ok(json!(self.subs.current_keys(target)))
            }
            protocol::GET_THUNK_STATE => serde_json::to_value(self.thunks.active_summary())
                .map_err(|e| ErrorCode::Internal.message(e)),
            protocol::SUBSCRIBE => {
                let payload: SubscriptionPayload = parse(env.payload)?;
                let keys = self.subs.subscribe(subscriber, &payload.keys.unwrap_or_default());
                Ok(json!(keys))
            }
            protocol::UNSUBSCRIBE => {
                let payload: SubscriptionPayload = parse(env.payload)?;
                let keys = self.subs.unsubscribe(subscriber, &payload.keys.unwrap_or_default());
                Ok(json!(keys))
            }
            protocol::DISPATCH_BATCH => {
                let payload: ActionBatch = parse(env.payload)?;
                self.dispatch_batch(subscriber, payload).await
            }
            other => Err(ErrorCode::ProtocolError.message(format!("unknown channel {other}"))),
        }
    }

    // -- Dispatch -------------------------------------------------------

    /// Run one subscriber action through admission and processing. The
    /// dispatch ack always fires, success or not.
    async fn dispatch(
        self: &Arc<Self>,
        subscriber: SubscriberId,
        mut action: Action,
        parent_id: Option<String>,
    ) {
        action.ensure_id();
        action.source_subscriber_id = Some(subscriber);
        if action.thunk_parent_id.is_none() {
            action.thunk_parent_id = parent_id;
        }
        let action_id = action.id.clone();

        if let Some(error) = self.dispatch_access_error(subscriber, &action) {
            self.send_dispatch_ack(subscriber, &action_id, Some(error)).await;
            return;
        }

        let completion = self.scheduler.submit(action).await;
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            let error = match completion.await {
                Ok(Ok(_result)) => None,
                Ok(Err(error)) => Some(error),
                Err(_) => Some(ErrorCode::Internal.message("completion channel dropped")),
            };
            bridge.send_dispatch_ack(subscriber, &action_id, error).await;
        });
    }

    async fn send_dispatch_ack(
        &self,
        subscriber: SubscriberId,
        action_id: &str,
        error: Option<String>,
    ) {
        let ack = DispatchAck {
            action_id: action_id.to_owned(),
            thunk_state: self.thunks.active_summary(),
            error,
        };
        self.send_to(subscriber, envelope(protocol::DISPATCH_ACK, &ack)).await;
    }

    /// Deny writes that touch keys outside the subscriber's key set.
    /// Only `setState`-shaped payloads carry inspectable keys; domain
    /// action types are the store's own business.
    fn dispatch_access_error(&self, subscriber: SubscriberId, action: &Action) -> Option<String> {
        if action.bypass_access_control || !self.subs.has_subscription(subscriber) {
            return None;
        }
        // Actions under a thunk registered with the access bypass inherit it.
        if let Some(thunk_id) = action.thunk_parent_id.as_deref() {
            if self.thunks.bypasses_access_control(thunk_id) {
                return None;
            }
        }
        if !action.action_type.eq_ignore_ascii_case("setstate") {
            return None;
        }
        let keys = action.payload.as_ref().and_then(Value::as_object)?;
        for key in keys.keys() {
            if !self.subs.covers_key(subscriber, key) {
                return Some(
                    ErrorCode::AccessDenied
                        .message(format!("write to {key} outside subscription")),
                );
            }
        }
        None
    }

    /// Process a coalesced batch in order; one result row per action.
    async fn dispatch_batch(
        self: &Arc<Self>,
        subscriber: SubscriberId,
        batch: ActionBatch,
    ) -> Result<Value, String> {
        debug!(subscriber, batch = batch.batch_id.as_str(), len = batch.actions.len(), "batch received");
        let mut completions = Vec::with_capacity(batch.actions.len());
        for entry in batch.actions {
            let mut action = entry.action;
            if action.id.is_empty() {
                action.id = entry.id.clone();
            }
            action.ensure_id();
            action.source_subscriber_id = Some(subscriber);
            if action.thunk_parent_id.is_none() {
                action.thunk_parent_id = entry.parent_id;
            }
            let action_id = action.id.clone();

            if let Some(error) = self.dispatch_access_error(subscriber, &action) {
                completions.push((action_id, None, Some(error)));
                continue;
            }
            let completion = self.scheduler.submit(action).await;
            completions.push((action_id, Some(completion), None));
        }

        let mut results = Vec::with_capacity(completions.len());
        for (action_id, completion, error) in completions {
            let error = match (completion, error) {
                (_, Some(error)) => Some(error),
                (Some(completion), None) => match completion.await {
                    Ok(Ok(_)) => None,
                    Ok(Err(error)) => Some(error),
                    Err(_) => Some(ErrorCode::Internal.message("completion channel dropped")),
                },
                (None, None) => None,
            };
            results.push(BatchActionResult { action_id, success: error.is_none(), error });
        }
        serde_json::to_value(ActionBatchAck { batch_id: batch.batch_id, results })
            .map_err(|e| ErrorCode::Internal.message(e))
    }

    // -- Thunks ---------------------------------------------------------

    fn register_thunk(self: &Arc<Self>, subscriber: SubscriberId, payload: RegisterThunkPayload) {
        let RegisterThunkPayload { thunk_id, parent_id, bypass_thunk_lock, bypass_access_control } =
            payload;
        let done = self.registration.register(
            &thunk_id,
            parent_id.as_deref(),
            subscriber,
            bypass_thunk_lock,
            bypass_access_control,
        );
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            let result = done
                .await
                .unwrap_or_else(|_| Err(ErrorCode::Internal.message("registration dropped")));
            let ack = RegisterThunkAck {
                thunk_id,
                success: result.is_ok(),
                error: result.err(),
            };
            bridge.send_to(subscriber, envelope(protocol::REGISTER_THUNK_ACK, &ack)).await;
        });
    }

    fn complete_thunk(&self, subscriber: SubscriberId, payload: CompleteThunkPayload) {
        debug!(subscriber, thunk = payload.thunk_id.as_str(), "thunk completion requested");
        self.thunks.mark_completed(&payload.thunk_id, payload.result);
        self.try_finalize(&payload.thunk_id);
    }

    /// Erase a thunk once it is terminal with no pending children and no
    /// pending update acks; propagate to the parent and release the lock
    /// when the holder's whole tree is done.
    fn try_finalize(&self, thunk_id: &str) {
        if !self.thunks.is_terminal(thunk_id)
            || self.thunks.has_pending_children(thunk_id)
            || self.updates.has_pending_updates(thunk_id)
        {
            return;
        }
        let Some(thunk) = self.thunks.remove(thunk_id) else {
            return;
        };
        debug!(thunk = thunk_id, "thunk finalized");
        if let Some(parent) = thunk.parent_id.as_deref() {
            self.thunks.child_completed(parent, thunk_id);
            self.try_finalize(parent);
        }
        if self.lock.holder().as_deref() == Some(thunk_id) {
            self.lock.release(thunk_id);
        }
        // Completion may unblock queued work even when no lock was held.
        let scheduler = Arc::clone(&self.scheduler);
        tokio::spawn(async move { scheduler.drain().await });
    }

    /// Fail and erase an abandoned thunk tree, releasing its lock.
    fn reap_thunk(&self, thunk_id: &str) {
        if !self.thunks.contains(thunk_id) {
            return;
        }
        warn!(thunk = thunk_id, "thunk expired without completion; reaping");
        let parent = self.thunks.parent_of(thunk_id);
        let ids = self.thunks.subtree(thunk_id);
        for id in &ids {
            self.thunks.mark_failed(id, ErrorCode::Timeout.message("thunk expired"));
        }
        for id in ids.iter().rev() {
            self.thunks.remove(id);
        }
        if let Some(parent) = parent {
            self.thunks.child_completed(&parent, thunk_id);
            self.try_finalize(&parent);
        }
        if let Some(holder) = self.lock.holder() {
            if ids.contains(&holder) {
                self.lock.release(&holder);
            }
        }
    }

    // -- State reads ----------------------------------------------------

    fn get_state(
        &self,
        subscriber: SubscriberId,
        payload: GetStatePayload,
    ) -> Result<Value, String> {
        let state = self.store.get_state();
        // Initialization-phase exception: a subscriber with no recorded
        // subscription reads the full state.
        if payload.bypass_access_control || !self.subs.has_subscription(subscriber) {
            return Ok(state);
        }
        match payload.keys {
            Some(keys) if !keys.is_empty() => {
                let mut out = serde_json::Map::new();
                for key in keys {
                    if !self.subs.covers_key(subscriber, &key) {
                        return Err(ErrorCode::AccessDenied
                            .message(format!("read of {key} outside subscription")));
                    }
                    if let Some(value) = keypath::get_path(&state, &key) {
                        out.insert(key, value.clone());
                    }
                }
                Ok(Value::Object(out))
            }
            _ => Ok(self.subs.filter_state(subscriber, &state)),
        }
    }

    // -- Broadcast ------------------------------------------------------

    fn spawn_commit_broadcaster(self: &Arc<Self>) {
        let bridge = Arc::clone(self);
        let mut commits = self.store.subscribe();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    commit = commits.recv() => match commit {
                        Ok(commit) => bridge.broadcast_commit(commit).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "commit broadcaster lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        });
    }

    /// Project one commit through every subscription and push the
    /// per-subscriber partials, each tagged with this commit's update id.
    async fn broadcast_commit(&self, commit: StateCommit) {
        let partials = self.subs.diff(&commit.prev, &commit.next);
        if partials.is_empty() {
            return;
        }
        let update_id = Uuid::new_v4().to_string();
        let thunk_id = commit.thunk_id.filter(|id| self.thunks.contains(id));
        if let Some(thunk_id) = thunk_id.as_deref() {
            self.updates.track_update(
                thunk_id,
                &update_id,
                partials.iter().map(|(id, _)| *id),
            );
        }
        for (subscriber, partial) in partials {
            let payload = StateUpdatePayload {
                update_id: update_id.clone(),
                thunk_id: thunk_id.clone(),
                partial,
            };
            self.send_to(subscriber, envelope(protocol::STATE_UPDATE, &payload)).await;
        }
    }

    async fn send_to(&self, subscriber: SubscriberId, env: Envelope) {
        let sender = self.subscribers.lock().get(&subscriber).cloned();
        let Some(sender) = sender else {
            return;
        };
        if sender.send(env).await.is_err() {
            warn!(subscriber, "subscriber channel closed mid-send");
            self.detach(subscriber);
        }
    }

    // -- Expiry ----------------------------------------------------------

    fn spawn_expiry_sweep(self: &Arc<Self>) {
        let bridge = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(bridge.config.sweep_interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        for thunk_id in bridge.updates.cleanup_expired(bridge.config.update_max_age) {
                            bridge.try_finalize(&thunk_id);
                        }
                        for thunk_id in bridge.thunks.expired(bridge.config.update_max_age) {
                            bridge.reap_thunk(&thunk_id);
                        }
                    }
                }
            }
        });
    }

    // -- Introspection for embedders and tests --------------------------

    pub fn thunk_tracker(&self) -> &Arc<ThunkTracker> {
        &self.thunks
    }

    pub fn lock_manager(&self) -> &Arc<ThunkLockManager> {
        &self.lock
    }

    pub fn update_tracker(&self) -> &Arc<StateUpdateTracker> {
        &self.updates
    }

    pub fn scheduler(&self) -> &Arc<ActionScheduler> {
        &self.scheduler
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subs
    }
}

fn parse<T: DeserializeOwned>(payload: Value) -> Result<T, String> {
    serde_json::from_value(payload).map_err(|e| ErrorCode::ProtocolError.message(e))
}

#[cfg(test)]
#[path = "bridge_tests.rs"]
mod tests;
