// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Subscriber-side dispatch client.
//!
//! Wraps one transport channel to the host: routes dispatches through the
//! action batcher, correlates acks back to pending futures, maintains a
//! local state replica from broadcast partials, and acknowledges every
//! state update it applies. Reads are validated against the locally-known
//! subscription before they ever reach the wire.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use zubridge::action::{Action, SubscriberId};
use zubridge::error::ErrorCode;
use zubridge::keypath::set_path;
use zubridge::protocol::{
    self, ActionBatchAck, CompleteThunkPayload, DispatchAck, DispatchPayload, GetStatePayload,
    GetSubscriptionsPayload, RegisterThunkAck, RegisterThunkPayload, StateUpdateAckPayload,
    StateUpdatePayload, SubscriptionPayload,
};
use zubridge::subscription::ALL_KEYS;
use zubridge::thunk::ActiveThunksSummary;
use zubridge::transport::{ClientEndpoint, ClientSender};

use crate::batcher::{local_priority, ActionBatcher, BatcherConfig};

type PendingMap = Mutex<HashMap<String, oneshot::Sender<Result<(), String>>>>;

struct ClientInner {
    sender: ClientSender,
    window_id: SubscriberId,
    pending_acks: PendingMap,
    pending_thunks: PendingMap,
    local_state: Mutex<Value>,
    /// Keys this subscriber believes it is subscribed to; `None` until
    /// the first subscribe call round-trips.
    subscription: Mutex<Option<Vec<String>>>,
    latest_thunks: Mutex<ActiveThunksSummary>,
}

/// One subscriber's connection to the host kernel.
pub struct DispatchClient {
    inner: Arc<ClientInner>,
    batcher: ActionBatcher,
}

impl DispatchClient {
    /// Establish the connection: learn our window id, seed the local
    /// replica, and start the receive loop.
    pub async fn connect(
        endpoint: ClientEndpoint,
        batcher_config: BatcherConfig,
    ) -> anyhow::Result<Self> {
        let ClientEndpoint { sender, incoming } = endpoint;
        let window_id = sender
            .invoke(protocol::GET_WINDOW_ID, &Value::Null)
            .await
            .map_err(|e| anyhow::anyhow!("window id handshake failed: {e}"))?;
        let window_id: SubscriberId = serde_json::from_value(window_id)?;
        let initial = sender
            .invoke(protocol::GET_STATE, &GetStatePayload::default())
            .await
            .unwrap_or(Value::Null);

        let inner = Arc::new(ClientInner {
            sender: sender.clone(),
            window_id,
            pending_acks: Mutex::new(HashMap::new()),
            pending_thunks: Mutex::new(HashMap::new()),
            local_state: Mutex::new(initial),
            subscription: Mutex::new(None),
            latest_thunks: Mutex::new(ActiveThunksSummary { version: 0, thunks: vec![] }),
        });
        spawn_receive_loop(Arc::clone(&inner), incoming);

        let batcher_sink = {
            let sender = sender.clone();
            move |batch: zubridge::protocol::ActionBatch| -> futures_util::future::BoxFuture<
                'static,
                Result<ActionBatchAck, String>,
            > {
                let sender = sender.clone();
                Box::pin(async move {
                    let value = sender.invoke(protocol::DISPATCH_BATCH, &batch).await?;
                    serde_json::from_value(value)
                        .map_err(|e| ErrorCode::ProtocolError.message(e))
                })
            }
        };
        let batcher = ActionBatcher::new(batcher_config, batcher_sink);
        Ok(Self { inner, batcher })
    }

    pub fn window_id(&self) -> SubscriberId {
        self.inner.window_id
    }

    /// Current local replica of the (subscribed) state.
    pub fn local_state(&self) -> Value {
        self.inner.local_state.lock().clone()
    }

    /// Most recent thunk summary piggybacked on an ack.
    pub fn thunk_state(&self) -> ActiveThunksSummary {
        self.inner.latest_thunks.lock().clone()
    }

    // -- Subscriptions ---------------------------------------------------

    pub async fn subscribe(&self, keys: &[&str]) -> Result<Vec<String>, String> {
        let payload = SubscriptionPayload { keys: owned_keys(keys) };
        let value = self.inner.sender.invoke(protocol::SUBSCRIBE, &payload).await?;
        let keys: Vec<String> =
            serde_json::from_value(value).map_err(|e| ErrorCode::ProtocolError.message(e))?;
        *self.inner.subscription.lock() = Some(keys.clone());
        Ok(keys)
    }

    pub async fn unsubscribe(&self, keys: &[&str]) -> Result<Vec<String>, String> {
        let payload = SubscriptionPayload { keys: owned_keys(keys) };
        let value = self.inner.sender.invoke(protocol::UNSUBSCRIBE, &payload).await?;
        let keys: Vec<String> =
            serde_json::from_value(value).map_err(|e| ErrorCode::ProtocolError.message(e))?;
        *self.inner.subscription.lock() = Some(keys.clone());
        Ok(keys)
    }

    pub async fn window_subscriptions(&self) -> Result<Vec<String>, String> {
        let value = self
            .inner
            .sender
            .invoke(protocol::GET_WINDOW_SUBSCRIPTIONS, &GetSubscriptionsPayload::default())
            .await?;
        serde_json::from_value(value).map_err(|e| ErrorCode::ProtocolError.message(e))
    }

    // -- Reads -----------------------------------------------------------

    /// Fetch the host-filtered state. Requested keys are validated
    /// locally first; a read outside the subscription fails synchronously
    /// unless `bypass_access_control` is set.
    pub async fn get_state(&self, payload: GetStatePayload) -> Result<Value, String> {
        if !payload.bypass_access_control {
            if let Some(keys) = payload.keys.as_deref() {
                for key in keys {
                    if let Some(error) = self.read_access_error(key) {
                        return Err(error);
                    }
                }
            }
        }
        self.inner.sender.invoke(protocol::GET_STATE, &payload).await
    }

    fn read_access_error(&self, key: &str) -> Option<String> {
        let subscription = self.inner.subscription.lock();
        let keys = subscription.as_deref()?;
        let covered =
            keys.iter().any(|pattern| zubridge::keypath::covers(pattern, key));
        if covered {
            None
        } else {
            Some(ErrorCode::AccessDenied.message(format!("read of {key} outside subscription")))
        }
    }

    pub async fn fetch_thunk_state(&self) -> Result<ActiveThunksSummary, String> {
        let value = self.inner.sender.invoke(protocol::GET_THUNK_STATE, &Value::Null).await?;
        serde_json::from_value(value).map_err(|e| ErrorCode::ProtocolError.message(e))
    }

    // -- Dispatch --------------------------------------------------------

    /// Dispatch through the batcher; resolves from the batch result row.
    pub async fn dispatch(&self, mut action: Action) -> Result<(), String> {
        action.ensure_id();
        if let Some(error) = self.write_access_error(&action) {
            return Err(error);
        }
        let priority = local_priority(&action);
        let parent = action.thunk_parent_id.clone();
        let rx = self.batcher.enqueue(action, priority, parent);
        rx.await.map_err(|_| ErrorCode::Destroyed.message("batcher dropped the action"))?
    }

    /// Dispatch unbatched; resolves from the host's `dispatch_ack`.
    pub async fn dispatch_direct(&self, mut action: Action) -> Result<(), String> {
        action.ensure_id();
        if let Some(error) = self.write_access_error(&action) {
            return Err(error);
        }
        let (tx, rx) = oneshot::channel();
        self.inner.pending_acks.lock().insert(action.id.clone(), tx);
        let payload = DispatchPayload { action, parent_id: None };
        self.inner.sender.send(protocol::DISPATCH, &payload).await?;
        rx.await.map_err(|_| ErrorCode::Destroyed.message("connection closed before ack"))?
    }

    /// Writes shaped as `setState` are validated against the local
    /// subscription before hitting the wire.
    fn write_access_error(&self, action: &Action) -> Option<String> {
        if action.bypass_access_control
            || !action.action_type.eq_ignore_ascii_case("setstate")
        {
            return None;
        }
        let payload = action.payload.as_ref()?.as_object()?;
        for key in payload.keys() {
            if let Some(error) = self.read_access_error(key) {
                return Some(error);
            }
        }
        None
    }

    // -- Thunks ----------------------------------------------------------

    /// Register a root thunk and wait for the host's acceptance. The
    /// returned session dispatches under the thunk's lock tenancy.
    pub async fn register_thunk(&self, bypass_thunk_lock: bool) -> Result<ThunkSession<'_>, String> {
        let thunk_id = Uuid::new_v4().to_string();
        self.register_thunk_with_id(&thunk_id, None, bypass_thunk_lock).await?;
        Ok(ThunkSession { client: self, thunk_id })
    }

    async fn register_thunk_with_id(
        &self,
        thunk_id: &str,
        parent_id: Option<&str>,
        bypass_thunk_lock: bool,
    ) -> Result<(), String> {
        let (tx, rx) = oneshot::channel();
        self.inner.pending_thunks.lock().insert(thunk_id.to_owned(), tx);
        let payload = RegisterThunkPayload {
            thunk_id: thunk_id.to_owned(),
            parent_id: parent_id.map(str::to_owned),
            bypass_thunk_lock,
            bypass_access_control: false,
        };
        self.inner.sender.send(protocol::REGISTER_THUNK, &payload).await?;
        rx.await
            .map_err(|_| ErrorCode::Destroyed.message("connection closed before thunk ack"))?
    }

    async fn complete_thunk(&self, thunk_id: &str, result: Option<Value>) -> Result<(), String> {
        let payload = CompleteThunkPayload { thunk_id: thunk_id.to_owned(), result };
        self.inner.sender.send(protocol::COMPLETE_THUNK, &payload).await
    }

    /// Tear down: every pending and in-flight dispatch rejects.
    pub fn destroy(&self) {
        self.batcher.destroy();
    }
}

/// Lock tenancy for one registered thunk; dispatches are stamped with the
/// thunk id, and `complete` (or `fail`) ends the tenancy.
pub struct ThunkSession<'a> {
    client: &'a DispatchClient,
    thunk_id: String,
}

impl ThunkSession<'_> {
    pub fn id(&self) -> &str {
        &self.thunk_id
    }

    /// Dispatch an action bound to this thunk.
    pub async fn dispatch(&self, mut action: Action) -> Result<(), String> {
        action.thunk_parent_id = Some(self.thunk_id.clone());
        self.client.dispatch_direct(action).await
    }

    /// Register a child thunk under this one.
    pub async fn child(&self) -> Result<ThunkSession<'_>, String> {
        let child_id = Uuid::new_v4().to_string();
        self.client
            .register_thunk_with_id(&child_id, Some(&self.thunk_id), false)
            .await?;
        Ok(ThunkSession { client: self.client, thunk_id: child_id })
    }

    /// Mark the thunk complete on the host.
    pub async fn complete(self, result: Option<Value>) -> Result<(), String> {
        self.client.complete_thunk(&self.thunk_id, result).await
    }
}

fn owned_keys(keys: &[&str]) -> Option<Vec<String>> {
    if keys.is_empty() {
        None
    } else {
        Some(keys.iter().map(|k| (*k).to_owned()).collect())
    }
}

/// Pump host-pushed envelopes: resolve acks, apply state updates to the
/// local replica, and acknowledge every update we apply.
fn spawn_receive_loop(inner: Arc<ClientInner>, mut incoming: tokio::sync::mpsc::Receiver<zubridge::transport::Envelope>) {
    tokio::spawn(async move {
        while let Some(env) = incoming.recv().await {
            match env.channel.as_str() {
                protocol::DISPATCH_ACK => {
                    let Ok(ack) = serde_json::from_value::<DispatchAck>(env.payload) else {
                        warn!("malformed dispatch ack");
                        continue;
                    };
                    {
                        let mut latest = inner.latest_thunks.lock();
                        if ack.thunk_state.version >= latest.version {
                            *latest = ack.thunk_state.clone();
                        }
                    }
                    let pending = inner.pending_acks.lock().remove(&ack.action_id);
                    if let Some(tx) = pending {
                        let outcome = match ack.error {
                            Some(error) => Err(error),
                            None => Ok(()),
                        };
                        let _ = tx.send(outcome);
                    }
                }
                protocol::REGISTER_THUNK_ACK => {
                    let Ok(ack) = serde_json::from_value::<RegisterThunkAck>(env.payload) else {
                        warn!("malformed thunk registration ack");
                        continue;
                    };
                    let pending = inner.pending_thunks.lock().remove(&ack.thunk_id);
                    if let Some(tx) = pending {
                        let outcome = if ack.success {
                            Ok(())
                        } else {
                            Err(ack.error.unwrap_or_else(|| {
                                ErrorCode::ThunkRegistrationError.message("refused")
                            }))
                        };
                        let _ = tx.send(outcome);
                    }
                }
                protocol::STATE_UPDATE => {
                    let Ok(update) = serde_json::from_value::<StateUpdatePayload>(env.payload)
                    else {
                        warn!("malformed state update");
                        continue;
                    };
                    apply_update(&inner, &update);
                    let ack = StateUpdateAckPayload {
                        update_id: update.update_id,
                        thunk_id: update.thunk_id,
                    };
                    if inner.sender.send(protocol::STATE_UPDATE_ACK, &ack).await.is_err() {
                        return;
                    }
                }
                other => debug!(channel = other, "ignoring unexpected host push"),
            }
        }
    });
}

/// Merge a broadcast partial into the local replica. A wildcard (or
/// not-yet-known) subscription receives whole-state snapshots; specific
/// subscriptions receive flat `{dotted.key: subtree}` maps.
fn apply_update(inner: &ClientInner, update: &StateUpdatePayload) {
    let subscription = inner.subscription.lock();
    let wildcard = match subscription.as_deref() {
        Some(keys) => keys.iter().any(|k| k == ALL_KEYS),
        None => true,
    };
    drop(subscription);

    let mut state = inner.local_state.lock();
    if wildcard {
        *state = update.partial.clone();
        return;
    }
    let Some(entries) = update.partial.as_object() else {
        return;
    };
    for (key, value) in entries {
        set_path(&mut state, key, value.clone());
    }
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;
