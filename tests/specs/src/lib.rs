// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end kernel scenarios.
//!
//! Builds a real host kernel over the in-process transport and hands out
//! either full dispatch clients or raw subscriber handles (for scenarios
//! that need manual control over acknowledgments).

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use zubridge::action::SubscriberId;
use zubridge::bridge::Bridge;
use zubridge::config::KernelConfig;
use zubridge::protocol::{self, DispatchPayload, StateUpdateAckPayload, SubscriptionPayload};
use zubridge::state::{StateManager, StoreAdapter};
use zubridge::transport::{pair, ClientEndpoint, ClientSender, Envelope};
use zubridge_client::batcher::BatcherConfig;
use zubridge_client::dispatch::DispatchClient;

/// Install a test tracing subscriber honoring `RUST_LOG`. Safe to call
/// from every test; only the first call takes effect.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Build the scenario store: a counter, a theme flag, and an append-only
/// log for ordering assertions.
pub fn scenario_store() -> Arc<StoreAdapter> {
    let mut store = StoreAdapter::new(json!({
        "counter": 0,
        "theme": "light",
        "log": [],
    }));
    store.register_handler("COUNTER:INCREMENT", |state, _| {
        let mut next = state.clone();
        let n = next["counter"].as_i64().unwrap_or(0);
        next["counter"] = json!(n + 1);
        Ok(next)
    });
    store.register_handler("LOG:APPEND", |state, payload| {
        let mut next = state.clone();
        let Some(entries) = next["log"].as_array_mut() else {
            return Err("log is not an array".to_owned());
        };
        entries.push(payload.cloned().unwrap_or(Value::Null));
        Ok(next)
    });
    Arc::new(store)
}

/// A kernel plus its store, ready for subscribers.
pub struct Harness {
    pub bridge: Arc<Bridge>,
    pub store: Arc<StoreAdapter>,
}

impl Harness {
    pub fn new(config: KernelConfig) -> Self {
        let store = scenario_store();
        let bridge = Bridge::new(Arc::clone(&store) as Arc<dyn StateManager>, config);
        Self { bridge, store }
    }

    /// Attach a full dispatch client.
    pub async fn client(&self) -> anyhow::Result<DispatchClient> {
        let (host, endpoint) = pair(64);
        self.bridge.attach(host);
        Ok(DispatchClient::connect(endpoint, BatcherConfig::default()).await?)
    }

    /// Attach a raw subscriber with manual control over every frame —
    /// scenarios that must withhold acknowledgments use this.
    pub fn raw_subscriber(&self) -> RawSubscriber {
        let (host, ClientEndpoint { sender, incoming }) = pair(64);
        let id = self.bridge.attach(host);
        RawSubscriber { id, sender, incoming, stash: Vec::new() }
    }
}

/// A subscriber that does nothing on its own.
pub struct RawSubscriber {
    pub id: SubscriberId,
    pub sender: ClientSender,
    pub incoming: tokio::sync::mpsc::Receiver<Envelope>,
    stash: Vec<Envelope>,
}

impl RawSubscriber {
    pub async fn subscribe(&self, keys: &[&str]) -> anyhow::Result<Value> {
        let keys: Option<Vec<String>> =
            if keys.is_empty() { None } else { Some(keys.iter().map(|k| (*k).to_owned()).collect()) };
        self.sender
            .invoke(protocol::SUBSCRIBE, &SubscriptionPayload { keys })
            .await
            .map_err(|e| anyhow::anyhow!(e))
    }

    pub async fn dispatch(&self, action: zubridge::action::Action) -> anyhow::Result<()> {
        self.sender
            .send(protocol::DISPATCH, &DispatchPayload { action, parent_id: None })
            .await
            .map_err(|e| anyhow::anyhow!(e))
    }

    /// Receive envelopes until one arrives on `channel`, keeping the
    /// others for later calls (ack and update ordering is not
    /// deterministic across host tasks).
    pub async fn recv_on(&mut self, channel: &str) -> anyhow::Result<Value> {
        if let Some(index) = self.stash.iter().position(|env| env.channel == channel) {
            return Ok(self.stash.remove(index).payload);
        }
        let deadline = Duration::from_secs(2);
        let fut = async {
            loop {
                let Some(env) = self.incoming.recv().await else {
                    anyhow::bail!("channel closed while waiting for {channel}");
                };
                if env.channel == channel {
                    return Ok(env.payload);
                }
                self.stash.push(env);
            }
        };
        match tokio::time::timeout(deadline, fut).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!("timed out waiting for {channel}"),
        }
    }

    pub async fn ack_update(&self, update: &Value) -> anyhow::Result<()> {
        let payload = StateUpdateAckPayload {
            update_id: update["updateId"].as_str().unwrap_or_default().to_owned(),
            thunk_id: update["thunkId"].as_str().map(str::to_owned),
        };
        self.sender
            .send(protocol::STATE_UPDATE_ACK, &payload)
            .await
            .map_err(|e| anyhow::anyhow!(e))
    }
}

/// Poll until the probe holds, failing after two seconds.
pub async fn wait_until(mut probe: impl FnMut() -> bool) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !probe() {
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "condition never met");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}
