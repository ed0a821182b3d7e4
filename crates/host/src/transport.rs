// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Abstract per-subscriber message channel.
//!
//! The kernel assumes a bidirectional, per-peer-ordered channel with two
//! delivery modes: fire-and-forget (`send`) and request/response
//! (`invoke`). Messages are [`Envelope`]s carrying a channel name plus a
//! JSON payload. The in-process [`pair`] implementation backs embedders
//! and the test suites; real deployments substitute their own transport
//! and speak the same frames.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::ErrorCode;

/// One protocol message: a channel name plus its payload.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub channel: String,
    pub payload: Value,
}

/// Build an envelope from a serializable payload.
pub fn envelope(channel: &str, payload: &impl Serialize) -> Envelope {
    Envelope {
        channel: channel.to_owned(),
        payload: serde_json::to_value(payload).unwrap_or(Value::Null),
    }
}

/// A frame as the host sees it.
pub enum Frame {
    /// Fire-and-forget message from the subscriber.
    Send(Envelope),
    /// Request expecting exactly one reply.
    Invoke { envelope: Envelope, reply: oneshot::Sender<Result<Value, String>> },
}

/// Host side of one subscriber channel.
pub struct HostEndpoint {
    pub incoming: mpsc::Receiver<Frame>,
    pub outgoing: mpsc::Sender<Envelope>,
}

/// Cloneable sending half of the subscriber side.
#[derive(Clone)]
pub struct ClientSender {
    to_host: mpsc::Sender<Frame>,
}

impl ClientSender {
    /// Fire-and-forget a message to the host.
    pub async fn send(&self, channel: &str, payload: &impl Serialize) -> Result<(), String> {
        self.to_host
            .send(Frame::Send(envelope(channel, payload)))
            .await
            .map_err(|_| ErrorCode::Destroyed.message("channel closed"))
    }

    /// Request/response round trip.
    pub async fn invoke(&self, channel: &str, payload: &impl Serialize) -> Result<Value, String> {
        let (reply, rx) = oneshot::channel();
        self.to_host
            .send(Frame::Invoke { envelope: envelope(channel, payload), reply })
            .await
            .map_err(|_| ErrorCode::Destroyed.message("channel closed"))?;
        rx.await.map_err(|_| ErrorCode::Destroyed.message("host dropped the request"))?
    }
}

/// Subscriber side of the channel: a cloneable sender plus the stream of
/// host-pushed messages.
pub struct ClientEndpoint {
    pub sender: ClientSender,
    pub incoming: mpsc::Receiver<Envelope>,
}

/// Create an in-process channel pair. `buffer` bounds both directions.
pub fn pair(buffer: usize) -> (HostEndpoint, ClientEndpoint) {
    let (to_host, from_client) = mpsc::channel(buffer);
    let (to_client, from_host) = mpsc::channel(buffer);
    (
        HostEndpoint { incoming: from_client, outgoing: to_client },
        ClientEndpoint { sender: ClientSender { to_host }, incoming: from_host },
    )
}

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;
