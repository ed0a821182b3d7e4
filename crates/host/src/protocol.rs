// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire protocol: channel names and payload shapes.
//!
//! Channel names are opaque strings agreed on byte for byte by every peer
//! implementation; payloads are camelCase JSON. Every host response
//! carries either a result or an `error` string — failures never cross
//! the transport as anything else.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::{Action, SubscriberId};
use crate::thunk::ActiveThunksSummary;

pub const DISPATCH: &str = "zubridge/dispatch";
pub const DISPATCH_ACK: &str = "zubridge/dispatch_ack";
pub const DISPATCH_BATCH: &str = "zubridge/dispatch_batch";
pub const REGISTER_THUNK: &str = "zubridge/register_thunk";
pub const REGISTER_THUNK_ACK: &str = "zubridge/register_thunk_ack";
pub const COMPLETE_THUNK: &str = "zubridge/complete_thunk";
pub const STATE_UPDATE: &str = "zubridge/state_update";
pub const STATE_UPDATE_ACK: &str = "zubridge/state_update_ack";
pub const GET_STATE: &str = "zubridge/get_state";
pub const GET_WINDOW_ID: &str = "zubridge/get_window_id";
pub const GET_WINDOW_SUBSCRIPTIONS: &str = "zubridge/get_window_subscriptions";
pub const GET_THUNK_STATE: &str = "zubridge/get_thunk_state";
pub const SUBSCRIBE: &str = "zubridge/subscribe";
pub const UNSUBSCRIBE: &str = "zubridge/unsubscribe";

/// `zubridge/dispatch` — subscriber submits one action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchPayload {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

/// `zubridge/dispatch_ack` — host acknowledges a dispatch, always, even
/// when admission or processing failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchAck {
    pub action_id: String,
    pub thunk_state: ActiveThunksSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `zubridge/register_thunk`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterThunkPayload {
    pub thunk_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub bypass_thunk_lock: bool,
    #[serde(default)]
    pub bypass_access_control: bool,
}

/// `zubridge/register_thunk_ack`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterThunkAck {
    pub thunk_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `zubridge/complete_thunk`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteThunkPayload {
    pub thunk_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// `zubridge/state_update` — broadcast partial, acknowledged per update id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdatePayload {
    pub update_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thunk_id: Option<String>,
    pub partial: Value,
}

/// `zubridge/state_update_ack`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdateAckPayload {
    pub update_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thunk_id: Option<String>,
}

/// `zubridge/get_state`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetStatePayload {
    #[serde(default)]
    pub bypass_access_control: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
}

/// `zubridge/subscribe` and `zubridge/unsubscribe`. Omitted keys mean
/// "everything".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
}

/// `zubridge/get_window_subscriptions`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetSubscriptionsPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscriber_id: Option<SubscriberId>,
}

/// One action inside a `zubridge/dispatch_batch` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchedAction {
    pub id: String,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

/// `zubridge/dispatch_batch` — coalesced subscriber dispatches, ordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionBatch {
    pub batch_id: String,
    pub actions: Vec<BatchedAction>,
}

/// Per-action result row of a batch acknowledgment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchActionResult {
    pub action_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Batch acknowledgment: one row per submitted action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionBatchAck {
    pub batch_id: String,
    pub results: Vec<BatchActionResult>,
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
