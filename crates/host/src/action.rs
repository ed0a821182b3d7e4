// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Actions: typed records describing an intended state mutation, plus the
//! ambient metadata the host stamps on receipt.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Token identifying a connected view process. Minted by the host when a
/// channel attaches; subscribers never choose their own.
pub type SubscriberId = u32;

/// A typed state mutation plus ambient metadata.
///
/// Wire field names (`__id`, `__thunkParentId`, ...) are fixed; every peer
/// implementation of the protocol agrees on them byte for byte.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    /// Opaque domain type, e.g. `"COUNTER:INCREMENT"` or `"setState"`.
    #[serde(rename = "type")]
    pub action_type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    /// Unique per action. Immutable once assigned; the host assigns a
    /// generated id when a subscriber omits it.
    #[serde(rename = "__id", default)]
    pub id: String,

    /// Binds this action to a thunk; set for every action a thunk dispatches.
    #[serde(rename = "__thunkParentId", default, skip_serializing_if = "Option::is_none")]
    pub thunk_parent_id: Option<String>,

    /// Permits running even while the thunk lock is held by someone else.
    #[serde(rename = "__bypassThunkLock", default)]
    pub bypass_thunk_lock: bool,

    /// Permits reading keys the subscriber is not subscribed to.
    #[serde(rename = "__bypassAccessControl", default)]
    pub bypass_access_control: bool,

    /// Stamped by the host on receipt; subscriber-provided values are
    /// overwritten.
    #[serde(rename = "__sourceSubscriberId", default, skip_serializing_if = "Option::is_none")]
    pub source_subscriber_id: Option<SubscriberId>,
}

impl Action {
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            payload: None,
            id: Uuid::new_v4().to_string(),
            thunk_parent_id: None,
            bypass_thunk_lock: false,
            bypass_access_control: false,
            source_subscriber_id: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_parent(mut self, thunk_id: impl Into<String>) -> Self {
        self.thunk_parent_id = Some(thunk_id.into());
        self
    }

    pub fn bypassing_thunk_lock(mut self) -> Self {
        self.bypass_thunk_lock = true;
        self
    }

    pub fn bypassing_access_control(mut self) -> Self {
        self.bypass_access_control = true;
        self
    }

    /// Assign a generated id if the subscriber omitted one.
    pub fn ensure_id(&mut self) {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
    }
}

#[cfg(test)]
#[path = "action_tests.rs"]
mod tests;
