// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-subscriber key-set registry and partial-state projection.
//!
//! Each subscriber holds an ordered set of dotted key patterns with the
//! distinguished `*` meaning "all keys". A subscription to `user` covers
//! reads and notifications of everything under `user`; the reverse never
//! holds. Notifications are diffed: a subscriber hears about a commit iff
//! at least one subscribed subtree actually changed.

use std::collections::HashMap;

use indexmap::IndexSet;
use parking_lot::RwLock;
use serde_json::Value;

use crate::action::SubscriberId;
use crate::keypath::{covers, get_path};

/// The wildcard pattern subsuming all specific keys.
pub const ALL_KEYS: &str = "*";

pub struct SubscriptionManager {
    subscriptions: RwLock<HashMap<SubscriberId, IndexSet<String>>>,
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self { subscriptions: RwLock::new(HashMap::new()) }
    }

    /// Merge `keys` into the subscriber's set. Omitted or empty keys (and
    /// an explicit `*`) subscribe to everything. Idempotent; duplicates
    /// collapse; once `*` is present specific keys are subsumed.
    pub fn subscribe(&self, id: SubscriberId, keys: &[String]) -> Vec<String> {
        let mut subs = self.subscriptions.write();
        let set = subs.entry(id).or_default();
        if keys.is_empty() || keys.iter().any(|k| k == ALL_KEYS) {
            set.clear();
            set.insert(ALL_KEYS.to_owned());
        } else if !set.contains(ALL_KEYS) {
            for key in keys {
                set.insert(key.clone());
            }
        }
        set.iter().cloned().collect()
    }

    /// Remove listed keys. Omitted/empty keys (or an explicit `*`) clear
    /// the whole set; removing a specific key while `*` is present is a
    /// no-op.
    pub fn unsubscribe(&self, id: SubscriberId, keys: &[String]) -> Vec<String> {
        let mut subs = self.subscriptions.write();
        let Some(set) = subs.get_mut(&id) else {
            return Vec::new();
        };
        if keys.is_empty() || keys.iter().any(|k| k == ALL_KEYS) {
            set.clear();
        } else if !set.contains(ALL_KEYS) {
            for key in keys {
                set.shift_remove(key);
            }
        }
        set.iter().cloned().collect()
    }

    /// The subscriber's current keys, in subscription order.
    pub fn current_keys(&self, id: SubscriberId) -> Vec<String> {
        self.subscriptions
            .read()
            .get(&id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether this subscriber has ever established a subscription.
    /// Distinguishes "never subscribed" (initialization phase, full state
    /// reads allowed) from "unsubscribed from everything".
    pub fn has_subscription(&self, id: SubscriberId) -> bool {
        self.subscriptions.read().contains_key(&id)
    }

    /// Whether the subscriber's key set covers a read of `key`.
    pub fn covers_key(&self, id: SubscriberId, key: &str) -> bool {
        let subs = self.subscriptions.read();
        let Some(set) = subs.get(&id) else {
            return false;
        };
        set.iter().any(|pattern| covers(pattern, key))
    }

    /// Drop all state for a departed subscriber.
    pub fn remove_subscriber(&self, id: SubscriberId) {
        self.subscriptions.write().remove(&id);
    }

    /// Ids of all subscribers with a recorded subscription.
    pub fn subscriber_ids(&self) -> Vec<SubscriberId> {
        self.subscriptions.read().keys().copied().collect()
    }

    /// Compute per-subscriber partials for a commit. A `*` subscriber
    /// receives the full new state as the delta set; otherwise each
    /// subscribed key whose subtree changed contributes
    /// `{key: subtree(next)}`. Subscribers with an empty partial are
    /// omitted — empty deltas are suppressed.
    pub fn diff(&self, prev: &Value, next: &Value) -> Vec<(SubscriberId, Value)> {
        let subs = self.subscriptions.read();
        let mut out = Vec::new();
        for (id, set) in subs.iter() {
            if let Some(partial) = partial_for(set, prev, next) {
                out.push((*id, partial));
            }
        }
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// Project `state` through the subscriber's key set for a read.
    /// Returns the full state for `*`; otherwise a flat
    /// `{key: subtree}` object over present keys.
    pub fn filter_state(&self, id: SubscriberId, state: &Value) -> Value {
        let subs = self.subscriptions.read();
        let Some(set) = subs.get(&id) else {
            return state.clone();
        };
        project(set, state)
    }
}

fn partial_for(set: &IndexSet<String>, prev: &Value, next: &Value) -> Option<Value> {
    if set.contains(ALL_KEYS) {
        if prev == next {
            return None;
        }
        return Some(next.clone());
    }
    let mut partial = serde_json::Map::new();
    for key in set {
        let before = get_path(prev, key);
        let after = get_path(next, key);
        if before != after {
            partial.insert(key.clone(), after.cloned().unwrap_or(Value::Null));
        }
    }
    if partial.is_empty() {
        None
    } else {
        Some(Value::Object(partial))
    }
}

fn project(set: &IndexSet<String>, state: &Value) -> Value {
    if set.contains(ALL_KEYS) {
        return state.clone();
    }
    let mut out = serde_json::Map::new();
    for key in set {
        if let Some(value) = get_path(state, key) {
            out.insert(key.clone(), value.clone());
        }
    }
    Value::Object(out)
}

#[cfg(test)]
#[path = "subscription_tests.rs"]
mod tests;
