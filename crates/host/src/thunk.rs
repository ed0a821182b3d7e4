// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Thunk lifecycle tracking: the forest of in-flight composite scripts,
//! their parent-child bookkeeping, and the per-thunk action sets.
//!
//! Records live in an arena keyed by string id; parent→children and
//! subscriber→thunks are indexes over the records, never owning
//! references. Handles returned to callers look records up by id and go
//! inert once the record is erased.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::action::SubscriberId;

/// Thunk lifecycle states. `Completed` and `Failed` are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThunkState {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl ThunkState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One node in the thunk forest.
#[derive(Debug, Clone)]
pub struct Thunk {
    pub id: String,
    pub parent_id: Option<String>,
    pub source_subscriber_id: Option<SubscriberId>,
    pub state: ThunkState,
    pub child_ids: Vec<String>,
    pub pending_child_ids: HashSet<String>,
    pub action_ids: Vec<String>,
    pub bypass_thunk_lock: bool,
    pub bypass_access_control: bool,
    pub start_time: Instant,
    pub end_time: Option<Instant>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl Thunk {
    fn new(id: String, parent_id: Option<String>) -> Self {
        Self {
            id,
            parent_id,
            source_subscriber_id: None,
            state: ThunkState::Pending,
            child_ids: Vec::new(),
            pending_child_ids: HashSet::new(),
            action_ids: Vec::new(),
            bypass_thunk_lock: false,
            bypass_access_control: false,
            start_time: Instant::now(),
            end_time: None,
            result: None,
            error: None,
        }
    }
}

/// One row of the active-thunk summary piggybacked on dispatch acks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ThunkSummaryEntry {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscriber_id: Option<SubscriberId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

/// Snapshot of the active set plus the tracker's monotonic version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveThunksSummary {
    pub version: u64,
    pub thunks: Vec<ThunkSummaryEntry>,
}

struct TrackerInner {
    thunks: HashMap<String, Thunk>,
    by_subscriber: HashMap<SubscriberId, HashSet<String>>,
    /// Bumped on every lifecycle transition; consumers treat summaries as
    /// stale when the version goes backwards.
    version: u64,
}

pub struct ThunkTracker {
    inner: RwLock<TrackerInner>,
}

impl Default for ThunkTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ThunkTracker {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(TrackerInner {
                thunks: HashMap::new(),
                by_subscriber: HashMap::new(),
                version: 0,
            }),
        }
    }

    /// Register a new thunk under a generated id.
    pub fn register(self: &Arc<Self>, parent_id: Option<&str>) -> ThunkHandle {
        self.register_with_id(&Uuid::new_v4().to_string(), parent_id)
    }

    /// Register a thunk under a caller-chosen id (ids are minted by the
    /// dispatching subscriber so acks can correlate).
    pub fn register_with_id(self: &Arc<Self>, thunk_id: &str, parent_id: Option<&str>) -> ThunkHandle {
        {
            let mut inner = self.inner.write();
            inner
                .thunks
                .entry(thunk_id.to_owned())
                .or_insert_with(|| Thunk::new(thunk_id.to_owned(), parent_id.map(str::to_owned)));
            inner.version += 1;
        }
        if let Some(parent) = parent_id {
            self.add_child(parent, thunk_id);
        }
        ThunkHandle { id: thunk_id.to_owned(), tracker: Arc::clone(self) }
    }

    pub fn set_source_subscriber(&self, thunk_id: &str, subscriber_id: SubscriberId) {
        let mut inner = self.inner.write();
        if let Some(thunk) = inner.thunks.get_mut(thunk_id) {
            thunk.source_subscriber_id = Some(subscriber_id);
        }
        inner.by_subscriber.entry(subscriber_id).or_default().insert(thunk_id.to_owned());
    }

    pub fn set_bypass_flags(&self, thunk_id: &str, thunk_lock: bool, access_control: bool) {
        if let Some(thunk) = self.inner.write().thunks.get_mut(thunk_id) {
            thunk.bypass_thunk_lock = thunk_lock;
            thunk.bypass_access_control = access_control;
        }
    }

    /// Whether the thunk opted out of subscription-based access checks.
    pub fn bypasses_access_control(&self, thunk_id: &str) -> bool {
        self.inner
            .read()
            .thunks
            .get(thunk_id)
            .map(|t| t.bypass_access_control)
            .unwrap_or(false)
    }

    /// Pending → Executing. A thunk is executing iff it is in the active set.
    pub fn mark_executing(&self, thunk_id: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(thunk) = inner.thunks.get_mut(thunk_id) else {
            return false;
        };
        if thunk.state != ThunkState::Pending {
            return false;
        }
        thunk.state = ThunkState::Executing;
        inner.version += 1;
        true
    }

    /// Transition into Completed. Denied once terminal.
    pub fn mark_completed(&self, thunk_id: &str, result: Option<Value>) -> bool {
        self.finish(thunk_id, ThunkState::Completed, result, None)
    }

    /// Transition into Failed. Denied once terminal.
    pub fn mark_failed(&self, thunk_id: &str, error: impl Into<String>) -> bool {
        self.finish(thunk_id, ThunkState::Failed, None, Some(error.into()))
    }

    fn finish(
        &self,
        thunk_id: &str,
        state: ThunkState,
        result: Option<Value>,
        error: Option<String>,
    ) -> bool {
        let mut inner = self.inner.write();
        let Some(thunk) = inner.thunks.get_mut(thunk_id) else {
            return false;
        };
        if thunk.state.is_terminal() {
            return false;
        }
        thunk.state = state;
        thunk.end_time = Some(Instant::now());
        thunk.result = result;
        thunk.error = error;
        inner.version += 1;
        true
    }

    /// Record a parent→child edge; the child starts out pending.
    pub fn add_child(&self, parent_id: &str, child_id: &str) {
        let mut inner = self.inner.write();
        if let Some(parent) = inner.thunks.get_mut(parent_id) {
            if !parent.child_ids.iter().any(|c| c == child_id) {
                parent.child_ids.push(child_id.to_owned());
            }
            parent.pending_child_ids.insert(child_id.to_owned());
        }
    }

    /// A child terminated and was cleaned up; shrink the parent's pending
    /// set. Monotonic — a completed child never becomes pending again.
    pub fn child_completed(&self, parent_id: &str, child_id: &str) {
        let mut inner = self.inner.write();
        if let Some(parent) = inner.thunks.get_mut(parent_id) {
            parent.pending_child_ids.remove(child_id);
        }
    }

    pub fn add_action(&self, thunk_id: &str, action_id: &str) {
        let mut inner = self.inner.write();
        if let Some(thunk) = inner.thunks.get_mut(thunk_id) {
            thunk.action_ids.push(action_id.to_owned());
        }
    }

    /// All action ids dispatched by the thunk and its descendants.
    pub fn all_actions_for_thunk(&self, thunk_id: &str) -> Vec<String> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        let mut stack = vec![thunk_id.to_owned()];
        while let Some(id) = stack.pop() {
            if let Some(thunk) = inner.thunks.get(&id) {
                out.extend(thunk.action_ids.iter().cloned());
                stack.extend(thunk.child_ids.iter().cloned());
            }
        }
        out
    }

    pub fn get(&self, thunk_id: &str) -> Option<Thunk> {
        self.inner.read().thunks.get(thunk_id).cloned()
    }

    pub fn contains(&self, thunk_id: &str) -> bool {
        self.inner.read().thunks.contains_key(thunk_id)
    }

    pub fn parent_of(&self, thunk_id: &str) -> Option<String> {
        self.inner.read().thunks.get(thunk_id).and_then(|t| t.parent_id.clone())
    }

    pub fn is_terminal(&self, thunk_id: &str) -> bool {
        self.inner.read().thunks.get(thunk_id).map(|t| t.state.is_terminal()).unwrap_or(false)
    }

    pub fn has_pending_children(&self, thunk_id: &str) -> bool {
        self.inner
            .read()
            .thunks
            .get(thunk_id)
            .map(|t| !t.pending_child_ids.is_empty())
            .unwrap_or(false)
    }

    pub fn has_active_thunks(&self) -> bool {
        self.inner.read().thunks.values().any(|t| t.state == ThunkState::Executing)
    }

    pub fn has_active_thunks_for_subscriber(&self, subscriber_id: SubscriberId) -> bool {
        let inner = self.inner.read();
        let Some(ids) = inner.by_subscriber.get(&subscriber_id) else {
            return false;
        };
        ids.iter().any(|id| {
            inner.thunks.get(id).map(|t| t.state == ThunkState::Executing).unwrap_or(false)
        })
    }

    /// Erase a finished thunk from tracking. Callers gate this on terminal
    /// state, empty pending children, and no pending state updates.
    pub fn remove(&self, thunk_id: &str) -> Option<Thunk> {
        let mut inner = self.inner.write();
        let thunk = inner.thunks.remove(thunk_id)?;
        if let Some(subscriber) = thunk.source_subscriber_id {
            if let Some(ids) = inner.by_subscriber.get_mut(&subscriber) {
                ids.remove(thunk_id);
                if ids.is_empty() {
                    inner.by_subscriber.remove(&subscriber);
                }
            }
        }
        inner.version += 1;
        Some(thunk)
    }

    /// Ids of non-terminal thunks older than `max_age`, roots before
    /// descendants. Fed to the expiry reaper.
    pub fn expired(&self, max_age: Duration) -> Vec<String> {
        let inner = self.inner.read();
        let now = Instant::now();
        let mut out: Vec<&Thunk> = inner
            .thunks
            .values()
            .filter(|t| !t.state.is_terminal() && now.duration_since(t.start_time) > max_age)
            .collect();
        out.sort_by_key(|t| t.parent_id.is_some());
        out.iter().map(|t| t.id.clone()).collect()
    }

    /// Subtree rooted at `thunk_id`, children after parents.
    pub fn subtree(&self, thunk_id: &str) -> Vec<String> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        let mut stack = vec![thunk_id.to_owned()];
        while let Some(id) = stack.pop() {
            if let Some(thunk) = inner.thunks.get(&id) {
                stack.extend(thunk.child_ids.iter().cloned());
            }
            out.push(id);
        }
        out
    }

    /// Current version and the executing thunks, for ack piggybacking.
    /// Versions are monotonic across successive summaries.
    pub fn active_summary(&self) -> ActiveThunksSummary {
        let inner = self.inner.read();
        let mut thunks: Vec<ThunkSummaryEntry> = inner
            .thunks
            .values()
            .filter(|t| t.state == ThunkState::Executing)
            .map(|t| ThunkSummaryEntry {
                id: t.id.clone(),
                subscriber_id: t.source_subscriber_id,
                parent_id: t.parent_id.clone(),
            })
            .collect();
        thunks.sort_by(|a, b| a.id.cmp(&b.id));
        ActiveThunksSummary { version: inner.version, thunks }
    }

    pub fn state_version(&self) -> u64 {
        self.inner.read().version
    }
}

/// Weak handle to a tracked thunk: operations look the record up by id
/// and become no-ops once the record is erased.
#[derive(Clone)]
pub struct ThunkHandle {
    id: String,
    tracker: Arc<ThunkTracker>,
}

impl ThunkHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mark_executing(&self) -> bool {
        self.tracker.mark_executing(&self.id)
    }

    pub fn mark_completed(&self, result: Option<Value>) -> bool {
        self.tracker.mark_completed(&self.id, result)
    }

    pub fn mark_failed(&self, error: impl Into<String>) -> bool {
        self.tracker.mark_failed(&self.id, error)
    }

    pub fn add_child_thunk(&self, child_id: &str) {
        self.tracker.add_child(&self.id, child_id);
    }

    pub fn child_completed(&self, child_id: &str) {
        self.tracker.child_completed(&self.id, child_id);
    }

    pub fn add_action(&self, action_id: &str) {
        self.tracker.add_action(&self.id, action_id);
    }

    pub fn set_source_subscriber(&self, subscriber_id: SubscriberId) {
        self.tracker.set_source_subscriber(&self.id, subscriber_id);
    }
}

#[cfg(test)]
#[path = "thunk_tests.rs"]
mod tests;
