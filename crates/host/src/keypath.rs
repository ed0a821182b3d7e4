// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Dotted-path access into JSON state trees.
//!
//! Subscription keys and partial-state projections address state with
//! dotted paths (`user.profile.name`). A path resolves by walking object
//! fields segment by segment; anything that is not an object terminates
//! the walk.

use serde_json::Value;

/// Resolve a dotted path against a JSON value.
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Write `value` at a dotted path, creating intermediate objects as needed.
///
/// Non-object intermediates are replaced by objects. Used by subscribers
/// applying flat `{key: subtree}` partials to a local replica.
pub fn set_path(root: &mut Value, path: &str, value: Value) {
    let mut current = root;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        let Some(map) = current.as_object_mut() else {
            return;
        };
        if segments.peek().is_none() {
            map.insert(segment.to_owned(), value);
            return;
        }
        current = map
            .entry(segment.to_owned())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
}

/// Whether a subscription to `pattern` covers reads of `key`.
///
/// A pattern covers itself and every dotted descendant: `user` covers
/// `user.profile.name`. The reverse does not hold.
pub fn covers(pattern: &str, key: &str) -> bool {
    if pattern == "*" || pattern == key {
        return true;
    }
    key.len() > pattern.len()
        && key.starts_with(pattern)
        && key.as_bytes()[pattern.len()] == b'.'
}

/// Shallow-merge the fields of an object `patch` into `target`.
///
/// Top-level fields are replaced wholesale; nested merges must be done by
/// explicit handlers. A non-object target is replaced by an object first.
pub fn shallow_merge(target: &mut Value, patch: &serde_json::Map<String, Value>) {
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Some(map) = target.as_object_mut() {
        for (key, value) in patch {
            map.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
#[path = "keypath_tests.rs"]
mod tests;
