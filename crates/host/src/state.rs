// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! State manager adapter: the uniform shim the kernel consumes over a
//! concrete store. Read a snapshot, watch commits, apply an action.
//!
//! The bundled [`StoreAdapter`] keeps state as a JSON tree and resolves
//! actions through a fixed strategy order: registered handler map,
//! registered reducer, built-in `setState` shallow-merge, then the
//! store-attached method table. Handlers may be sync or async; async
//! handlers surface as [`ProcessOutcome::Async`] and commit when their
//! future completes.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::action::Action;
use crate::error::ErrorCode;
use crate::keypath::shallow_merge;

/// A committed state change, observed in commit order.
#[derive(Debug, Clone)]
pub struct StateCommit {
    pub prev: Value,
    pub next: Value,
    /// The thunk the committing action belonged to, if any.
    pub thunk_id: Option<String>,
}

/// Result of handing an action to the store.
///
/// Callers branch on the variant instead of sniffing for futures: `Sync`
/// carries the settled outcome, `Async` a future that commits on
/// completion.
pub enum ProcessOutcome {
    Sync(Result<(), String>),
    Async(BoxFuture<'static, Result<(), String>>),
}

/// The store contract the kernel consumes.
pub trait StateManager: Send + Sync {
    /// Immutable snapshot of the current state.
    fn get_state(&self) -> Value;

    /// Watch commits. Listeners observe commits in commit order; dropping
    /// the receiver unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<StateCommit>;

    /// Apply an action. Errors are serialized to strings and surfaced in
    /// the outcome, never thrown.
    fn process_action(&self, action: &Action) -> ProcessOutcome;
}

type SyncHandler = Box<dyn Fn(&Value, Option<&Value>) -> Result<Value, String> + Send + Sync>;
type AsyncHandler =
    Box<dyn Fn(Value, Option<Value>) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;
type Reducer = Box<dyn Fn(&Value, &Action) -> Value + Send + Sync>;

enum Handler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

/// How an action type resolved, in strategy order.
enum Resolution<'a> {
    Handler(&'a Handler),
    Reducer(&'a Reducer),
    SetState,
    StateMethod(&'a SyncHandler),
    Unhandled,
}

/// State root plus the commit channel; shared with async handler futures
/// so they can commit after the adapter call returns.
struct StoreCore {
    state: RwLock<Value>,
    commit_tx: broadcast::Sender<StateCommit>,
}

impl StoreCore {
    /// Swap in the next state and emit the commit.
    fn commit(&self, next: Value, thunk_id: Option<String>) {
        let prev = {
            let mut state = self.state.write();
            std::mem::replace(&mut *state, next.clone())
        };
        let _ = self.commit_tx.send(StateCommit { prev, next, thunk_id });
    }
}

/// JSON-tree store with pluggable action handlers.
pub struct StoreAdapter {
    core: Arc<StoreCore>,
    /// Keyed by lowercased action type; dotted paths allowed
    /// (`counter.increment`).
    handlers: HashMap<String, Handler>,
    reducer: Option<Reducer>,
    /// Store-attached methods, matched by lowercased action type after
    /// every other strategy misses.
    methods: HashMap<String, SyncHandler>,
}

impl StoreAdapter {
    pub fn new(initial: Value) -> Self {
        let (commit_tx, _) = broadcast::channel(256);
        Self {
            core: Arc::new(StoreCore { state: RwLock::new(initial), commit_tx }),
            handlers: HashMap::new(),
            reducer: None,
            methods: HashMap::new(),
        }
    }

    /// Register a synchronous handler for an action type. The handler
    /// receives the current snapshot and payload and returns the next
    /// state. Lookup is case-insensitive.
    pub fn register_handler<F>(&mut self, action_type: &str, handler: F)
    where
        F: Fn(&Value, Option<&Value>) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.handlers.insert(action_type.to_lowercase(), Handler::Sync(Box::new(handler)));
    }

    /// Register an async handler. The returned future resolves to the next
    /// state; the adapter commits when it completes.
    pub fn register_async_handler<F>(&mut self, action_type: &str, handler: F)
    where
        F: Fn(Value, Option<Value>) -> BoxFuture<'static, Result<Value, String>>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(action_type.to_lowercase(), Handler::Async(Box::new(handler)));
    }

    /// Register a reducer consulted when no handler matches.
    pub fn register_reducer<F>(&mut self, reducer: F)
    where
        F: Fn(&Value, &Action) -> Value + Send + Sync + 'static,
    {
        self.reducer = Some(Box::new(reducer));
    }

    /// Attach a method to the store itself, matched by action type when
    /// every earlier strategy misses.
    pub fn register_method<F>(&mut self, action_type: &str, method: F)
    where
        F: Fn(&Value, Option<&Value>) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.methods.insert(action_type.to_lowercase(), Box::new(method));
    }

    fn resolve(&self, action_type: &str) -> Resolution<'_> {
        let key = action_type.to_lowercase();
        if let Some(handler) = self.handlers.get(&key) {
            return Resolution::Handler(handler);
        }
        if let Some(reducer) = self.reducer.as_ref() {
            return Resolution::Reducer(reducer);
        }
        if key == "setstate" {
            return Resolution::SetState;
        }
        if let Some(method) = self.methods.get(&key) {
            return Resolution::StateMethod(method);
        }
        Resolution::Unhandled
    }

    fn apply_set_state(&self, action: &Action) -> Result<Value, String> {
        let Some(patch) = action.payload.as_ref().and_then(Value::as_object) else {
            return Err(ErrorCode::HandlerError
                .message(format!("setState payload must be an object ({})", action.action_type)));
        };
        let mut next = self.core.state.read().clone();
        shallow_merge(&mut next, patch);
        Ok(next)
    }
}

impl StateManager for StoreAdapter {
    fn get_state(&self) -> Value {
        self.core.state.read().clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<StateCommit> {
        self.core.commit_tx.subscribe()
    }

    fn process_action(&self, action: &Action) -> ProcessOutcome {
        let thunk_id = action.thunk_parent_id.clone();
        let sync_result = match self.resolve(&action.action_type) {
            Resolution::Handler(Handler::Sync(handler)) => {
                let snapshot = self.core.state.read().clone();
                handler(&snapshot, action.payload.as_ref())
            }
            Resolution::Handler(Handler::Async(handler)) => {
                let snapshot = self.core.state.read().clone();
                let fut = handler(snapshot, action.payload.clone());
                let core = Arc::clone(&self.core);
                let action_type = action.action_type.clone();
                return ProcessOutcome::Async(Box::pin(async move {
                    match fut.await {
                        Ok(next) => {
                            core.commit(next, thunk_id);
                            Ok(())
                        }
                        Err(err) => Err(ErrorCode::HandlerError
                            .message(format!("{action_type}: {err}"))),
                    }
                }));
            }
            Resolution::Reducer(reducer) => {
                let snapshot = self.core.state.read().clone();
                Ok(reducer(&snapshot, action))
            }
            Resolution::SetState => self.apply_set_state(action),
            Resolution::StateMethod(method) => {
                let snapshot = self.core.state.read().clone();
                method(&snapshot, action.payload.as_ref())
            }
            Resolution::Unhandled => Err(ErrorCode::HandlerError
                .message(format!("no handler for action type {}", action.action_type))),
        };

        match sync_result {
            Ok(next) => {
                self.core.commit(next, thunk_id);
                ProcessOutcome::Sync(Ok(()))
            }
            Err(err) => {
                let err = if crate::error::has_code(&err, ErrorCode::HandlerError) {
                    err
                } else {
                    ErrorCode::HandlerError.message(format!("{}: {err}", action.action_type))
                };
                ProcessOutcome::Sync(Err(err))
            }
        }
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
