// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::thunk::ThunkState;

struct Fixture {
    queue: Arc<ThunkRegistrationQueue>,
    lock: Arc<ThunkLockManager>,
    thunks: Arc<ThunkTracker>,
}

fn fixture() -> Fixture {
    let lock = Arc::new(ThunkLockManager::new());
    let thunks = Arc::new(ThunkTracker::new());
    let queue = ThunkRegistrationQueue::new(Arc::clone(&lock), Arc::clone(&thunks));
    Fixture { queue, lock, thunks }
}

#[tokio::test]
async fn root_registration_acquires_lock() {
    let f = fixture();
    let rx = f.queue.register("t-1", None, 1, false, false);
    rx.await.unwrap().unwrap();

    assert_eq!(f.lock.holder().as_deref(), Some("t-1"));
    assert_eq!(f.thunks.get("t-1").map(|t| t.state), Some(ThunkState::Executing));
    assert_eq!(f.thunks.get("t-1").and_then(|t| t.source_subscriber_id), Some(1));
}

#[tokio::test]
async fn second_root_waits_for_release() {
    let f = fixture();
    f.queue.register("t-1", None, 1, false, false).await.unwrap().unwrap();
    let rx2 = f.queue.register("t-2", None, 2, false, false);
    assert_eq!(f.queue.pending_count(), 1);
    assert!(!f.thunks.contains("t-2"));

    f.lock.release("t-1");
    f.queue.drain();
    rx2.await.unwrap().unwrap();
    assert_eq!(f.lock.holder().as_deref(), Some("t-2"));
}

#[tokio::test]
async fn registrations_drain_in_fifo_order() {
    let f = fixture();
    f.queue.register("t-1", None, 1, false, false).await.unwrap().unwrap();
    let rx2 = f.queue.register("t-2", None, 2, false, false);
    let rx3 = f.queue.register("t-3", None, 3, false, false);
    assert_eq!(f.queue.pending_count(), 2);

    f.lock.release("t-1");
    f.queue.drain();
    rx2.await.unwrap().unwrap();
    // t-2 now holds the lock; t-3 still parked.
    assert_eq!(f.lock.holder().as_deref(), Some("t-2"));
    assert_eq!(f.queue.pending_count(), 1);

    f.lock.release("t-2");
    f.queue.drain();
    rx3.await.unwrap().unwrap();
    assert_eq!(f.lock.holder().as_deref(), Some("t-3"));
}

#[tokio::test]
async fn child_of_holder_registers_while_locked() {
    let f = fixture();
    f.queue.register("root", None, 1, false, false).await.unwrap().unwrap();
    let rx = f.queue.register("child", Some("root"), 1, false, false);
    rx.await.unwrap().unwrap();

    assert!(f.thunks.has_pending_children("root"));
    assert_eq!(f.thunks.get("child").map(|t| t.state), Some(ThunkState::Executing));
    // The child does not take the lock.
    assert_eq!(f.lock.holder().as_deref(), Some("root"));
}

#[tokio::test]
async fn foreign_child_waits() {
    let f = fixture();
    f.queue.register("root", None, 1, false, false).await.unwrap().unwrap();
    let _rx = f.queue.register("stranger-child", Some("other-root"), 2, false, false);
    assert_eq!(f.queue.pending_count(), 1);
    assert!(!f.thunks.contains("stranger-child"));
}

#[tokio::test]
async fn bypass_root_skips_the_lock() {
    let f = fixture();
    f.queue.register("t-1", None, 1, false, false).await.unwrap().unwrap();
    let rx = f.queue.register("t-2", None, 2, true, false);
    rx.await.unwrap().unwrap();

    // Registered without waiting and without disturbing the holder.
    assert_eq!(f.lock.holder().as_deref(), Some("t-1"));
    assert!(f.thunks.get("t-2").map(|t| t.bypass_thunk_lock).unwrap_or(false));
}

#[tokio::test]
async fn duplicate_registration_refused() {
    let f = fixture();
    f.queue.register("t-1", None, 1, false, false).await.unwrap().unwrap();
    let err = f.queue.register("t-1", None, 1, false, false).await.unwrap().unwrap_err();
    assert!(err.starts_with("THUNK_REGISTRATION_ERROR"), "{err}");
}

#[tokio::test]
async fn lock_listener_drains_on_release() {
    let f = fixture();
    let shutdown = CancellationToken::new();
    f.queue.spawn_lock_listener(shutdown.clone());

    f.queue.register("t-1", None, 1, false, false).await.unwrap().unwrap();
    let rx2 = f.queue.register("t-2", None, 2, false, false);
    f.lock.release("t-1");

    rx2.await.unwrap().unwrap();
    assert_eq!(f.lock.holder().as_deref(), Some("t-2"));
    shutdown.cancel();
}
