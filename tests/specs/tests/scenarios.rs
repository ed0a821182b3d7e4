// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end kernel scenarios over the in-process transport.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use zubridge::action::Action;
use zubridge::state::StateManager;
use zubridge::config::KernelConfig;
use zubridge::protocol::{self, CompleteThunkPayload, RegisterThunkPayload};
use zubridge_specs::{init_tracing, wait_until, Harness};

fn register_payload(thunk_id: &str) -> RegisterThunkPayload {
    RegisterThunkPayload {
        thunk_id: thunk_id.to_owned(),
        parent_id: None,
        bypass_thunk_lock: false,
        bypass_access_control: false,
    }
}

#[tokio::test]
async fn basic_dispatch_round_trip() -> anyhow::Result<()> {
    init_tracing();
    let harness = Harness::new(KernelConfig::default());
    let client = harness.client().await?;
    client.subscribe(&["counter"]).await.map_err(|e| anyhow::anyhow!(e))?;

    client
        .dispatch(Action::new("COUNTER:INCREMENT"))
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    // The commit lands in the store and the filtered partial reaches the
    // subscriber's replica.
    assert_eq!(harness.store.get_state()["counter"], json!(1));
    wait_until(|| client.local_state()["counter"] == json!(1)).await?;
    Ok(())
}

#[tokio::test]
async fn root_thunk_defers_foreign_action_until_fully_done() -> anyhow::Result<()> {
    init_tracing();
    let harness = Harness::new(KernelConfig::default());
    let a = harness.client().await?;
    a.subscribe(&["log"]).await.map_err(|e| anyhow::anyhow!(e))?;
    let b = harness.client().await?;

    let thunk = a.register_thunk(false).await.map_err(|e| anyhow::anyhow!(e))?;

    // α (thunk-bound) runs immediately; β (foreign) queues.
    thunk
        .dispatch(Action::new("LOG:APPEND").with_payload(json!("alpha")))
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    let beta = tokio::spawn(async move {
        b.dispatch(Action::new("LOG:APPEND").with_payload(json!("beta"))).await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    // β has not run: the log still only holds α.
    assert_eq!(harness.store.get_state()["log"], json!(["alpha"]));

    thunk.complete(None).await.map_err(|e| anyhow::anyhow!(e))?;
    beta.await?.map_err(|e| anyhow::anyhow!(e))?;

    // Strict ordering: α strictly before β.
    assert_eq!(harness.store.get_state()["log"], json!(["alpha", "beta"]));
    assert!(harness.bridge.lock_manager().holder().is_none());
    Ok(())
}

#[tokio::test]
async fn overflow_with_mixed_priorities_drops_the_oldest_regular() -> anyhow::Result<()> {
    init_tracing();
    let harness = Harness::new(KernelConfig::default().with_max_queue_size(3));
    let mut b = harness.raw_subscriber();

    // Hold the lock so regular actions queue.
    harness.bridge.lock_manager().try_acquire("t-hold", 99);

    for i in 0..3 {
        b.dispatch(Action::new("LOG:APPEND").with_payload(json!(i))).await?;
    }
    wait_until(|| harness.bridge.scheduler().queue_len() == 3).await?;

    // A higher-priority foreign thunk child also has to queue; admission
    // under pressure evicts the oldest regular entry to make room.
    let crowded = Action::new("LOG:APPEND").with_payload(json!("crowd")).with_parent("t-other");
    b.dispatch(crowded).await?;

    // Bound holds, the oldest regular action was dropped, and its ack
    // carries the overflow error.
    let ack = b.recv_on(protocol::DISPATCH_ACK).await?;
    let error = ack["error"].as_str().unwrap_or_default();
    assert!(error.starts_with("QUEUE_OVERFLOW"), "{error}");
    assert_eq!(harness.bridge.scheduler().queue_len(), 3);
    assert_eq!(harness.bridge.scheduler().dropped_count(), 1);
    Ok(())
}

#[tokio::test]
async fn subscription_filter_only_fires_for_subscribed_keys() -> anyhow::Result<()> {
    init_tracing();
    let harness = Harness::new(KernelConfig::default());
    let mut a = harness.raw_subscriber();
    a.subscribe(&["counter"]).await?;
    let b = harness.client().await?;

    // Theme change: A hears nothing.
    b.dispatch(Action::new("setState").with_payload(json!({"theme": "dark"})))
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    // Counter change: A gets exactly the counter partial.
    b.dispatch(Action::new("COUNTER:INCREMENT")).await.map_err(|e| anyhow::anyhow!(e))?;

    let update = a.recv_on(protocol::STATE_UPDATE).await?;
    assert_eq!(update["partial"], json!({"counter": 1}));
    Ok(())
}

#[tokio::test]
async fn thunk_completion_waits_for_all_acks_and_dead_subscribers_unblock()
-> anyhow::Result<()> {
    init_tracing();
    let harness = Harness::new(KernelConfig::default());
    let mut a = harness.raw_subscriber();
    a.subscribe(&["counter"]).await?;
    let mut b = harness.raw_subscriber();
    b.subscribe(&["counter"]).await?;
    let mut c = harness.raw_subscriber();

    // A registers and runs a thunk-bound action; both A and B receive the
    // update and owe acks.
    a.sender
        .send(protocol::REGISTER_THUNK, &register_payload("t-1"))
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    a.recv_on(protocol::REGISTER_THUNK_ACK).await?;

    a.dispatch(Action::new("COUNTER:INCREMENT").with_parent("t-1")).await?;
    let update_a = a.recv_on(protocol::STATE_UPDATE).await?;
    let update_b = b.recv_on(protocol::STATE_UPDATE).await?;
    assert_eq!(update_a["updateId"], update_b["updateId"]);

    // C's foreign action queues behind the lock.
    c.dispatch(Action::new("COUNTER:INCREMENT")).await?;

    a.sender
        .send(
            protocol::COMPLETE_THUNK,
            &CompleteThunkPayload { thunk_id: "t-1".to_owned(), result: None },
        )
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    a.ack_update(&update_a).await?;

    // B has not acked: the lock must still be held.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.bridge.lock_manager().holder().as_deref(), Some("t-1"));

    // B dies before acking; cleanup settles the update, the lock
    // releases, and C's queued action finally runs.
    drop(b);
    let bridge = Arc::clone(&harness.bridge);
    wait_until(move || bridge.lock_manager().holder().is_none()).await?;
    let ack = c.recv_on(protocol::DISPATCH_ACK).await?;
    assert!(ack["error"].is_null());
    assert_eq!(harness.store.get_state()["counter"], json!(2));
    Ok(())
}

#[tokio::test]
async fn batched_dispatches_preserve_order_and_resolve_individually() -> anyhow::Result<()> {
    init_tracing();
    let harness = Harness::new(KernelConfig::default());
    let client = harness.client().await?;

    // Two regular appends inside the window, then a lock-bypassing one
    // that forces the flush; ordering within the batch must hold.
    let (r1, r2, r3) = tokio::join!(
        client.dispatch(Action::new("LOG:APPEND").with_payload(json!(1))),
        client.dispatch(Action::new("LOG:APPEND").with_payload(json!(2))),
        client.dispatch(
            Action::new("LOG:APPEND").with_payload(json!(3)).bypassing_thunk_lock()
        ),
    );
    r1.map_err(|e| anyhow::anyhow!(e))?;
    r2.map_err(|e| anyhow::anyhow!(e))?;
    r3.map_err(|e| anyhow::anyhow!(e))?;

    assert_eq!(harness.store.get_state()["log"], json!([1, 2, 3]));
    Ok(())
}

#[tokio::test]
async fn concurrent_root_thunks_are_linearized() -> anyhow::Result<()> {
    init_tracing();
    let harness = Harness::new(KernelConfig::default());
    let a = harness.client().await?;
    let b = harness.client().await?;

    let ta = a.register_thunk(false).await.map_err(|e| anyhow::anyhow!(e))?;
    let ta_id = ta.id().to_owned();

    // B's registration parks behind A's lock; its ack only fires once the
    // holder's tree completes, so acquisition is linearized.
    let (tb, ()) = tokio::join!(b.register_thunk(false), async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            harness.bridge.lock_manager().holder().as_deref(),
            Some(ta_id.as_str()),
            "first registrant must hold the lock"
        );
        ta.dispatch(Action::new("COUNTER:INCREMENT")).await.unwrap();
        ta.complete(None).await.unwrap();
    });
    let tb = tb.map_err(|e| anyhow::anyhow!(e))?;
    assert_eq!(harness.bridge.lock_manager().holder().as_deref(), Some(tb.id()));

    tb.dispatch(Action::new("COUNTER:INCREMENT")).await.map_err(|e| anyhow::anyhow!(e))?;
    tb.complete(None).await.map_err(|e| anyhow::anyhow!(e))?;

    let bridge = Arc::clone(&harness.bridge);
    wait_until(move || bridge.lock_manager().holder().is_none()).await?;
    assert_eq!(harness.store.get_state()["counter"], json!(2));
    assert!(!harness.bridge.thunk_tracker().has_active_thunks());
    Ok(())
}

#[tokio::test]
async fn abandoned_thunk_is_reaped_and_releases_the_lock() -> anyhow::Result<()> {
    init_tracing();
    let config = KernelConfig::default()
        .with_update_max_age(Duration::from_millis(50))
        .with_sweep_interval(Duration::from_millis(20));
    let harness = Harness::new(config);
    let a = harness.client().await?;
    let b = harness.client().await?;

    let thunk = a.register_thunk(false).await.map_err(|e| anyhow::anyhow!(e))?;
    let thunk_id = thunk.id().to_owned();
    // A walks away without completing the thunk. The sweep reaps it and
    // releases the lock, so B's work proceeds.
    drop(thunk);

    let bridge = Arc::clone(&harness.bridge);
    wait_until(move || bridge.lock_manager().holder().is_none()).await?;
    assert!(!harness.bridge.thunk_tracker().contains(&thunk_id));

    b.dispatch(Action::new("COUNTER:INCREMENT")).await.map_err(|e| anyhow::anyhow!(e))?;
    assert_eq!(harness.store.get_state()["counter"], json!(1));
    Ok(())
}
