// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use std::sync::Arc as StdArc;
use tokio::sync::Notify;
use zubridge::protocol::BatchActionResult;

/// Sink that records batches and answers success for every row.
fn recording_sink(
    batches: StdArc<Mutex<Vec<ActionBatch>>>,
) -> impl Fn(ActionBatch) -> BoxFuture<'static, Result<ActionBatchAck, String>> {
    move |batch: ActionBatch| {
        let batches = StdArc::clone(&batches);
        Box::pin(async move {
            let results = batch
                .actions
                .iter()
                .map(|a| BatchActionResult {
                    action_id: a.id.clone(),
                    success: true,
                    error: None,
                })
                .collect();
            let ack = ActionBatchAck { batch_id: batch.batch_id.clone(), results };
            batches.lock().push(batch);
            Ok(ack)
        })
    }
}

fn action(id: &str) -> Action {
    let mut action = Action::new("TEST");
    action.id = id.to_owned();
    action
}

#[test]
fn local_priority_ranks_without_holder_knowledge() {
    assert_eq!(local_priority(&Action::new("A")), 0);
    assert_eq!(local_priority(&Action::new("A").with_parent("t-1")), 50);
    assert_eq!(local_priority(&Action::new("A").bypassing_thunk_lock()), 80);
    assert_eq!(
        local_priority(&Action::new("A").with_parent("t-1").bypassing_thunk_lock()),
        100
    );
}

#[tokio::test(start_paused = true)]
async fn window_coalesces_into_one_batch() {
    let batches = StdArc::new(Mutex::new(Vec::new()));
    let batcher = ActionBatcher::new(BatcherConfig::default(), recording_sink(StdArc::clone(&batches)));

    let rx1 = batcher.enqueue(action("a-1"), 0, None);
    let rx2 = batcher.enqueue(action("a-2"), 0, None);
    assert_eq!(batcher.queued_len(), 2);

    rx1.await.unwrap().unwrap();
    rx2.await.unwrap().unwrap();

    let batches = batches.lock();
    assert_eq!(batches.len(), 1);
    let ids: Vec<&str> = batches[0].actions.iter().map(|a| a.id.as_str()).collect();
    assert_eq!(ids, vec!["a-1", "a-2"]);
}

#[tokio::test(start_paused = true)]
async fn priority_triggers_single_flush_with_everything() {
    let batches = StdArc::new(Mutex::new(Vec::new()));
    let batcher = ActionBatcher::new(BatcherConfig::default(), recording_sink(StdArc::clone(&batches)));

    let rx1 = batcher.enqueue(action("a-1"), 50, None);
    let rx2 = batcher.enqueue(action("a-2"), 50, None);
    let mut urgent = action("a-3");
    urgent.bypass_thunk_lock = true;
    let rx3 = batcher.enqueue(urgent, 100, None);

    rx1.await.unwrap().unwrap();
    rx2.await.unwrap().unwrap();
    rx3.await.unwrap().unwrap();

    let batches = batches.lock();
    assert_eq!(batches.len(), 1, "expected exactly one flush");
    let ids: Vec<&str> = batches[0].actions.iter().map(|a| a.id.as_str()).collect();
    assert_eq!(ids, vec!["a-1", "a-2", "a-3"]);
}

#[tokio::test(start_paused = true)]
async fn full_batch_flushes_immediately() {
    let batches = StdArc::new(Mutex::new(Vec::new()));
    let config = BatcherConfig { max_batch_size: 3, ..BatcherConfig::default() };
    let batcher = ActionBatcher::new(config, recording_sink(StdArc::clone(&batches)));

    let mut receivers = Vec::new();
    for i in 0..3 {
        receivers.push(batcher.enqueue(action(&format!("a-{i}")), 0, None));
    }
    for rx in receivers {
        rx.await.unwrap().unwrap();
    }
    assert_eq!(batches.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn enqueues_during_flight_form_successor_batch() {
    let batches = StdArc::new(Mutex::new(Vec::new()));
    let gate = StdArc::new(Notify::new());
    let sink = {
        let batches = StdArc::clone(&batches);
        let gate = StdArc::clone(&gate);
        move |batch: ActionBatch| -> BoxFuture<'static, Result<ActionBatchAck, String>> {
            let batches = StdArc::clone(&batches);
            let gate = StdArc::clone(&gate);
            Box::pin(async move {
                gate.notified().await;
                let results = batch
                    .actions
                    .iter()
                    .map(|a| BatchActionResult {
                        action_id: a.id.clone(),
                        success: true,
                        error: None,
                    })
                    .collect();
                let ack = ActionBatchAck { batch_id: batch.batch_id.clone(), results };
                batches.lock().push(batch);
                Ok(ack)
            })
        }
    };
    let batcher = ActionBatcher::new(BatcherConfig::default(), sink);

    // First flush goes in flight (priority trigger) and blocks on the gate.
    let rx1 = batcher.enqueue(action("a-1"), 100, None);
    tokio::task::yield_now().await;

    // Arrives mid-flight: successor batch, no concurrent flush.
    let rx2 = batcher.enqueue(action("a-2"), 100, None);
    tokio::task::yield_now().await;
    assert_eq!(batches.lock().len(), 0);

    gate.notify_one();
    rx1.await.unwrap().unwrap();
    gate.notify_one();
    rx2.await.unwrap().unwrap();

    let batches = batches.lock();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].actions[0].id, "a-1");
    assert_eq!(batches[1].actions[0].id, "a-2");
}

#[tokio::test(start_paused = true)]
async fn missing_result_row_is_a_protocol_error() {
    let sink = |batch: ActionBatch| -> BoxFuture<'static, Result<ActionBatchAck, String>> {
        Box::pin(async move {
            // Answer only the first action.
            let results = batch
                .actions
                .iter()
                .take(1)
                .map(|a| BatchActionResult { action_id: a.id.clone(), success: true, error: None })
                .collect();
            Ok(ActionBatchAck { batch_id: batch.batch_id, results })
        })
    };
    let batcher = ActionBatcher::new(BatcherConfig::default(), sink);

    let rx1 = batcher.enqueue(action("a-1"), 0, None);
    let rx2 = batcher.enqueue(action("a-2"), 0, None);

    rx1.await.unwrap().unwrap();
    let err = rx2.await.unwrap().unwrap_err();
    assert!(err.starts_with("PROTOCOL_ERROR"), "{err}");
}

#[tokio::test(start_paused = true)]
async fn row_errors_reject_individually() {
    let sink = |batch: ActionBatch| -> BoxFuture<'static, Result<ActionBatchAck, String>> {
        Box::pin(async move {
            let results = batch
                .actions
                .iter()
                .map(|a| BatchActionResult {
                    action_id: a.id.clone(),
                    success: a.id != "a-bad",
                    error: (a.id == "a-bad").then(|| "HANDLER_ERROR: boom".to_owned()),
                })
                .collect();
            Ok(ActionBatchAck { batch_id: batch.batch_id, results })
        })
    };
    let batcher = ActionBatcher::new(BatcherConfig::default(), sink);
    let rx_ok = batcher.enqueue(action("a-ok"), 0, None);
    let rx_bad = batcher.enqueue(action("a-bad"), 0, None);

    rx_ok.await.unwrap().unwrap();
    assert_eq!(rx_bad.await.unwrap().unwrap_err(), "HANDLER_ERROR: boom");
}

#[tokio::test(start_paused = true)]
async fn remove_action_rejects_queued_only() {
    let batches = StdArc::new(Mutex::new(Vec::new()));
    let batcher = ActionBatcher::new(BatcherConfig::default(), recording_sink(StdArc::clone(&batches)));

    let rx = batcher.enqueue(action("a-1"), 0, None);
    assert!(batcher.remove_action("a-1"));
    let err = rx.await.unwrap().unwrap_err();
    assert!(err.contains("removed"), "{err}");

    // Nothing left to flush.
    assert!(!batcher.remove_action("a-1"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(batches.lock().len(), 0);
}

#[tokio::test(start_paused = true)]
async fn destroy_rejects_queued_and_in_flight() {
    let gate = StdArc::new(Notify::new());
    let sink = {
        let gate = StdArc::clone(&gate);
        move |batch: ActionBatch| -> BoxFuture<'static, Result<ActionBatchAck, String>> {
            let gate = StdArc::clone(&gate);
            Box::pin(async move {
                gate.notified().await;
                Ok(ActionBatchAck { batch_id: batch.batch_id, results: vec![] })
            })
        }
    };
    let batcher = ActionBatcher::new(BatcherConfig::default(), sink);

    let rx_flying = batcher.enqueue(action("a-1"), 100, None);
    tokio::task::yield_now().await;
    let rx_queued = batcher.enqueue(action("a-2"), 0, None);

    batcher.destroy();
    assert!(rx_flying.await.unwrap().unwrap_err().starts_with("DESTROYED"));
    assert!(rx_queued.await.unwrap().unwrap_err().starts_with("DESTROYED"));

    // Enqueues after destroy fail immediately.
    let rx_late = batcher.enqueue(action("a-3"), 0, None);
    assert!(rx_late.await.unwrap().unwrap_err().starts_with("DESTROYED"));
}
