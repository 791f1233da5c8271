//! Subscriber ordering guarantees: identical sequences for concurrent
//! subscribers, gap-free resume by cursor.

mod support;

use conversator::actors::{subscribe, StoredEvent};
use conversator::builders::RemoteEvent;
use shared_types::{RemoteSessionStatus, TaskStatus};
use tokio::sync::mpsc;

use support::*;

async fn drain(
    rx: &mut mpsc::Receiver<StoredEvent>,
    count: usize,
) -> Vec<(i64, String)> {
    let mut out = Vec::new();
    for _ in 0..count {
        let stored = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("subscriber timed out")
            .expect("subscriber channel closed");
        out.push((stored.event.seq, stored.event.event_type.as_str().to_string()));
    }
    out
}

#[tokio::test]
async fn two_subscribers_observe_identical_sequences() {
    let core = boot_core().await;

    let mut sub_a = subscribe(&core.store, 0).await.unwrap().unwrap();
    let mut sub_b = subscribe(&core.store, 0).await.unwrap().unwrap();

    let task = ready_task(&core, "x").await;
    let session = dispatch(&core, &task.task_id).await.session_id;
    wait_for_stream(&core.builder, &session).await;
    core.builder
        .emit(&session, RemoteEvent::Status { status: RemoteSessionStatus::Running })
        .await;
    wait_for_status(&core, &task.task_id, TaskStatus::Running).await;

    let seen_a = drain(&mut sub_a, 5).await;
    let seen_b = drain(&mut sub_b, 5).await;
    assert_eq!(seen_a, seen_b);
    assert_eq!(
        seen_a.iter().map(|(seq, _)| *seq).collect::<Vec<_>>(),
        vec![1, 2, 3, 4, 5]
    );

    core.shutdown().await;
}

#[tokio::test]
async fn disconnected_subscriber_resumes_without_gaps_or_duplicates() {
    let core = boot_core().await;

    let mut sub_a = subscribe(&core.store, 0).await.unwrap().unwrap();
    let mut sub_b = subscribe(&core.store, 0).await.unwrap().unwrap();

    let task = ready_task(&core, "x").await;
    let session = dispatch(&core, &task.task_id).await.session_id;

    // B watches through the dispatch, then drops.
    let b_prefix = drain(&mut sub_b, 4).await;
    let b_cursor = b_prefix.last().unwrap().0;
    drop(sub_b);

    wait_for_stream(&core.builder, &session).await;
    core.builder
        .emit(&session, RemoteEvent::Status { status: RemoteSessionStatus::Running })
        .await;
    wait_for_status(&core, &task.task_id, TaskStatus::Running).await;
    core.builder.emit(&session, RemoteEvent::Completed { artifacts: vec![] }).await;
    wait_for_status(&core, &task.task_id, TaskStatus::Done).await;

    // B reconnects with its last-seen cursor and receives exactly the rest.
    let mut sub_b2 = subscribe(&core.store, b_cursor).await.unwrap().unwrap();
    let b_suffix = drain(&mut sub_b2, 2).await;

    let full_a = drain(&mut sub_a, 6).await;
    let mut b_union = b_prefix;
    b_union.extend(b_suffix);
    assert_eq!(b_union, full_a, "resumed union must equal the uninterrupted sequence");

    // Gap-free, strictly increasing.
    for window in b_union.windows(2) {
        assert_eq!(window[1].0, window[0].0 + 1);
    }

    core.shutdown().await;
}

#[tokio::test]
async fn no_event_is_observed_before_its_predecessors() {
    let core = boot_core().await;

    // Subscribe mid-stream: history must arrive before any live event.
    create_task(&core, "one").await;
    create_task(&core, "two").await;
    let mut sub = subscribe(&core.store, 0).await.unwrap().unwrap();
    create_task(&core, "three").await;
    create_task(&core, "four").await;

    let seen = drain(&mut sub, 4).await;
    let seqs: Vec<i64> = seen.iter().map(|(seq, _)| *seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4]);

    core.shutdown().await;
}
