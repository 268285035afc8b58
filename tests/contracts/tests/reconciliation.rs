//! Contract tests for the message paths: optimistic send, push merge,
//! backstop poll, and pagination.

use quillchat_contracts::{fast_config, wait_for, Harness};
use quillchat_model::{ConversationEvent, DeliveryState, MessageKind};
use quillchat_sync::{EventBus, PageRequest, SyncError, Topic};
use std::time::Duration;

#[tokio::test]
async fn send_push_and_poll_converge_on_one_ordered_window() {
    let harness = Harness::new(fast_config());
    let conversation = harness.conversation_id;
    let m1 = harness.store.seed(conversation, harness.peer, "m1", 10);
    let m2 = harness.store.seed(conversation, harness.me, "m2", 20);
    let m3 = harness.store.seed(conversation, harness.peer, "m3", 30);

    let handle = harness.engine.open(conversation).await.unwrap();
    let mut snapshots = handle.snapshots();

    let snapshot = wait_for(&mut snapshots, |s| s.messages.len() == 3).await;
    assert_eq!(
        snapshot.messages.iter().map(|m| m.id).collect::<Vec<_>>(),
        vec![m1.id, m2.id, m3.id]
    );

    // Optimistic send: visible immediately, committed in place.
    let pid = handle.send("hi", MessageKind::Text).await.unwrap();
    let snapshot = wait_for(&mut snapshots, |s| {
        s.messages.len() == 4 && s.messages[3].state == DeliveryState::Sent
    })
    .await;
    let committed = harness.store.committed_row(pid).unwrap();
    assert_eq!(snapshot.messages[3].id, committed.id);

    // The sender's own push echo is a duplicate: merged by provisional
    // correlation, never double-inserted.
    harness
        .bus
        .publish(
            &Topic::conversation(conversation),
            ConversationEvent::MessageNew {
                message: committed.clone(),
            },
        )
        .await
        .unwrap();

    // Let at least one backstop poll overlap the same rows.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.messages.len(), 4);
    let mut ids: Vec<_> = snapshot.messages.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![m1.id, m2.id, m3.id, committed.id]);
    ids.dedup();
    assert_eq!(ids.len(), 4);

    handle.close().await;
}

#[tokio::test]
async fn out_of_order_and_duplicated_push_events_merge_idempotently() {
    let harness = Harness::new(fast_config());
    let conversation = harness.conversation_id;
    let handle = harness.engine.open(conversation).await.unwrap();
    let mut snapshots = handle.snapshots();
    wait_for(&mut snapshots, |s| s.messages.is_empty()).await;

    let a = harness.store.seed(conversation, harness.peer, "a", 100);
    let b = harness.store.seed(conversation, harness.peer, "b", 200);
    let topic = Topic::conversation(conversation);
    for message in [b.clone(), a.clone(), b.clone(), a.clone()] {
        harness
            .bus
            .publish(&topic, ConversationEvent::MessageNew { message })
            .await
            .unwrap();
    }

    let snapshot = wait_for(&mut snapshots, |s| s.messages.len() == 2).await;
    assert_eq!(
        snapshot.messages.iter().map(|m| m.id).collect::<Vec<_>>(),
        vec![a.id, b.id]
    );

    handle.close().await;
}

#[tokio::test]
async fn poll_recovers_messages_the_push_channel_dropped() {
    let harness = Harness::new(fast_config());
    let conversation = harness.conversation_id;
    let handle = harness.engine.open(conversation).await.unwrap();
    let mut snapshots = handle.snapshots();
    wait_for(&mut snapshots, |s| s.messages.is_empty()).await;

    // Written to the store but never pushed.
    let dropped = harness.store.seed(conversation, harness.peer, "quiet", 500);

    let snapshot = wait_for(&mut snapshots, |s| s.messages.len() == 1).await;
    assert_eq!(snapshot.messages[0].id, dropped.id);

    handle.close().await;
}

#[tokio::test]
async fn poll_catches_up_on_a_burst_larger_than_one_page() {
    let mut config = fast_config();
    config.page_size = 2;
    let harness = Harness::new(config);
    let conversation = harness.conversation_id;
    let m1 = harness.store.seed(conversation, harness.peer, "m1", 10);

    let handle = harness.engine.open(conversation).await.unwrap();
    let mut snapshots = handle.snapshots();
    wait_for(&mut snapshots, |s| s.messages.len() == 1).await;

    // Push is down for the whole burst: more messages than one page land
    // before the next tick. The poll must walk back to the known tail, not
    // stop at the newest page.
    let burst: Vec<_> = (2..=4)
        .map(|i| {
            harness
                .store
                .seed(conversation, harness.peer, &format!("m{i}"), i * 10)
        })
        .collect();

    let snapshot = wait_for(&mut snapshots, |s| s.messages.len() == 4).await;
    let expected: Vec<_> = std::iter::once(m1.id)
        .chain(burst.iter().map(|m| m.id))
        .collect();
    assert_eq!(
        snapshot.messages.iter().map(|m| m.id).collect::<Vec<_>>(),
        expected
    );

    handle.close().await;
}

#[tokio::test]
async fn failed_send_stays_visible_and_other_sends_are_unaffected() {
    let harness = Harness::new(fast_config());
    let conversation = harness.conversation_id;
    harness.store.fail_appends_with_body("boom");

    let handle = harness.engine.open(conversation).await.unwrap();
    let mut snapshots = handle.snapshots();
    wait_for(&mut snapshots, |s| s.messages.is_empty()).await;

    let failing = handle.send("boom", MessageKind::Text).await.unwrap();
    let ok = handle.send("fine", MessageKind::Text).await.unwrap();

    // The failing send rolls back to Failed in place; the concurrent send
    // commits untouched.
    let snapshot = wait_for(&mut snapshots, |s| {
        s.messages.len() == 2
            && s.messages.iter().any(|m| m.state == DeliveryState::Failed)
            && s.messages.iter().any(|m| m.state == DeliveryState::Sent)
    })
    .await;
    assert!(snapshot.notice.is_some());
    let failed = snapshot
        .messages
        .iter()
        .find(|m| m.state == DeliveryState::Failed)
        .unwrap();
    assert_eq!(failed.provisional_id, Some(failing));
    let sent = snapshot
        .messages
        .iter()
        .find(|m| m.state == DeliveryState::Sent)
        .unwrap();
    assert_eq!(sent.provisional_id, Some(ok));

    // Retry under the same provisional id succeeds once the store recovers.
    harness.store.clear_failures();
    assert!(handle.retry_send(failing).await.unwrap());
    wait_for(&mut snapshots, |s| {
        s.messages.iter().all(|m| m.state == DeliveryState::Sent)
    })
    .await;
    assert_eq!(harness.store.row_count(conversation), 2);

    handle.close().await;
}

#[tokio::test]
async fn dismissing_a_failed_send_removes_it() {
    let harness = Harness::new(fast_config());
    harness.store.fail_appends_with_body("boom");
    let handle = harness.engine.open(harness.conversation_id).await.unwrap();
    let mut snapshots = handle.snapshots();

    let pid = handle.send("boom", MessageKind::Text).await.unwrap();
    wait_for(&mut snapshots, |s| {
        s.messages
            .iter()
            .any(|m| m.state == DeliveryState::Failed)
    })
    .await;

    assert!(handle.dismiss_failed(pid).await.unwrap());
    wait_for(&mut snapshots, |s| s.messages.is_empty()).await;

    handle.close().await;
}

#[tokio::test]
async fn pagination_walks_history_without_duplicates_until_exhausted() {
    let mut config = fast_config();
    config.page_size = 2;
    // Keep the backstop out of the way: the poll path fetches the newest
    // page only and must not disturb paging.
    config.poll_interval = Duration::from_millis(10_000);
    let harness = Harness::new(config);
    let conversation = harness.conversation_id;
    let all: Vec<_> = (1..=5)
        .map(|i| {
            harness
                .store
                .seed(conversation, harness.peer, &format!("m{i}"), i * 10)
        })
        .collect();

    let handle = harness.engine.open(conversation).await.unwrap();
    let mut snapshots = handle.snapshots();
    let snapshot = wait_for(&mut snapshots, |s| s.messages.len() == 2).await;
    assert!(!snapshot.exhausted);

    assert_eq!(handle.load_older().await.unwrap(), PageRequest::Started);
    wait_for(&mut snapshots, |s| s.messages.len() == 4).await;

    assert_eq!(handle.load_older().await.unwrap(), PageRequest::Started);
    let snapshot = wait_for(&mut snapshots, |s| s.messages.len() == 5 && s.exhausted).await;
    assert_eq!(
        snapshot.messages.iter().map(|m| m.id).collect::<Vec<_>>(),
        all.iter().map(|m| m.id).collect::<Vec<_>>()
    );

    assert_eq!(handle.load_older().await.unwrap(), PageRequest::Exhausted);

    handle.close().await;
}

#[tokio::test]
async fn concurrent_older_loads_report_busy() {
    let mut config = fast_config();
    config.page_size = 1;
    let harness = Harness::new(config);
    let conversation = harness.conversation_id;
    for i in 1..=3 {
        harness
            .store
            .seed(conversation, harness.peer, &format!("m{i}"), i * 10);
    }

    let handle = harness.engine.open(conversation).await.unwrap();
    let mut snapshots = handle.snapshots();
    wait_for(&mut snapshots, |s| s.messages.len() == 1).await;

    harness.store.set_range_delay(Duration::from_millis(200));
    assert_eq!(handle.load_older().await.unwrap(), PageRequest::Started);
    assert_eq!(handle.load_older().await.unwrap(), PageRequest::Busy);

    handle.close().await;
}

#[tokio::test]
async fn unauthenticated_sends_fail_before_any_optimistic_apply() {
    let harness = Harness::new(fast_config());
    harness.identity.sign_out();
    let handle = harness.engine.open(harness.conversation_id).await.unwrap();

    let err = handle.send("hello", MessageKind::Text).await.unwrap_err();
    assert!(matches!(err, SyncError::Unauthenticated));
    assert!(handle.snapshot().messages.is_empty());

    let err = handle.mark_read().await.unwrap_err();
    assert!(matches!(err, SyncError::Unauthenticated));

    handle.close().await;
}

#[tokio::test]
async fn commands_after_close_report_closed() {
    let harness = Harness::new(fast_config());
    let handle = harness.engine.open(harness.conversation_id).await.unwrap();
    handle.close().await;

    let err = handle.send("late", MessageKind::Text).await.unwrap_err();
    assert!(matches!(err, SyncError::Closed));
    assert!(matches!(
        handle.load_older().await.unwrap_err(),
        SyncError::Closed
    ));
}
