mod common;

use std::time::Duration;

use common::{Harness, START_MS, USER, wait_for, wait_for_status, without_polling};
use sync_core::{
    ConnectionStatus, EventStream, MessageId, Role, SessionEvent, SyncErrorCategory, UserRole,
};
use sync_runtime::{ReliabilityConfig, SessionHandle};
use sync_store::DataStore;

async fn wait_until_loaded(events: &mut EventStream, tab_id: &str) {
    wait_for(events, |event| {
        matches!(event, SessionEvent::TabsChanged(snapshot)
            if snapshot.tabs.iter().any(|tab| tab.tab_id == tab_id && !tab.loading_messages))
    })
    .await;
}

async fn wait_for_count(events: &mut EventStream, tab_id: &str, count: usize) {
    wait_for(events, |event| {
        matches!(event, SessionEvent::TabsChanged(snapshot)
            if snapshot.tabs.iter().any(|tab| tab.tab_id == tab_id && tab.message_count == count))
    })
    .await;
}

async fn message_ids(handle: &SessionHandle, tab_id: &str) -> Vec<u64> {
    handle
        .tab_messages(tab_id)
        .await
        .expect("tab should exist")
        .iter()
        .map(|message| message.id.0)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn polled_rows_advance_cursor_and_late_push_copy_is_dropped() {
    let harness = Harness::new();
    let store = &harness.store;
    let archive = store.seed_conversation(USER, "archive");
    for index in 0..99 {
        let created_at_ms = START_MS - 60_000 + index;
        store.insert_silently(&archive.id, Role::User, &format!("old {index}"), created_at_ms);
    }
    let chat = store.seed_conversation(USER, "chat");

    let (controller, mut events) = harness.start(ReliabilityConfig {
        poll_interval: Duration::from_secs(3),
        poll_batch_size: 5,
        ..ReliabilityConfig::default()
    });
    let handle = controller.handle();
    let tab_id = handle.open_conversation(&chat.id).await.expect("open chat");
    wait_until_loaded(&mut events, &tab_id).await;

    let first = store.insert_silently(&chat.id, Role::Assistant, "reply 100", START_MS + 500);
    assert_eq!(first.id, MessageId(100));
    wait_for_count(&mut events, &tab_id, 1).await;

    let mut batch = Vec::new();
    for id in 101..=103 {
        let content = format!("reply {id}");
        batch.push(store.insert_silently(&chat.id, Role::Assistant, &content, START_MS + 400 + id));
    }
    wait_for_count(&mut events, &tab_id, 4).await;

    store.replay_push(&batch[1]);
    tokio::time::sleep(Duration::from_secs(7)).await;

    assert_eq!(message_ids(&handle, &tab_id).await, vec![100, 101, 102, 103]);
    let snapshot = handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.tabs[0].unread_count, 0);

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn create_conversation_at_cap_fails_without_insert() {
    let harness = Harness::new();
    for title in ["a", "b", "c"] {
        harness.store.seed_conversation(USER, title);
    }
    let (controller, _events) = harness.start(without_polling());
    let handle = controller.handle();

    let err = handle
        .create_conversation("one more please")
        .await
        .expect_err("cap must be enforced");
    assert_eq!(err.category, SyncErrorCategory::Capacity);
    assert_eq!(err.code, "conversation_capacity");

    let tab_id = handle.open_new_conversation().await.expect("placeholder");
    let err = handle
        .send_message(&tab_id, "hello")
        .await
        .expect_err("first send creates a conversation and hits the cap");
    assert_eq!(err.code, "conversation_capacity");
    assert_eq!(harness.store.calls().inserts, 0);

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn first_send_on_placeholder_creates_titled_conversation() {
    let harness = Harness::new();
    let (controller, mut events) = harness.start(without_polling());
    let handle = controller.handle();
    wait_for_status(&mut events, ConnectionStatus::Connected).await;

    let tab_id = handle.open_new_conversation().await.expect("placeholder");
    let long = "x".repeat(60);
    let sent = handle.send_message(&tab_id, format!("  {long}  ")).await.expect("send");
    assert_eq!(sent.content, long);

    let conversation = harness
        .store
        .get_conversation(USER, &sent.conversation_id)
        .await
        .expect("conversation stored");
    assert_eq!(conversation.title, format!("{}...", "x".repeat(50)));

    let snapshot = handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.tabs.len(), 1);
    assert!(!snapshot.tabs[0].placeholder);
    assert_eq!(snapshot.tabs[0].conversation_id, sent.conversation_id);

    // The push copy of our own insert collapses into the local apply.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(message_ids(&handle, &tab_id).await, vec![sent.id.0]);

    harness
        .store
        .deliver(&sent.conversation_id, Role::Assistant, "hi there");
    let replied = wait_for(&mut events, |event| {
        matches!(event, SessionEvent::AssistantReplied { .. })
    })
    .await;
    assert_eq!(
        replied,
        SessionEvent::AssistantReplied {
            conversation_id: sent.conversation_id.clone()
        }
    );
    let snapshot = handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.tabs[0].unread_count, 0);

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unread_counts_and_eviction_respect_the_active_tab() {
    let harness = Harness::new();
    let conversations: Vec<_> = ["c1", "c2", "c3", "c4"]
        .into_iter()
        .map(|title| harness.store.seed_conversation(USER, title))
        .collect();
    let (controller, mut events) = harness.start(without_polling());
    let handle = controller.handle();
    wait_for_status(&mut events, ConnectionStatus::Connected).await;

    let mut tab_ids = Vec::new();
    for conversation in &conversations[..3] {
        let tab_id = handle
            .open_conversation(&conversation.id)
            .await
            .expect("open");
        wait_until_loaded(&mut events, &tab_id).await;
        tab_ids.push(tab_id);
    }

    harness
        .store
        .deliver(&conversations[0].id, Role::Assistant, "for c1");
    harness
        .store
        .deliver(&conversations[1].id, Role::Assistant, "for c2");
    harness
        .store
        .deliver(&conversations[2].id, Role::Assistant, "for c3");
    wait_for(&mut events, |event| {
        matches!(event, SessionEvent::TabsChanged(snapshot)
            if snapshot.tabs.iter().all(|tab| tab.message_count == 1))
    })
    .await;

    let snapshot = handle.snapshot().await.expect("snapshot");
    let unread: Vec<u32> = snapshot.tabs.iter().map(|tab| tab.unread_count).collect();
    assert_eq!(unread, vec![1, 1, 0]);

    handle.set_active_tab(&tab_ids[0]).await.expect("activate c1");
    let snapshot = handle.snapshot().await.expect("snapshot");
    let unread: Vec<u32> = snapshot.tabs.iter().map(|tab| tab.unread_count).collect();
    assert_eq!(unread, vec![0, 1, 0]);

    // c1 is active, so the oldest inactive tab (c2) goes.
    let fourth = handle
        .open_conversation(&conversations[3].id)
        .await
        .expect("open fourth");
    let snapshot = handle.snapshot().await.expect("snapshot");
    let open: Vec<&str> = snapshot
        .tabs
        .iter()
        .map(|tab| tab.conversation_id.as_str())
        .collect();
    assert_eq!(
        open,
        vec![
            conversations[0].id.as_str(),
            conversations[2].id.as_str(),
            conversations[3].id.as_str()
        ]
    );
    assert_eq!(snapshot.active_tab_id.as_deref(), Some(fourth.as_str()));

    handle.close_tab(&fourth).await.expect("close");
    let snapshot = handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.active_tab_id.as_deref(), Some(tab_ids[0].as_str()));

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reopening_an_open_conversation_focuses_without_reload() {
    let harness = Harness::new();
    let first = harness.store.seed_conversation(USER, "first");
    let second = harness.store.seed_conversation(USER, "second");
    let (controller, mut events) = harness.start(without_polling());
    let handle = controller.handle();

    let first_tab = handle.open_conversation(&first.id).await.expect("open");
    wait_until_loaded(&mut events, &first_tab).await;
    let second_tab = handle.open_conversation(&second.id).await.expect("open");
    wait_until_loaded(&mut events, &second_tab).await;
    let queries = harness.store.calls().queries;

    let again = handle.open_conversation(&first.id).await.expect("reopen");
    assert_eq!(again, first_tab);
    assert_eq!(harness.store.calls().queries, queries);
    let snapshot = handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.tabs.len(), 2);
    assert_eq!(snapshot.active_tab_id.as_deref(), Some(first_tab.as_str()));

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_insert_is_reported_to_the_caller() {
    let harness = Harness::new();
    let chat = harness.store.seed_conversation(USER, "chat");
    let (controller, _events) = harness.start(without_polling());
    let handle = controller.handle();
    let tab_id = handle.open_conversation(&chat.id).await.expect("open");

    harness.store.fail_next_inserts(1);
    let err = handle
        .send_message(&tab_id, "will fail")
        .await
        .expect_err("insert failure must surface");
    assert_eq!(err.code, "store_insert_failed");
    assert_eq!(err.category, SyncErrorCategory::Transport);

    let sent = handle.send_message(&tab_id, "retry").await.expect("retry works");
    assert_eq!(sent.content, "retry");

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn user_role_is_cached_until_ttl() {
    let harness = Harness::new();
    harness.store.set_role(USER, UserRole::Admin);
    let (controller, _events) = harness.start(ReliabilityConfig {
        poll_enabled: false,
        role_cache_ttl: Duration::from_secs(60),
        ..ReliabilityConfig::default()
    });
    let handle = controller.handle();

    assert_eq!(handle.user_role().await, Ok(UserRole::Admin));
    assert_eq!(handle.user_role().await, Ok(UserRole::Admin));
    assert_eq!(harness.store.calls().role_lookups, 1);

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(handle.user_role().await, Ok(UserRole::Admin));
    assert_eq!(harness.store.calls().role_lookups, 2);

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn polling_toggle_stops_and_restarts_the_poller() {
    let harness = Harness::new();
    let (controller, _events) = harness.start(ReliabilityConfig {
        poll_interval: Duration::from_secs(3),
        ..ReliabilityConfig::default()
    });
    let handle = controller.handle();

    tokio::time::sleep(Duration::from_millis(6_500)).await;
    assert_eq!(harness.store.calls().queries, 2);

    handle.set_polling(false).await.expect("disable");
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(harness.store.calls().queries, 2);

    handle.set_polling(true).await.expect("enable");
    tokio::time::sleep(Duration::from_millis(3_500)).await;
    assert_eq!(harness.store.calls().queries, 3);

    controller.shutdown().await;
}
