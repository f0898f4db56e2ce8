mod common;

use std::{sync::Arc, time::Duration};

use common::{Harness, wait_for, wait_for_status, without_polling};
use sync_core::{ConnectionStatus, SessionEvent};
use sync_runtime::spawn_runtime_with_clock;
use sync_store::AuthSession;

#[tokio::test(start_paused = true)]
async fn sessions_follow_auth_and_never_overlap() {
    let harness = Harness::new();
    let auth = AuthSession::default();
    let runtime = spawn_runtime_with_clock(
        Arc::new(harness.store.clone()),
        &auth,
        without_polling(),
        harness.clock.clone(),
    );
    let mut events = runtime.subscribe();
    assert_eq!(
        runtime.session().expect_err("nobody signed in").code,
        "no_session"
    );

    auth.sign_in("alice");
    let alice = runtime.session_for("alice").await.expect("alice session");
    wait_for_status(&mut events, ConnectionStatus::Connected).await;
    assert_eq!(harness.store.active_subscriptions(), 1);

    auth.sign_in("bob");
    let ended = wait_for(&mut events, |event| {
        matches!(
            event,
            SessionEvent::SessionEnded { .. } | SessionEvent::SessionStarted { .. }
        )
    })
    .await;
    assert_eq!(
        ended,
        SessionEvent::SessionEnded {
            user_id: "alice".into()
        }
    );
    let started = wait_for(&mut events, |event| {
        matches!(event, SessionEvent::SessionStarted { .. })
    })
    .await;
    assert_eq!(
        started,
        SessionEvent::SessionStarted {
            user_id: "bob".into()
        }
    );

    let bob = runtime.session_for("bob").await.expect("bob session");
    assert_eq!(bob.user_id(), "bob");
    assert!(alice.is_closed());
    assert!(!bob.is_closed());
    assert_eq!(
        alice.snapshot().await.expect_err("alice is gone").code,
        "session_closed"
    );
    wait_for_status(&mut events, ConnectionStatus::Connected).await;
    assert_eq!(harness.store.active_subscriptions(), 1);
    assert_eq!(harness.store.calls().unsubscribes, 1);

    auth.sign_out();
    wait_for(&mut events, |event| {
        matches!(event, SessionEvent::SessionEnded { user_id } if user_id == "bob")
    })
    .await;
    assert_eq!(harness.store.active_subscriptions(), 0);
    assert!(runtime.session().is_err());

    runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn sign_out_resets_session_state_and_stops_timers() {
    let harness = Harness::new();
    let chat = harness.store.seed_conversation("alice", "chat");
    let auth = AuthSession::default();
    let runtime = spawn_runtime_with_clock(
        Arc::new(harness.store.clone()),
        &auth,
        sync_runtime::ReliabilityConfig::default(),
        harness.clock.clone(),
    );
    let mut events = runtime.subscribe();

    auth.sign_in("alice");
    let session = runtime.session_for("alice").await.expect("session");
    session.open_conversation(&chat.id).await.expect("open");

    auth.sign_out();
    wait_for(&mut events, |event| {
        matches!(event, SessionEvent::SessionEnded { .. })
    })
    .await;
    let queries = harness.store.calls().queries;

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(harness.store.calls().queries, queries);
    assert_eq!(harness.store.active_subscriptions(), 0);

    auth.sign_in("alice");
    let fresh = runtime.session_for("alice").await.expect("new session");
    let snapshot = fresh.snapshot().await.expect("snapshot");
    assert!(snapshot.tabs.is_empty());
    assert_eq!(snapshot.active_tab_id, None);

    runtime.shutdown().await;
}
