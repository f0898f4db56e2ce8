mod logging;

use std::{sync::Arc, time::Duration};

use sync_core::{ResubscribePolicy, Role, SessionEvent, SyncError};
use sync_runtime::{ReliabilityConfig, SessionHandle, spawn_runtime};
use sync_store::{AuthSession, InMemoryStore, SubscriptionEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info};

const DEMO_USER: &str = "demo-user";

#[tokio::main]
async fn main() {
    logging::init();

    let mut config = match ReliabilityConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            std::process::exit(1);
        }
    };
    // Keep the scripted outage short.
    config.resubscribe = ResubscribePolicy::new(200, 1_000, 5);

    let store = InMemoryStore::default();
    let auth = AuthSession::default();
    let runtime = spawn_runtime(Arc::new(store.clone()), &auth, config);

    let mut events = runtime.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::TabsChanged(_)) => {}
                Ok(event) => info!(?event, "session event"),
                Err(RecvError::Lagged(skipped)) => info!(skipped, "event log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    auth.sign_in(DEMO_USER);
    let session = match runtime.session_for(DEMO_USER).await {
        Ok(session) => session,
        Err(err) => {
            eprintln!("Session did not start: {err}");
            std::process::exit(1);
        }
    };

    let outcome = run_scenario(&store, &session).await;

    auth.sign_out();
    runtime.shutdown().await;

    if let Err(err) = &outcome {
        error!(code = %err.code, message = %err.message, "scenario failed");
        eprintln!("Scenario failed: {err}");
    }
    std::process::exit(exit_code(&outcome));
}

/// Process status for a finished scenario: non-zero when any step failed.
fn exit_code(outcome: &Result<(), SyncError>) -> i32 {
    match outcome {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

async fn run_scenario(store: &InMemoryStore, session: &SessionHandle) -> Result<(), SyncError> {
    let tab_id = session.open_new_conversation().await?;
    let sent = session
        .send_message(&tab_id, "Summarize the delivery guarantees of this client, please.")
        .await?;
    store.deliver(&sent.conversation_id, Role::Assistant, "Nothing lost, nothing twice.");
    tokio::time::sleep(Duration::from_millis(200)).await;

    info!("stalling push and dropping the subscription");
    store.set_push_paused(true);
    store.deliver(&sent.conversation_id, Role::Assistant, "This reply was never pushed.");
    store.fail_next_subscribes(2);
    store.emit(SubscriptionEvent::TimedOut);
    tokio::time::sleep(Duration::from_secs(2)).await;

    store.set_push_paused(false);
    let report = session.force_refresh().await?;
    info!(fetched = report.fetched, applied = report.applied, "force refresh finished");
    tokio::time::sleep(Duration::from_millis(500)).await;

    print_json("snapshot", &session.snapshot().await?);
    print_json("messages", &session.tab_messages(&tab_id).await?);
    print_json("role", &session.user_role().await?);
    Ok(())
}

fn print_json<T: serde::Serialize>(label: &str, value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{label}: {json}"),
        Err(err) => eprintln!("could not render {label}: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejected_first_insert_fails_the_run() {
        let store = InMemoryStore::default();
        let auth = AuthSession::default();
        let runtime = spawn_runtime(Arc::new(store.clone()), &auth, ReliabilityConfig::default());
        auth.sign_in(DEMO_USER);
        let session = runtime.session_for(DEMO_USER).await.expect("session");

        store.fail_next_inserts(1);
        let outcome = run_scenario(&store, &session).await;
        let err = outcome.as_ref().expect_err("scenario should stop at the insert");
        assert_eq!(err.code, "store_insert_failed");
        assert_eq!(exit_code(&outcome), 1);
        assert_eq!(exit_code(&Ok(())), 0);

        auth.sign_out();
        runtime.shutdown().await;
    }
}
