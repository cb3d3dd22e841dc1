//! Link loss and recovery as seen from a running agent.

use crate::helpers::{Fakes, settle, temp_config};
use serde_json::json;
use std::time::Duration;
use vigil::Agent;
use vigil::connection::{OutboundKind, Phase, Priority, SendOutcome};

#[tokio::test(start_paused = true)]
async fn unreachable_server_at_boot_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let fakes = Fakes::new();
    fakes.transport.refuse(true);
    let agent = Agent::new(temp_config(&dir), fakes.collaborators()).unwrap();
    agent.start().await.unwrap();

    assert_eq!(agent.connection().phase(), Phase::Disconnected);
    assert_eq!(fakes.transport.links(), 0);
    // Collection still happens; delivery is skipped.
    assert_eq!(agent.get_metrics().history.len(), 1);

    fakes.transport.refuse(false);
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(agent.connection().phase(), Phase::Connected);
    assert_eq!(agent.connection().reconnect_attempts(), 0);
    assert_eq!(fakes.transport.last_link().frame_types()[0], "authenticate");
    agent.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn queued_messages_follow_authentication_after_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let fakes = Fakes::new();
    let agent = Agent::new(temp_config(&dir), fakes.collaborators()).unwrap();
    agent.start().await.unwrap();

    fakes.transport.last_link().drop_from_peer();
    settle().await;
    assert_eq!(agent.connection().phase(), Phase::Disconnected);

    let queued = agent
        .connection()
        .send(
            OutboundKind::RewardIssued,
            json!({ "txId": "0x1", "amount": 1.0 }),
            Priority::High,
        )
        .await;
    assert_eq!(queued, SendOutcome::Queued);
    let dropped = agent
        .connection()
        .send(OutboundKind::Status, json!({}), Priority::Normal)
        .await;
    assert_eq!(dropped, SendOutcome::Dropped);
    assert_eq!(agent.connection().pending_len(), 1);

    // Dropped inside the grace window, so the retry is penalised but still
    // well under ten seconds.
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(fakes.transport.links(), 2);
    let types = fakes.transport.last_link().frame_types();
    assert_eq!(types[0], "authenticate");
    assert_eq!(types[1], "rewardIssued");
    assert!(!types.contains(&"status".to_owned()));
    assert_eq!(agent.connection().pending_len(), 0);
    agent.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn server_shutdown_notice_slows_the_next_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let fakes = Fakes::new();
    let agent = Agent::new(temp_config(&dir), fakes.collaborators()).unwrap();
    agent.start().await.unwrap();

    let link = fakes.transport.last_link();
    link.inject(r#"{"type":"serverShutdown","data":{}}"#);
    settle().await;
    assert!(agent.connection().reconnect_attempts() >= 5);

    link.drop_from_peer();
    settle().await;
    assert!(agent.connection().reconnect_attempts() > 5);

    // An unbiased first retry would land within 1.3s.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(fakes.transport.links(), 1);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(fakes.transport.links(), 2);
    assert_eq!(agent.connection().phase(), Phase::Connected);
    agent.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn refused_reconnects_keep_retrying_until_the_server_returns() {
    let dir = tempfile::tempdir().unwrap();
    let fakes = Fakes::new();
    let agent = Agent::new(temp_config(&dir), fakes.collaborators()).unwrap();
    agent.start().await.unwrap();

    fakes.transport.refuse(true);
    fakes.transport.last_link().drop_from_peer();
    tokio::time::sleep(Duration::from_secs(30)).await;
    let attempts = fakes.transport.attempts();
    assert!(attempts >= 3, "expected several retries, saw {attempts}");
    assert_eq!(agent.connection().phase(), Phase::Disconnected);

    fakes.transport.refuse(false);
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(agent.connection().phase(), Phase::Connected);
    assert_eq!(fakes.transport.links(), 2);
    agent.shutdown().await;
}
