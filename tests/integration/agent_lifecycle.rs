//! End-to-end agent lifecycle: boot, collection, inbound requests, tasks and
//! shutdown against in-memory collaborators.

use crate::helpers::{Fakes, settle, temp_config};
use std::time::Duration;
use vigil::Agent;
use vigil::connection::Phase;
use vigil::scheduler::{TaskInterval, TaskKind, TaskSpec};

fn http_task(name: &str) -> TaskSpec {
    TaskSpec {
        id: None,
        name: name.to_owned(),
        kind: TaskKind::Http,
        target: "http://127.0.0.1:9/health".to_owned(),
        interval: TaskInterval::Millis(300_000),
    }
}

#[tokio::test(start_paused = true)]
async fn boot_authenticates_and_publishes_first_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let fakes = Fakes::new();
    let agent = Agent::new(temp_config(&dir), fakes.collaborators()).unwrap();
    agent.start().await.unwrap();

    let link = fakes.transport.last_link();
    let frames = link.frames();
    assert_eq!(frames[0]["type"], "authenticate");
    assert_eq!(frames[0]["data"]["nodeId"], "node-it");
    assert_eq!(frames[0]["data"]["wallet"], "wallet-it");
    let metrics = frames.iter().find(|f| f["type"] == "metrics").unwrap();
    assert_eq!(metrics["data"]["cpu"]["value"], 7.5);

    let report = agent.get_metrics();
    assert_eq!(report.history.len(), 1);
    assert_eq!(report.uptime.system_seconds, Some(3_600));
    assert!(report.status.healthy);
    assert_eq!(report.status.connection.phase, Phase::Connected);
    agent.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn collection_runs_every_minute_and_history_grows() {
    let dir = tempfile::tempdir().unwrap();
    let fakes = Fakes::new();
    let agent = Agent::new(temp_config(&dir), fakes.collaborators()).unwrap();
    agent.start().await.unwrap();

    tokio::time::sleep(Duration::from_secs(181)).await;
    let report = agent.get_metrics();
    assert_eq!(report.history.len(), 4);
    assert!(report.uptime.client_seconds >= 180);
    let published = fakes
        .transport
        .last_link()
        .frame_types()
        .into_iter()
        .filter(|t| t == "metrics")
        .count();
    assert_eq!(published, 4);
    agent.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn total_collection_outage_degrades_then_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let fakes = Fakes::new();
    let agent = Agent::new(temp_config(&dir), fakes.collaborators()).unwrap();
    agent.start().await.unwrap();

    fakes.provider.set_outage(true);
    tokio::time::sleep(Duration::from_secs(121)).await;
    let report = agent.get_metrics();
    assert_eq!(report.status.error_count, 2);
    assert!(report.status.healthy);

    tokio::time::sleep(Duration::from_secs(60)).await;
    let report = agent.get_metrics();
    assert_eq!(report.status.error_count, 3);
    assert!(!report.status.healthy);
    assert!(report.status.last_error.unwrap().contains("metric domains failed"));
    // Failed cycles leave the last good snapshot in place.
    assert_eq!(report.history.len(), 1);

    fakes.provider.set_outage(false);
    tokio::time::sleep(Duration::from_secs(60)).await;
    let report = agent.get_metrics();
    assert_eq!(report.status.error_count, 0);
    assert!(report.status.healthy);
    assert_eq!(report.history.len(), 2);
    agent.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn request_metrics_is_answered_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let fakes = Fakes::new();
    let agent = Agent::new(temp_config(&dir), fakes.collaborators()).unwrap();
    agent.start().await.unwrap();

    let link = fakes.transport.last_link();
    let before = link.frame_types().iter().filter(|t| *t == "metrics").count();
    link.inject(r#"{"type":"requestMetrics","data":{}}"#);
    settle().await;

    let after = link.frame_types().iter().filter(|t| *t == "metrics").count();
    assert_eq!(after, before + 1);
    assert_eq!(agent.get_metrics().history.len(), 2);
    agent.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reward_notice_is_verified_with_issuer() {
    let dir = tempfile::tempdir().unwrap();
    let fakes = Fakes::new();
    let agent = Agent::new(temp_config(&dir), fakes.collaborators()).unwrap();
    agent.start().await.unwrap();

    fakes
        .transport
        .last_link()
        .inject(r#"{"type":"reward","data":{"txId":"0xfeed","amount":0.5}}"#);
    settle().await;

    assert_eq!(fakes.issuer.verified(), vec!["0xfeed".to_owned()]);
    agent.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unknown_and_malformed_frames_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let fakes = Fakes::new();
    let agent = Agent::new(temp_config(&dir), fakes.collaborators()).unwrap();
    agent.start().await.unwrap();

    let link = fakes.transport.last_link();
    link.inject("not json");
    link.inject(r#"{"type":"teleport","data":{}}"#);
    link.inject(r#"{"type":"reward","data":{"amount":"lots"}}"#);
    settle().await;

    assert_eq!(agent.connection().phase(), Phase::Connected);
    assert!(fakes.issuer.verified().is_empty());
    agent.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn tasks_can_be_added_and_removed_at_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let fakes = Fakes::new();
    let agent = Agent::new(temp_config(&dir), fakes.collaborators()).unwrap();
    agent.start().await.unwrap();
    let baseline = agent.scheduler().active().len();

    let id = agent.add_task(http_task("health")).unwrap();
    assert_eq!(agent.scheduler().active().len(), baseline + 1);
    let tasks = agent.get_metrics().tasks;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, id);
    assert_eq!(tasks[0].kind, TaskKind::Http);

    assert!(agent.remove_task(&id));
    assert_eq!(agent.scheduler().active().len(), baseline);
    assert!(agent.get_metrics().tasks.is_empty());
    // A removed task is skipped, not failed.
    assert!(agent.run_task(&id).await.is_ok());
    agent.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn invalid_task_interval_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let fakes = Fakes::new();
    let agent = Agent::new(temp_config(&dir), fakes.collaborators()).unwrap();

    let mut spec = http_task("broken");
    spec.interval = TaskInterval::Expression("every tuesday-ish".to_owned());
    assert!(agent.add_task(spec).is_err());
    assert!(agent.get_metrics().tasks.is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_persists_notifies_and_stops_timers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let fakes = Fakes::new();
    let agent = Agent::new(temp_config(&dir), fakes.collaborators()).unwrap();
    agent.start().await.unwrap();
    agent.add_task(http_task("health")).unwrap();

    agent.shutdown().await;

    let link = fakes.transport.last_link();
    assert_eq!(link.frame_types().last().unwrap(), "disconnect");
    assert!(agent.scheduler().active().is_empty());
    assert_eq!(agent.connection().phase(), Phase::Disconnected);

    let saved: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(saved["tasks"].as_array().unwrap().len(), 1);

    // Nothing fires after shutdown.
    let frames = link.frames().len();
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(link.frames().len(), frames);
    assert_eq!(fakes.transport.links(), 1);
}
