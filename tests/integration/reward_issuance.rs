//! Reward gating against a connected aggregator link.

use crate::helpers::{FakeIssuer, FakeTransport};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use vigil::config::{RewardConfig, ServerConfig};
use vigil::connection::ConnectionManager;
use vigil::metrics::{DomainSample, MetricSnapshot};
use vigil::reward::{Evaluation, RewardEvaluator};
use vigil::state::{AgentState, StateHandle};

fn boot_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
}

fn snapshot_with_uptime(at: DateTime<Utc>, client_uptime_secs: u64) -> MetricSnapshot {
    MetricSnapshot {
        timestamp: at,
        cpu: DomainSample::Disabled,
        memory: DomainSample::Disabled,
        disks: DomainSample::Disabled,
        network: DomainSample::Disabled,
        host_uptime: DomainSample::Disabled,
        client_uptime_secs,
    }
}

struct Rig {
    evaluator: RewardEvaluator,
    state: StateHandle,
    issuer: Arc<FakeIssuer>,
    transport: FakeTransport,
}

async fn rig() -> Rig {
    let transport = FakeTransport::default();
    let connection = ConnectionManager::new(&ServerConfig::default(), Arc::new(transport.clone()));
    connection.connect().await.unwrap();
    let state = StateHandle::new(AgentState::new(boot_time()));
    let issuer = Arc::new(FakeIssuer::default());
    let config = RewardConfig {
        base_amount: 10.0,
        ..RewardConfig::default()
    };
    let evaluator = RewardEvaluator::new(&config, state.clone(), connection, issuer.clone());
    Rig {
        evaluator,
        state,
        issuer,
        transport,
    }
}

#[tokio::test]
async fn ninety_percent_uptime_earns_a_reward() {
    let rig = rig().await;
    let now = boot_time() + Duration::seconds(100);
    rig.state.record_snapshot(snapshot_with_uptime(now, 90));

    match rig.evaluator.evaluate(now).await {
        Evaluation::Issued {
            amount,
            uptime_percent,
            ..
        } => {
            assert!((uptime_percent - 90.0).abs() < 1e-9);
            assert!((amount - 9.0).abs() < 1e-9);
        }
        other => panic!("expected issuance, got {other:?}"),
    }
    assert_eq!(rig.issuer.sent().len(), 1);
    assert_eq!(rig.state.last_reward_time(), Some(now));

    let frames = rig.transport.last_link().frames();
    let notice = frames.iter().find(|f| f["type"] == "rewardIssued").unwrap();
    assert_eq!(notice["data"]["txId"], "0xit1");
}

#[tokio::test]
async fn just_under_threshold_earns_nothing() {
    let rig = rig().await;
    let now = boot_time() + Duration::seconds(10_000);
    rig.state.record_snapshot(snapshot_with_uptime(now, 8_999));

    match rig.evaluator.evaluate(now).await {
        Evaluation::BelowThreshold { uptime_percent } => {
            assert!((uptime_percent - 89.99).abs() < 1e-9);
        }
        other => panic!("expected below threshold, got {other:?}"),
    }
    assert!(rig.issuer.sent().is_empty());
    assert_eq!(rig.state.last_reward_time(), None);
}

#[tokio::test]
async fn next_window_opens_a_full_interval_after_payout() {
    let rig = rig().await;
    let first = boot_time() + Duration::seconds(3_600);
    rig.state.record_snapshot(snapshot_with_uptime(first, 3_600));
    assert!(matches!(
        rig.evaluator.evaluate(first).await,
        Evaluation::Issued { .. }
    ));

    let early = first + Duration::hours(23);
    assert_eq!(rig.evaluator.evaluate(early).await, Evaluation::NotDue);

    // The new window starts at the payout, not at boot.
    let due = first + Duration::hours(24);
    rig.state
        .record_snapshot(snapshot_with_uptime(due, 3_600 + 86_400));
    assert_eq!(rig.evaluator.window_start(), first);
    match rig.evaluator.evaluate(due).await {
        Evaluation::Issued { uptime_percent, .. } => assert!(uptime_percent >= 90.0),
        other => panic!("expected issuance, got {other:?}"),
    }
    assert_eq!(rig.issuer.sent().len(), 2);
}
