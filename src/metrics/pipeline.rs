//! Collection cycle, outbound delivery and the metrics read surface.

use super::collector::Collector;
use super::snapshot::{HistoryPoint, MetricSnapshot};
use crate::connection::{ConnectionManager, OutboundKind, Priority, SendOutcome};
use crate::error::Result;
use crate::scheduler::tasks::TaskSummary;
use crate::state::StateHandle;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Consecutive failures at which the agent reports itself unhealthy.
pub const UNHEALTHY_ERROR_COUNT: u32 = 3;

/// Consecutive failures at which recovery is attempted.
pub const RECOVERY_ERROR_COUNT: u32 = 5;

/// Pipeline health as seen by readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineHealth {
    pub healthy: bool,
    pub error_count: u32,
    pub last_error: Option<String>,
}

/// Result of [`MetricsPipeline::query`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsQuery {
    pub current: Option<MetricSnapshot>,
    pub history: Vec<HistoryPoint>,
    pub tasks: Vec<TaskSummary>,
    pub health: PipelineHealth,
}

/// Drives collection cycles and owns the path from snapshot to aggregator.
pub struct MetricsPipeline {
    collector: Arc<Collector>,
    state: StateHandle,
    connection: ConnectionManager,
}

impl MetricsPipeline {
    pub fn new(collector: Arc<Collector>, state: StateHandle, connection: ConnectionManager) -> Self {
        Self {
            collector,
            state,
            connection,
        }
    }

    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    /// Collect and process one snapshot.
    ///
    /// A failed collection bumps the consecutive error counter. Once it
    /// reaches [`RECOVERY_ERROR_COUNT`] while the link is down, a reconnect
    /// is forced. A successful collection resets the counter.
    ///
    /// # Errors
    ///
    /// Returns the collection error after it has been recorded.
    pub async fn run_cycle(&self) -> Result<()> {
        match self.collector.collect().await {
            Ok(snapshot) => {
                self.state.reset_errors();
                self.process(snapshot).await;
                Ok(())
            }
            Err(e) => {
                let count = self.state.record_error(e.to_string());
                warn!(error = %e, consecutive = count, "metrics collection failed");
                if count >= RECOVERY_ERROR_COUNT && !self.connection.is_connected() {
                    warn!(consecutive = count, "persistent collection failures while disconnected, forcing reconnect");
                    if let Err(reconnect) = self.connection.force_reconnect().await {
                        warn!(error = %reconnect, "recovery reconnect failed");
                    }
                }
                Err(e)
            }
        }
    }

    /// Record `snapshot` and forward it to the aggregator.
    pub async fn process(&self, snapshot: MetricSnapshot) -> SendOutcome {
        publish_snapshot(&self.state, &self.connection, snapshot).await
    }

    pub fn query(&self) -> MetricsQuery {
        query(&self.state)
    }
}

/// Install `snapshot` as current, append its history point and send it.
///
/// Metrics are never queued: while disconnected the send is skipped.
pub async fn publish_snapshot(
    state: &StateHandle,
    connection: &ConnectionManager,
    snapshot: MetricSnapshot,
) -> SendOutcome {
    let payload = serde_json::to_value(&snapshot);
    if let Some(evicted) = state.record_snapshot(snapshot) {
        debug!(evicted = %evicted.timestamp, "history full, evicted oldest point");
    }

    if !connection.is_connected() {
        warn!("not connected, skipping metrics delivery");
        return SendOutcome::Dropped;
    }
    match payload {
        Ok(payload) => {
            connection
                .send(OutboundKind::Metrics, payload, Priority::Normal)
                .await
        }
        Err(e) => {
            warn!(error = %e, "cannot encode snapshot");
            SendOutcome::Dropped
        }
    }
}

/// Consistent read of current metrics, history, tasks and health.
pub fn query(state: &StateHandle) -> MetricsQuery {
    let snapshot = state.snapshot();
    let mut tasks: Vec<_> = snapshot.tasks.values().collect();
    tasks.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
    MetricsQuery {
        current: snapshot.current_snapshot.clone(),
        history: snapshot.history.to_vec(),
        tasks: tasks.into_iter().map(TaskSummary::from).collect(),
        health: PipelineHealth {
            healthy: snapshot.error_counter.count < UNHEALTHY_ERROR_COUNT,
            error_count: snapshot.error_counter.count,
            last_error: snapshot.error_counter.last_error.clone(),
        },
    }
}
