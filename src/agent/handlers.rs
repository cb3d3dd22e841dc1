//! Handlers for the inbound message types.

use crate::connection::{ConnectionManager, InboundHandler, InboundKind, OutboundKind, Priority};
use crate::error::{AgentError, Result};
use crate::location::LocationProvider;
use crate::metrics::{Collector, publish_snapshot};
use crate::reward::{RewardIssuer, TxId, verify_reward};
use crate::scheduler::{CheckRunner, TaskKind};
use crate::state::StateHandle;
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Reconnect attempts assumed after the aggregator announces its shutdown.
pub const SERVER_SHUTDOWN_BACKOFF: u32 = 5;

/// Everything the handlers need besides the connection itself.
#[derive(Clone)]
pub struct HandlerDeps {
    pub collector: Arc<Collector>,
    pub state: StateHandle,
    pub issuer: Arc<dyn RewardIssuer>,
    pub location: Arc<dyn LocationProvider>,
    pub checks: Arc<CheckRunner>,
    pub auth_retry_delay: Duration,
}

/// Install one handler per [`InboundKind`].
pub fn register_handlers(connection: &ConnectionManager, deps: HandlerDeps) {
    connection.register_handler(
        InboundKind::AuthResponse,
        Arc::new(AuthResponseHandler {
            location: Arc::clone(&deps.location),
            retry_delay: deps.auth_retry_delay,
        }),
    );
    connection.register_handler(InboundKind::Pong, Arc::new(PongHandler));
    connection.register_handler(
        InboundKind::RequestMetrics,
        Arc::new(RequestMetricsHandler {
            collector: Arc::clone(&deps.collector),
            state: deps.state.clone(),
        }),
    );
    connection.register_handler(
        InboundKind::Reward,
        Arc::new(RewardHandler {
            issuer: Arc::clone(&deps.issuer),
        }),
    );
    connection.register_handler(
        InboundKind::Task,
        Arc::new(TaskHandler {
            checks: Arc::clone(&deps.checks),
        }),
    );
    connection.register_handler(InboundKind::ServerShutdown, Arc::new(ServerShutdownHandler));
}

fn decode<T: DeserializeOwned>(kind: InboundKind, data: Value) -> Result<T> {
    serde_json::from_value(data)
        .map_err(|e| AgentError::Protocol(format!("invalid {} payload: {e}", kind.as_str())))
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    success: bool,
    #[serde(default, alias = "message")]
    error: Option<String>,
}

/// Re-registers the node when the aggregator does not know it.
struct AuthResponseHandler {
    location: Arc<dyn LocationProvider>,
    retry_delay: Duration,
}

#[async_trait]
impl InboundHandler for AuthResponseHandler {
    async fn handle(&self, connection: &ConnectionManager, data: Value) -> Result<()> {
        let response: AuthResponse = decode(InboundKind::AuthResponse, data)?;
        if response.success {
            info!("authenticated with aggregator");
            return Ok(());
        }

        let reason = response.error.unwrap_or_default();
        if !reason.to_lowercase().contains("unknown node") {
            warn!(reason = %reason, "authentication rejected");
            return Ok(());
        }

        warn!(retry_in_secs = self.retry_delay.as_secs(), "node unknown to aggregator, registering");
        // Registered off the inbound path so later frames are not held back.
        let connection = connection.clone();
        let location = Arc::clone(&self.location);
        let delay = self.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let location = location.locate().await;
            connection.register_node(location).await;
        });
        Ok(())
    }
}

struct PongHandler;

#[async_trait]
impl InboundHandler for PongHandler {
    async fn handle(&self, connection: &ConnectionManager, _data: Value) -> Result<()> {
        connection.note_pong();
        Ok(())
    }
}

/// Out-of-band collection on request.
struct RequestMetricsHandler {
    collector: Arc<Collector>,
    state: StateHandle,
}

#[async_trait]
impl InboundHandler for RequestMetricsHandler {
    async fn handle(&self, connection: &ConnectionManager, _data: Value) -> Result<()> {
        debug!("aggregator requested metrics");
        let snapshot = self.collector.collect().await?;
        publish_snapshot(&self.state, connection, snapshot).await;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RewardNotice {
    tx_id: TxId,
    #[serde(default)]
    amount: Option<f64>,
}

/// Verifies reported payouts without blocking dispatch.
struct RewardHandler {
    issuer: Arc<dyn RewardIssuer>,
}

#[async_trait]
impl InboundHandler for RewardHandler {
    async fn handle(&self, _connection: &ConnectionManager, data: Value) -> Result<()> {
        let notice: RewardNotice = decode(InboundKind::Reward, data)?;
        info!(tx = %notice.tx_id, amount = ?notice.amount, "reward notification received");
        let issuer = Arc::clone(&self.issuer);
        tokio::spawn(async move {
            if let Err(e) = verify_reward(issuer.as_ref(), &notice.tx_id).await {
                warn!(error = %e, "reward verification failed");
            }
        });
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteTask {
    #[serde(rename = "type")]
    kind: TaskKind,
    target: String,
    #[serde(default)]
    task_id: Option<String>,
}

/// Runs a one-off check assigned by the aggregator.
struct TaskHandler {
    checks: Arc<CheckRunner>,
}

#[async_trait]
impl InboundHandler for TaskHandler {
    async fn handle(&self, connection: &ConnectionManager, data: Value) -> Result<()> {
        let task: RemoteTask = decode(InboundKind::Task, data)?;
        info!(kind = %task.kind, target = %task.target, "running remote task");
        match self.checks.run(task.kind, &task.target).await {
            Ok(outcome) => {
                connection
                    .send(
                        OutboundKind::TaskResult,
                        json!({ "taskId": task.task_id, "result": outcome }),
                        Priority::Normal,
                    )
                    .await;
            }
            Err(e) => {
                connection
                    .send(
                        OutboundKind::TaskError,
                        json!({ "taskId": task.task_id, "error": e.to_string() }),
                        Priority::Normal,
                    )
                    .await;
            }
        }
        Ok(())
    }
}

struct ServerShutdownHandler;

#[async_trait]
impl InboundHandler for ServerShutdownHandler {
    async fn handle(&self, connection: &ConnectionManager, _data: Value) -> Result<()> {
        warn!("aggregator announced shutdown");
        connection.bias_backoff(SERVER_SHUTDOWN_BACKOFF);
        Ok(())
    }
}
