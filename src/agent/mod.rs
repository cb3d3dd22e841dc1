//! The owned agent context.
//!
//! [`Agent`] builds every component from configuration and a set of
//! [`Collaborators`], wires inbound handlers, registers the recurring jobs
//! and exposes the read/write surface used by an outer front door.

pub mod handlers;

pub use handlers::{HandlerDeps, SERVER_SHUTDOWN_BACKOFF, register_handlers};

use crate::config::AgentConfig;
use crate::connection::{
    ConnectionManager, ConnectionStatus, NodeIdentity, OutboundKind, Priority, Transport,
    WebSocketTransport,
};
use crate::error::{AgentError, Result};
use crate::location::{LocationProvider, StaticLocationProvider};
use crate::metrics::{
    Collector, HistoryPoint, MetricSnapshot, MetricsPipeline, MetricsProvider,
    ProcMetricsProvider, UNHEALTHY_ERROR_COUNT,
};
use crate::reward::{LoggingRewardIssuer, RewardEvaluator, RewardIssuer};
use crate::scheduler::checks::DEFAULT_CHECK_TIMEOUT;
use crate::scheduler::{Cadence, CheckRunner, Scheduler, TaskManager, TaskSpec, TaskSummary};
use crate::state::{AgentState, StateHandle, StateStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// Bound on the disconnect notice sent during shutdown.
pub const SHUTDOWN_NOTIFY_TIMEOUT: Duration = Duration::from_millis(500);

/// Orderly shutdown taking longer than this is abandoned.
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// External capabilities the agent consumes.
#[derive(Clone)]
pub struct Collaborators {
    pub metrics: Arc<dyn MetricsProvider>,
    pub rewards: Arc<dyn RewardIssuer>,
    pub location: Arc<dyn LocationProvider>,
    pub transport: Arc<dyn Transport>,
}

impl Collaborators {
    /// procfs metrics, dry-run rewards, configured location, WebSocket link.
    pub fn defaults(config: &AgentConfig) -> Self {
        Self {
            metrics: Arc::new(ProcMetricsProvider::new()),
            rewards: Arc::new(LoggingRewardIssuer),
            location: Arc::new(StaticLocationProvider::new(config.node.location.clone())),
            transport: Arc::new(WebSocketTransport),
        }
    }
}

/// Uptime figures in [`AgentReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UptimeReport {
    pub client_seconds: u64,
    pub process_seconds: Option<u64>,
    pub system_seconds: Option<u64>,
    /// Uptime of the current reward window, as the evaluator sees it.
    pub uptime_percent: Option<f64>,
}

/// Health and link state in [`AgentReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub healthy: bool,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub connection: ConnectionStatus,
}

/// Result of [`Agent::get_metrics`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentReport {
    pub current: Option<MetricSnapshot>,
    pub history: Vec<HistoryPoint>,
    pub uptime: UptimeReport,
    pub tasks: Vec<TaskSummary>,
    pub status: AgentStatus,
}

pub struct Agent {
    config: AgentConfig,
    state: StateHandle,
    store: StateStore,
    scheduler: Scheduler,
    connection: ConnectionManager,
    pipeline: Arc<MetricsPipeline>,
    rewards: Arc<RewardEvaluator>,
    tasks: TaskManager,
    handler_deps: HandlerDeps,
    started: AtomicBool,
}

impl Agent {
    /// Build the agent and prove the state store is writable.
    ///
    /// A persisted record is merged into fresh state; an unreadable record is
    /// logged and replaced.
    ///
    /// # Errors
    ///
    /// Returns an error if the server URL is not a WebSocket URL, the HTTP
    /// client cannot be built, or the state file cannot be written.
    pub fn new(config: AgentConfig, collaborators: Collaborators) -> Result<Self> {
        validate_server_url(&config.server.url)?;

        let mut state = AgentState::new(Utc::now());
        let store = StateStore::new(config.storage.resolved_state_path());
        match store.load() {
            Ok(Some(persisted)) => {
                info!(
                    path = %store.path().display(),
                    tasks = persisted.tasks.len(),
                    history = persisted.history.len(),
                    "restored agent state"
                );
                state.merge_persisted(persisted);
            }
            Ok(None) => info!(path = %store.path().display(), "no saved state, starting fresh"),
            Err(e) => warn!(error = %e, "discarding unreadable state"),
        }
        store.save(&state.to_persisted())?;
        let state = StateHandle::new(state);

        let identity = config.node.node_id.clone().map(|node_id| NodeIdentity {
            node_id,
            wallet: config.node.wallet.clone(),
        });
        let connection = ConnectionManager::new(&config.server, collaborators.transport)
            .with_identity(identity);

        let checks = Arc::new(CheckRunner::new(DEFAULT_CHECK_TIMEOUT)?);
        let collector = Arc::new(Collector::new(
            collaborators.metrics,
            &config.monitoring.domains,
            config.monitoring.collection_timeout(),
        ));
        let pipeline = Arc::new(MetricsPipeline::new(
            Arc::clone(&collector),
            state.clone(),
            connection.clone(),
        ));
        let rewards = Arc::new(RewardEvaluator::new(
            &config.reward,
            state.clone(),
            connection.clone(),
            Arc::clone(&collaborators.rewards),
        ));
        let scheduler = Scheduler::new();
        let tasks = TaskManager::new(
            scheduler.clone(),
            state.clone(),
            connection.clone(),
            Arc::clone(&checks),
        );
        let handler_deps = HandlerDeps {
            collector,
            state: state.clone(),
            issuer: collaborators.rewards,
            location: collaborators.location,
            checks,
            auth_retry_delay: config.server.auth_retry_delay(),
        };

        Ok(Self {
            config,
            state,
            store,
            scheduler,
            connection,
            pipeline,
            rewards,
            tasks,
            handler_deps,
            started: AtomicBool::new(false),
        })
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn state(&self) -> &StateHandle {
        &self.state
    }

    /// Connect, collect once, and register every recurring job.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent was already started.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(AgentError::Scheduler("agent already started".to_owned()));
        }

        register_handlers(&self.connection, self.handler_deps.clone());

        // Jobs are in place before the first connect, which may take up to
        // the connect timeout against an unresponsive server.
        self.schedule_metrics();
        self.schedule_checkpoint();
        self.schedule_heartbeat();
        if self.config.reward.enabled {
            self.schedule_rewards();
        }
        self.start_tasks();

        self.connection.start().await;

        if let Err(e) = self.pipeline.run_cycle().await {
            warn!(error = %e, "initial collection failed");
        }

        info!(jobs = self.scheduler.active().len(), "agent started");
        Ok(())
    }

    fn schedule_metrics(&self) {
        let pipeline = Arc::clone(&self.pipeline);
        self.scheduler.schedule(
            "metrics",
            Cadence::from_duration(Duration::from_secs(self.config.monitoring.interval_secs)),
            move || {
                let pipeline = Arc::clone(&pipeline);
                async move { pipeline.run_cycle().await }
            },
        );
    }

    fn schedule_checkpoint(&self) {
        let store = self.store.clone();
        let state = self.state.clone();
        self.scheduler.schedule(
            "checkpoint",
            Cadence::every_minutes(self.config.monitoring.checkpoint_interval_mins),
            move || {
                let store = store.clone();
                let state = state.clone();
                async move { store.save(&state.to_persisted()) }
            },
        );
    }

    fn schedule_heartbeat(&self) {
        let state = self.state.clone();
        let connection = self.connection.clone();
        let collector = Arc::clone(self.pipeline.collector());
        self.scheduler.schedule(
            "heartbeat",
            Cadence::from_duration(Duration::from_secs(
                self.config.monitoring.heartbeat_interval_secs,
            )),
            move || {
                let payload = status_payload(&state, &connection, &collector);
                let connection = connection.clone();
                async move {
                    connection
                        .send(OutboundKind::Status, payload, Priority::Normal)
                        .await;
                    Ok(())
                }
            },
        );
    }

    fn schedule_rewards(&self) {
        let rewards = Arc::clone(&self.rewards);
        self.scheduler.schedule(
            "reward",
            Cadence::from_duration(Duration::from_secs(self.config.reward.check_interval_secs)),
            move || {
                let rewards = Arc::clone(&rewards);
                async move { rewards.run().await }
            },
        );
    }

    /// Schedule restored tasks, then configured ones not already present.
    fn start_tasks(&self) {
        let restored = self.tasks.restore();
        let existing = self.state.tasks();
        let mut added = 0;
        for spec in &self.config.tasks {
            let present = match &spec.id {
                Some(id) => self.state.contains_task(id),
                None => existing.iter().any(|t| {
                    t.name == spec.name && t.kind == spec.kind && t.target == spec.target
                }),
            };
            if present {
                continue;
            }
            match self.tasks.add_task(spec.clone()) {
                Ok(_) => added += 1,
                Err(e) => warn!(name = %spec.name, error = %e, "skipping configured task"),
            }
        }
        info!(restored, added, "monitoring tasks scheduled");
    }

    /// Current metrics, history, uptime, tasks and status.
    pub fn get_metrics(&self) -> AgentReport {
        let query = self.pipeline.query();
        let host_uptime = query
            .current
            .as_ref()
            .and_then(|s| s.host_uptime.value().copied());
        AgentReport {
            uptime: UptimeReport {
                client_seconds: self.pipeline.collector().client_uptime_secs(),
                process_seconds: host_uptime.map(|u| u.process_secs),
                system_seconds: host_uptime.map(|u| u.system_secs),
                uptime_percent: self.rewards.current_uptime_percent(Utc::now()),
            },
            status: AgentStatus {
                healthy: query.health.healthy,
                error_count: query.health.error_count,
                last_error: query.health.last_error,
                connection: self.connection.status(),
            },
            current: query.current,
            history: query.history,
            tasks: query.tasks,
        }
    }

    /// Register and schedule a monitoring task.
    ///
    /// # Errors
    ///
    /// Returns an error if the task interval is invalid.
    pub fn add_task(&self, spec: TaskSpec) -> Result<String> {
        self.tasks.add_task(spec)
    }

    pub fn remove_task(&self, id: &str) -> bool {
        self.tasks.remove_task(id)
    }

    /// Execute one task now, outside its schedule.
    ///
    /// # Errors
    ///
    /// Returns the check error.
    pub async fn run_task(&self, id: &str) -> Result<()> {
        self.tasks.run_task(id).await
    }

    /// Persist the current state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state file cannot be written.
    pub fn checkpoint(&self) -> Result<()> {
        self.store.save(&self.state.to_persisted())
    }

    /// Checkpoint, notify the aggregator and stop every timer.
    pub async fn shutdown(&self) {
        info!("shutting down");
        if let Err(e) = self.checkpoint() {
            warn!(error = %e, "final checkpoint failed");
        }
        self.connection.shutdown(SHUTDOWN_NOTIFY_TIMEOUT).await;
        self.scheduler.shutdown();
        info!("agent stopped");
    }
}

/// Heartbeat payload.
pub fn status_payload(
    state: &StateHandle,
    connection: &ConnectionManager,
    collector: &Collector,
) -> Value {
    let errors = state.error_counter();
    let status = connection.status();
    let tasks: Vec<TaskSummary> = state.tasks().iter().map(TaskSummary::from).collect();
    json!({
        "uptimeSeconds": collector.client_uptime_secs(),
        "healthy": errors.count < UNHEALTHY_ERROR_COUNT,
        "errorCount": errors.count,
        "lastError": errors.last_error,
        "tasks": tasks,
        "connection": {
            "phase": status.phase,
            "reconnectAttempts": status.reconnect_attempts,
            "pending": status.pending,
        },
    })
}

fn validate_server_url(raw: &str) -> Result<()> {
    let url = url::Url::parse(raw)
        .map_err(|e| AgentError::Config(format!("invalid server url {raw:?}: {e}")))?;
    match url.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(AgentError::Config(format!(
            "server url must use ws or wss, got {other}"
        ))),
    }
}
