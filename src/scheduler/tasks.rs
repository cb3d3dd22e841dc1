//! User-defined monitoring tasks.
//!
//! A task is created from a [`TaskSpec`], scheduled immediately on its own
//! cadence, and updated in place after every execution. Results are
//! reported to the aggregator as `taskResult` / `taskError` messages.

use super::cadence::Cadence;
use super::checks::{CheckOutcome, CheckRunner};
use super::runner::{ScheduleHandle, Scheduler};
use crate::connection::{ConnectionManager, OutboundKind, Priority};
use crate::error::{AgentError, Result};
use crate::state::StateHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// The kind of check a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Http,
    Ping,
    Tcp,
    Dns,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Ping => "ping",
            Self::Tcp => "tcp",
            Self::Dns => "dns",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" | "https" => Ok(Self::Http),
            "ping" => Ok(Self::Ping),
            "tcp" => Ok(Self::Tcp),
            "dns" => Ok(Self::Dns),
            other => Err(AgentError::Check(format!("unknown check type '{other}'"))),
        }
    }
}

/// Task interval: milliseconds or a cron expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskInterval {
    Millis(u64),
    Expression(String),
}

impl TaskInterval {
    /// # Errors
    ///
    /// Returns an error if the expression form does not parse.
    pub fn to_cadence(&self) -> Result<Cadence> {
        match self {
            Self::Millis(ms) => Ok(Cadence::from_millis(*ms)),
            Self::Expression(expr) => Cadence::parse(expr),
        }
    }
}

/// Input for [`TaskManager::add_task`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub target: String,
    pub interval: TaskInterval,
}

/// A registered monitoring task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorTask {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub target: String,
    pub interval: TaskInterval,
    #[serde(default)]
    pub last_run_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_result: Option<CheckOutcome>,
}

/// Read-only projection used by reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub target: String,
    pub cadence: String,
    pub last_run_time: Option<DateTime<Utc>>,
    pub last_success: Option<bool>,
}

impl From<&MonitorTask> for TaskSummary {
    fn from(task: &MonitorTask) -> Self {
        let cadence = task
            .interval
            .to_cadence()
            .map(|c| c.to_string())
            .unwrap_or_else(|e| format!("invalid: {e}"));
        Self {
            id: task.id.clone(),
            name: task.name.clone(),
            kind: task.kind,
            target: task.target.clone(),
            cadence,
            last_run_time: task.last_run_time,
            last_success: task.last_result.as_ref().map(|r| r.success),
        }
    }
}

/// Everything a scheduled task execution needs.
#[derive(Clone)]
struct TaskRuntime {
    state: StateHandle,
    connection: ConnectionManager,
    checks: Arc<CheckRunner>,
}

impl TaskRuntime {
    async fn execute(&self, id: &str) -> Result<()> {
        let Some(task) = self.state.task(id) else {
            debug!(task_id = id, "task removed before execution");
            return Ok(());
        };

        let ran_at = Utc::now();
        match self.checks.run(task.kind, &task.target).await {
            Ok(outcome) => {
                self.state.record_task_run(id, ran_at, Some(outcome.clone()));
                self.connection
                    .send(
                        OutboundKind::TaskResult,
                        json!({ "taskId": id, "result": outcome }),
                        Priority::Normal,
                    )
                    .await;
                Ok(())
            }
            Err(e) => {
                self.state
                    .record_task_run(id, ran_at, Some(CheckOutcome::failed(e.to_string())));
                self.connection
                    .send(
                        OutboundKind::TaskError,
                        json!({ "taskId": id, "error": e.to_string() }),
                        Priority::Normal,
                    )
                    .await;
                Err(e)
            }
        }
    }
}

/// Owns the schedules of all monitoring tasks.
pub struct TaskManager {
    scheduler: Scheduler,
    runtime: TaskRuntime,
    handles: Mutex<HashMap<String, ScheduleHandle>>,
}

impl TaskManager {
    pub fn new(
        scheduler: Scheduler,
        state: StateHandle,
        connection: ConnectionManager,
        checks: Arc<CheckRunner>,
    ) -> Self {
        Self {
            scheduler,
            runtime: TaskRuntime {
                state,
                connection,
                checks,
            },
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<String, ScheduleHandle>> {
        match self.handles.lock() {
            Ok(s) => s,
            Err(p) => p.into_inner(),
        }
    }

    /// Register and schedule a task. Returns its id.
    ///
    /// A spec without an id gets a generated one; a spec whose id is already
    /// registered replaces that task.
    ///
    /// # Errors
    ///
    /// Returns an error if the interval does not describe a valid cadence.
    pub fn add_task(&self, spec: TaskSpec) -> Result<String> {
        let cadence = spec.interval.to_cadence()?;
        let id = spec
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if let Some(previous) = self.handles().remove(&id) {
            self.scheduler.cancel(previous);
        }

        let task = MonitorTask {
            id: id.clone(),
            name: spec.name,
            kind: spec.kind,
            target: spec.target,
            interval: spec.interval,
            last_run_time: None,
            last_result: None,
        };
        info!(task_id = %id, name = %task.name, kind = %task.kind, cadence = %cadence, "task added");
        self.runtime.state.upsert_task(task);
        self.schedule(&id, cadence);
        Ok(id)
    }

    /// Cancel a task's schedule and forget it. Returns `false` if unknown.
    pub fn remove_task(&self, id: &str) -> bool {
        if let Some(handle) = self.handles().remove(id) {
            self.scheduler.cancel(handle);
        }
        let removed = self.runtime.state.remove_task(id).is_some();
        if removed {
            info!(task_id = id, "task removed");
        }
        removed
    }

    /// Schedule every task already present in state (e.g. restored from disk).
    /// Returns how many were scheduled.
    pub fn restore(&self) -> usize {
        let mut scheduled = 0;
        for task in self.runtime.state.tasks() {
            if self.handles().contains_key(&task.id) {
                continue;
            }
            match task.interval.to_cadence() {
                Ok(cadence) => {
                    self.schedule(&task.id, cadence);
                    scheduled += 1;
                }
                Err(e) => warn!(task_id = %task.id, error = %e, "skipping task with invalid interval"),
            }
        }
        scheduled
    }

    /// Execute one task immediately, outside its schedule.
    ///
    /// # Errors
    ///
    /// Returns the check error, after it has been recorded and reported.
    pub async fn run_task(&self, id: &str) -> Result<()> {
        self.runtime.execute(id).await
    }

    pub fn summaries(&self) -> Vec<TaskSummary> {
        self.runtime
            .state
            .tasks()
            .iter()
            .map(TaskSummary::from)
            .collect()
    }

    pub fn is_scheduled(&self, id: &str) -> bool {
        self.handles().contains_key(id)
    }

    fn schedule(&self, id: &str, cadence: Cadence) {
        let runtime = self.runtime.clone();
        let task_id = id.to_owned();
        let handle = self
            .scheduler
            .schedule(format!("task:{id}"), cadence, move || {
                let runtime = runtime.clone();
                let task_id = task_id.clone();
                async move { runtime.execute(&task_id).await }
            });
        self.handles().insert(id.to_owned(), handle);
    }
}
