//! Process-wide agent state and its single-writer handle.
//!
//! [`AgentState`] is owned by one [`StateHandle`]; components mutate it only
//! through the handle's operations, and readers get a copied-out value so a
//! concurrent scheduler tick can never tear a read.

pub mod store;

pub use store::{PersistedState, StateStore};

use crate::metrics::history::{BoundedHistory, HISTORY_CAPACITY};
use crate::metrics::snapshot::{HistoryPoint, MetricSnapshot};
use crate::scheduler::checks::CheckOutcome;
use crate::scheduler::tasks::MonitorTask;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Consecutive collection failures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorCounter {
    pub count: u32,
    pub last_error: Option<String>,
}

/// Everything the agent tracks about itself.
#[derive(Debug, Clone)]
pub struct AgentState {
    pub start_time: DateTime<Utc>,
    pub last_reward_time: Option<DateTime<Utc>>,
    pub current_snapshot: Option<MetricSnapshot>,
    pub history: BoundedHistory,
    pub tasks: HashMap<String, MonitorTask>,
    pub error_counter: ErrorCounter,
}

impl AgentState {
    /// Fresh state for an agent booting at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            start_time: now,
            last_reward_time: None,
            current_snapshot: None,
            history: BoundedHistory::with_capacity(HISTORY_CAPACITY),
            tasks: HashMap::new(),
            error_counter: ErrorCounter::default(),
        }
    }

    /// Merge a persisted record into freshly booted state.
    ///
    /// `start_time` never moves forward across restarts. History and reward
    /// gate come from disk; persisted tasks are added unless one with the
    /// same id is already registered.
    pub fn merge_persisted(&mut self, persisted: PersistedState) {
        self.start_time = self.start_time.min(persisted.start_time);
        self.last_reward_time = persisted.last_reward_time;
        self.history = BoundedHistory::from_points(persisted.history, self.history.capacity());
        for task in persisted.tasks {
            self.tasks.entry(task.id.clone()).or_insert(task);
        }
    }

    /// The persisted projection. Current-cycle metrics are left out.
    pub fn to_persisted(&self) -> PersistedState {
        let mut tasks: Vec<MonitorTask> = self.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        PersistedState {
            version: store::STATE_VERSION,
            start_time: self.start_time,
            last_reward_time: self.last_reward_time,
            history: self.history.to_vec(),
            tasks,
        }
    }
}

/// Cloneable handle serializing all access to one [`AgentState`].
#[derive(Debug, Clone)]
pub struct StateHandle {
    inner: Arc<Mutex<AgentState>>,
}

impl StateHandle {
    pub fn new(state: AgentState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AgentState> {
        match self.inner.lock() {
            Ok(s) => s,
            Err(p) => p.into_inner(),
        }
    }

    /// Consistent copy of the whole state.
    pub fn snapshot(&self) -> AgentState {
        self.lock().clone()
    }

    pub fn to_persisted(&self) -> PersistedState {
        self.lock().to_persisted()
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.lock().start_time
    }

    pub fn last_reward_time(&self) -> Option<DateTime<Utc>> {
        self.lock().last_reward_time
    }

    pub fn set_last_reward_time(&self, at: DateTime<Utc>) {
        self.lock().last_reward_time = Some(at);
    }

    pub fn current_snapshot(&self) -> Option<MetricSnapshot> {
        self.lock().current_snapshot.clone()
    }

    pub fn history(&self) -> Vec<HistoryPoint> {
        self.lock().history.to_vec()
    }

    /// Install a new current snapshot and append its history point.
    ///
    /// Returns the evicted history point, if any.
    pub fn record_snapshot(&self, snapshot: MetricSnapshot) -> Option<HistoryPoint> {
        let mut state = self.lock();
        let evicted = state.history.push(HistoryPoint::from(&snapshot));
        state.current_snapshot = Some(snapshot);
        evicted
    }

    /// Count a failed collection. Returns the new consecutive count.
    pub fn record_error(&self, error: impl Into<String>) -> u32 {
        let mut state = self.lock();
        state.error_counter.count = state.error_counter.count.saturating_add(1);
        state.error_counter.last_error = Some(error.into());
        state.error_counter.count
    }

    pub fn reset_errors(&self) {
        let mut state = self.lock();
        state.error_counter.count = 0;
    }

    pub fn error_counter(&self) -> ErrorCounter {
        self.lock().error_counter.clone()
    }

    pub fn tasks(&self) -> Vec<MonitorTask> {
        let mut tasks: Vec<MonitorTask> = self.lock().tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    pub fn task(&self, id: &str) -> Option<MonitorTask> {
        self.lock().tasks.get(id).cloned()
    }

    pub fn contains_task(&self, id: &str) -> bool {
        self.lock().tasks.contains_key(id)
    }

    pub fn upsert_task(&self, task: MonitorTask) {
        self.lock().tasks.insert(task.id.clone(), task);
    }

    pub fn remove_task(&self, id: &str) -> Option<MonitorTask> {
        self.lock().tasks.remove(id)
    }

    /// Record the outcome of one execution. Returns `false` if the task was
    /// removed while it ran.
    pub fn record_task_run(
        &self,
        id: &str,
        ran_at: DateTime<Utc>,
        result: Option<CheckOutcome>,
    ) -> bool {
        let mut state = self.lock();
        let Some(task) = state.tasks.get_mut(id) else {
            return false;
        };
        task.last_run_time = Some(ran_at);
        task.last_result = result;
        true
    }
}
