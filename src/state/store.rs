//! JSON persistence for the agent state record.
//!
//! One record per agent instance:
//! `{version, startTime, lastRewardTime, history[], tasks[]}`.

use crate::error::{AgentError, Result};
use crate::metrics::history::HISTORY_CAPACITY;
use crate::metrics::snapshot::HistoryPoint;
use crate::scheduler::tasks::MonitorTask;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Current on-disk schema version.
pub const STATE_VERSION: u8 = 1;

fn default_state_version() -> u8 {
    STATE_VERSION
}

/// The persisted projection of [`super::AgentState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(default = "default_state_version")]
    pub version: u8,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub last_reward_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history: Vec<HistoryPoint>,
    #[serde(default)]
    pub tasks: Vec<MonitorTask>,
}

/// Loads and saves [`PersistedState`] at a fixed path.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted record. A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(&self) -> Result<Option<PersistedState>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(AgentError::State(format!(
                    "cannot read {}: {e}",
                    self.path.display()
                )));
            }
        };

        let mut state: PersistedState = serde_json::from_slice(&bytes)
            .map_err(|e| AgentError::State(format!("cannot parse state: {e}")))?;

        if state.history.len() > HISTORY_CAPACITY {
            let drop_count = state.history.len().saturating_sub(HISTORY_CAPACITY);
            state.history.drain(0..drop_count);
        }

        debug!("loaded agent state from {}", self.path.display());
        Ok(Some(state))
    }

    /// Persist the record, replacing the file atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file
    /// cannot be written.
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                AgentError::State(format!(
                    "cannot create state directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let json = serde_json::to_string_pretty(state)
            .map_err(|e| AgentError::State(format!("cannot serialize state: {e}")))?;

        // Each save gets its own temp file so concurrent writers never share one.
        let tmp = self
            .path
            .with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        std::fs::write(&tmp, json).map_err(|e| {
            AgentError::State(format!("cannot write state to {}: {e}", tmp.display()))
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            AgentError::State(format!(
                "cannot move state into {}: {e}",
                self.path.display()
            ))
        })?;

        Ok(())
    }
}
