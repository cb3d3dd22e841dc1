//! Periodic execution engine.
//!
//! Every registered action gets its own tokio task that waits for the next
//! tick, runs one invocation to completion and only then waits again, so a
//! slow invocation can never overlap the next one of the same handle.
//! Different handles run independently.

use super::cadence::{Cadence, Ticker};
use crate::error::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Identifies one registered action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScheduleHandle(u64);

/// Public view of a registered action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    pub handle: ScheduleHandle,
    pub name: String,
    pub cadence: String,
}

struct Entry {
    name: String,
    cadence: String,
    token: CancellationToken,
    join: JoinHandle<()>,
}

struct SchedulerInner {
    next_id: AtomicU64,
    entries: Mutex<HashMap<ScheduleHandle, Entry>>,
    root: CancellationToken,
}

/// Cloneable scheduler; all clones share the same registrations.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("active", &self.entries().len())
            .finish()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                next_id: AtomicU64::new(1),
                entries: Mutex::new(HashMap::new()),
                root: CancellationToken::new(),
            }),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ScheduleHandle, Entry>> {
        match self.inner.entries.lock() {
            Ok(s) => s,
            Err(p) => p.into_inner(),
        }
    }

    /// Register a recurring action.
    ///
    /// The first invocation happens one full period (or the next cron fire)
    /// after registration. An `Err` or a panic from `action` is logged and
    /// the handle keeps ticking.
    pub fn schedule<F, Fut>(
        &self,
        name: impl Into<String>,
        cadence: Cadence,
        action: F,
    ) -> ScheduleHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let handle = ScheduleHandle(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let token = self.inner.root.child_token();

        debug!(job = %name, cadence = %cadence, "scheduling job");

        let join = tokio::spawn(run_job(
            name.clone(),
            cadence.clone(),
            token.clone(),
            action,
        ));

        self.entries().insert(
            handle,
            Entry {
                name,
                cadence: cadence.to_string(),
                token,
                join,
            },
        );
        handle
    }

    /// Stop a registered action. An invocation already in flight is aborted.
    ///
    /// Returns `false` if the handle was not registered.
    pub fn cancel(&self, handle: ScheduleHandle) -> bool {
        let Some(entry) = self.entries().remove(&handle) else {
            return false;
        };
        debug!(job = %entry.name, "cancelling job");
        entry.token.cancel();
        true
    }

    /// Registered actions, ordered by registration.
    pub fn active(&self) -> Vec<ScheduledJob> {
        let mut jobs: Vec<ScheduledJob> = self
            .entries()
            .iter()
            .map(|(handle, entry)| ScheduledJob {
                handle: *handle,
                name: entry.name.clone(),
                cadence: entry.cadence.clone(),
            })
            .collect();
        jobs.sort_by_key(|job| job.handle);
        jobs
    }

    /// Cancel every registered action.
    pub fn shutdown(&self) {
        self.inner.root.cancel();
        let drained: Vec<Entry> = self.entries().drain().map(|(_, entry)| entry).collect();
        for entry in drained {
            entry.token.cancel();
            entry.join.abort();
        }
    }
}

async fn run_job<F, Fut>(name: String, cadence: Cadence, token: CancellationToken, action: F)
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let mut ticker = Ticker::new(&cadence);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let invocation = tokio::spawn(action());
        let abort = invocation.abort_handle();
        tokio::select! {
            _ = token.cancelled() => {
                abort.abort();
                break;
            }
            joined = invocation => match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(job = %name, error = %e, "scheduled job failed"),
                Err(e) if e.is_panic() => error!(job = %name, "scheduled job panicked"),
                Err(e) => warn!(job = %name, error = %e, "scheduled job aborted"),
            },
        }
    }
    debug!(job = %name, "job stopped");
}
