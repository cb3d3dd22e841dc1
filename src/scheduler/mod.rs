//! Periodic task scheduler.
//!
//! Drives metrics collection, checkpointing, status heartbeats and the
//! user-defined monitoring checks, each on its own cadence.

pub mod cadence;
pub mod checks;
pub mod runner;
pub mod tasks;

pub use cadence::Cadence;
pub use checks::{CheckOutcome, CheckRunner};
pub use runner::{ScheduleHandle, ScheduledJob, Scheduler};
pub use tasks::{MonitorTask, TaskInterval, TaskKind, TaskManager, TaskSpec, TaskSummary};
