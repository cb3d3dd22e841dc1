//! Vigil: a host telemetry agent.
//!
//! The agent samples host metrics on a schedule, keeps one resilient
//! WebSocket link to a remote aggregator, and pays out uptime-gated rewards.
//!
//! # Architecture
//!
//! - **Scheduler** ([`scheduler`]): recurring jobs with per-job non-overlap
//!   and fault isolation; drives collection, checkpoints, heartbeats and
//!   monitoring checks
//! - **Metrics** ([`metrics`]): per-domain collection with timeouts, bounded
//!   history and the query surface
//! - **Connection** ([`connection`]): reconnect with jittered backoff,
//!   liveness probing, a bounded priority queue and inbound dispatch
//! - **Rewards** ([`reward`]): uptime evaluation against the reward window
//! - **State** ([`state`]): the single owned agent state and its JSON store
//!
//! [`agent::Agent`] wires these together from an [`config::AgentConfig`].

pub mod agent;
pub mod config;
pub mod connection;
pub mod dirs;
pub mod error;
pub mod location;
pub mod logging;
pub mod metrics;
pub mod reward;
pub mod scheduler;
pub mod state;

#[cfg(test)]
pub(crate) mod test_utils;

pub use agent::{Agent, AgentReport, Collaborators};
pub use config::AgentConfig;
pub use error::{AgentError, Result};
