//! Error types for the vigil agent.

/// Top-level error type for the agent core.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Persistent state load/save error.
    #[error("state error: {0}")]
    State(String),

    /// Metric collection error.
    #[error("metrics error: {0}")]
    Metrics(String),

    /// Scheduler error (registration, cadence parsing).
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// Transport or connection lifecycle error.
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed or unexpected wire message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Reward issuance or verification error.
    #[error("reward error: {0}")]
    Reward(String),

    /// Monitoring check execution error.
    #[error("check error: {0}")]
    Check(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AgentError>;
