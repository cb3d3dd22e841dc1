//! Executors for the monitoring check types.

use super::tasks::TaskKind;
use crate::error::{AgentError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

/// Default bound on a single check.
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of one check execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckOutcome {
    pub success: bool,
    pub latency_ms: Option<u64>,
    pub detail: String,
    pub checked_at: DateTime<Utc>,
}

impl CheckOutcome {
    fn new(success: bool, latency: Option<Duration>, detail: impl Into<String>) -> Self {
        Self {
            success,
            latency_ms: latency.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            detail: detail.into(),
            checked_at: Utc::now(),
        }
    }

    /// Outcome recorded for a check that could not be carried out at all.
    pub fn failed(detail: impl Into<String>) -> Self {
        Self::new(false, None, detail)
    }
}

/// Runs http / ping / tcp / dns checks with a shared timeout.
#[derive(Debug, Clone)]
pub struct CheckRunner {
    http: reqwest::Client,
    timeout: Duration,
}

impl CheckRunner {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("vigil/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AgentError::Check(format!("cannot build http client: {e}")))?;
        Ok(Self { http, timeout })
    }

    /// Execute one check against `target`.
    ///
    /// A reachable target that answers badly (HTTP 5xx, ping loss) is an
    /// unsuccessful [`CheckOutcome`]; a target that cannot be reached at all
    /// is an error.
    pub async fn run(&self, kind: TaskKind, target: &str) -> Result<CheckOutcome> {
        debug!(kind = %kind, target, "running check");
        match kind {
            TaskKind::Http => self.http(target).await,
            TaskKind::Tcp => self.tcp(target).await,
            TaskKind::Dns => self.dns(target).await,
            TaskKind::Ping => self.ping(target).await,
        }
    }

    async fn http(&self, target: &str) -> Result<CheckOutcome> {
        let started = Instant::now();
        let response = self
            .http
            .get(target)
            .send()
            .await
            .map_err(|e| AgentError::Check(format!("http {target}: {e}")))?;
        let status = response.status();
        Ok(CheckOutcome::new(
            status.is_success(),
            Some(started.elapsed()),
            format!("HTTP {}", status.as_u16()),
        ))
    }

    async fn tcp(&self, target: &str) -> Result<CheckOutcome> {
        let started = Instant::now();
        let stream = tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(target))
            .await
            .map_err(|_| {
                AgentError::Check(format!(
                    "tcp {target}: timed out after {} ms",
                    self.timeout.as_millis()
                ))
            })?
            .map_err(|e| AgentError::Check(format!("tcp {target}: {e}")))?;
        let latency = started.elapsed();
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| target.to_owned());
        Ok(CheckOutcome::new(
            true,
            Some(latency),
            format!("connected to {peer}"),
        ))
    }

    async fn dns(&self, target: &str) -> Result<CheckOutcome> {
        let started = Instant::now();
        let resolved = tokio::time::timeout(self.timeout, tokio::net::lookup_host((target, 0)))
            .await
            .map_err(|_| AgentError::Check(format!("dns {target}: timed out")))?
            .map_err(|e| AgentError::Check(format!("dns {target}: {e}")))?;

        let mut addresses: Vec<String> = resolved.map(|addr| addr.ip().to_string()).collect();
        addresses.sort();
        addresses.dedup();
        if addresses.is_empty() {
            return Err(AgentError::Check(format!("dns {target}: no addresses")));
        }
        Ok(CheckOutcome::new(
            true,
            Some(started.elapsed()),
            addresses.join(", "),
        ))
    }

    async fn ping(&self, target: &str) -> Result<CheckOutcome> {
        // A leading dash would be parsed by ping as an option.
        if target.is_empty() || target.starts_with('-') {
            return Err(AgentError::Check(format!("ping: invalid target '{target}'")));
        }
        let wait_secs = self.timeout.as_secs().max(1).to_string();
        let mut command = tokio::process::Command::new("ping");
        command
            .args(["-c", "1", "-W", wait_secs.as_str(), "--", target])
            .kill_on_drop(true);

        let started = Instant::now();
        let output = tokio::time::timeout(self.timeout + Duration::from_secs(1), command.output())
            .await
            .map_err(|_| AgentError::Check(format!("ping {target}: timed out")))?
            .map_err(|e| AgentError::Check(format!("ping {target}: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            return Ok(CheckOutcome::new(
                false,
                None,
                format!("no reply from {target}"),
            ));
        }
        let latency = parse_ping_latency(&stdout)
            .map(Duration::from_secs_f64)
            .or_else(|| Some(started.elapsed()));
        Ok(CheckOutcome::new(
            true,
            latency,
            format!("reply from {target}"),
        ))
    }
}

/// Round-trip time in seconds from `ping` output (`time=12.3 ms`).
pub fn parse_ping_latency(output: &str) -> Option<f64> {
    let start = output.find("time=")? + "time=".len();
    let rest = &output[start..];
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    let millis: f64 = rest[..end].parse().ok()?;
    Some(millis / 1000.0)
}
