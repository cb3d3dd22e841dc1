//! Point-in-time telemetry snapshots and their history projection.

use super::provider::{DiskReading, HostUptime, InterfaceReading, MemoryReading, MetricDomain};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of sampling one domain within a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "lowercase")]
pub enum DomainSample<T> {
    /// The provider answered.
    Ok(T),
    /// The provider failed or timed out; the marker carries the reason.
    Error(String),
    /// The domain is not enabled in configuration.
    Disabled,
}

impl<T> DomainSample<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Ok(v) => Some(v),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// One immutable reading of host telemetry.
///
/// A new snapshot supersedes the previous one; snapshots are never mutated
/// after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSnapshot {
    pub timestamp: DateTime<Utc>,
    /// CPU usage percent.
    pub cpu: DomainSample<f64>,
    pub memory: DomainSample<MemoryReading>,
    pub disks: DomainSample<Vec<DiskReading>>,
    pub network: DomainSample<Vec<InterfaceReading>>,
    pub host_uptime: DomainSample<HostUptime>,
    /// Seconds this agent instance has been running.
    pub client_uptime_secs: u64,
}

impl MetricSnapshot {
    pub fn cpu_usage(&self) -> Option<f64> {
        self.cpu.value().copied()
    }

    pub fn memory_usage(&self) -> Option<f64> {
        self.memory.value().map(|m| m.usage_percent)
    }

    /// Domains that carry an error marker, with the reason.
    pub fn domain_errors(&self) -> Vec<(MetricDomain, &str)> {
        let mut errors = Vec::new();
        if let Some(e) = self.cpu.error() {
            errors.push((MetricDomain::Cpu, e));
        }
        if let Some(e) = self.memory.error() {
            errors.push((MetricDomain::Memory, e));
        }
        if let Some(e) = self.disks.error() {
            errors.push((MetricDomain::Disk, e));
        }
        if let Some(e) = self.network.error() {
            errors.push((MetricDomain::Network, e));
        }
        if let Some(e) = self.host_uptime.error() {
            errors.push((MetricDomain::Uptime, e));
        }
        errors
    }
}

/// Lossy projection of a snapshot kept for trends and uptime accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPoint {
    pub timestamp: DateTime<Utc>,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub client_uptime_secs: u64,
}

impl From<&MetricSnapshot> for HistoryPoint {
    fn from(snapshot: &MetricSnapshot) -> Self {
        Self {
            timestamp: snapshot.timestamp,
            cpu_usage: snapshot.cpu_usage(),
            memory_usage: snapshot.memory_usage(),
            client_uptime_secs: snapshot.client_uptime_secs,
        }
    }
}
