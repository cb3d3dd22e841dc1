//! The metric acquisition capability consumed by the collector.
//!
//! Raw sampling of CPU, memory, disks and interfaces lives behind
//! [`MetricsProvider`]; the core only decides what to ask for, how long to
//! wait, and what to do when a domain does not answer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A family of host readings sampled as one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricDomain {
    Cpu,
    Memory,
    Disk,
    Network,
    Uptime,
}

impl MetricDomain {
    /// Every domain, in collection order.
    pub const ALL: [MetricDomain; 5] = [
        MetricDomain::Cpu,
        MetricDomain::Memory,
        MetricDomain::Disk,
        MetricDomain::Network,
        MetricDomain::Uptime,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Disk => "disk",
            Self::Network => "network",
            Self::Uptime => "uptime",
        }
    }
}

impl std::fmt::Display for MetricDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Memory usage reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryReading {
    pub usage_percent: f64,
    pub total_bytes: u64,
    pub used_bytes: u64,
}

/// One mounted filesystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskReading {
    pub mount: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub usage_percent: f64,
}

/// Counters for one network interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceReading {
    pub name: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Host and process uptime as seen by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostUptime {
    pub system_secs: u64,
    pub process_secs: u64,
}

/// A successful sample for one domain.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Cpu { usage_percent: f64 },
    Memory(MemoryReading),
    Disk(Vec<DiskReading>),
    Network(Vec<InterfaceReading>),
    Uptime(HostUptime),
}

impl Reading {
    /// The domain this reading answers.
    pub fn domain(&self) -> MetricDomain {
        match self {
            Self::Cpu { .. } => MetricDomain::Cpu,
            Self::Memory(_) => MetricDomain::Memory,
            Self::Disk(_) => MetricDomain::Disk,
            Self::Network(_) => MetricDomain::Network,
            Self::Uptime(_) => MetricDomain::Uptime,
        }
    }
}

/// Why a domain produced no reading.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    /// The provider did not answer within the collection bound.
    #[error("timed out after {0} ms")]
    Timeout(u64),
    /// The domain cannot be sampled on this host.
    #[error("not supported on this host")]
    Unsupported,
    /// The provider tried and failed.
    #[error("{0}")]
    Failed(String),
}

/// Samples host telemetry one domain at a time.
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    async fn sample(&self, domain: MetricDomain) -> Result<Reading, ProviderError>;
}
