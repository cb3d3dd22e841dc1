//! Host telemetry: acquisition, snapshots, history and the collection cycle.

pub mod collector;
pub mod history;
pub mod pipeline;
pub mod procfs;
pub mod provider;
pub mod snapshot;

pub use collector::Collector;
pub use history::{BoundedHistory, HISTORY_CAPACITY};
pub use pipeline::{
    MetricsPipeline, MetricsQuery, PipelineHealth, RECOVERY_ERROR_COUNT, UNHEALTHY_ERROR_COUNT,
    publish_snapshot,
};
pub use procfs::ProcMetricsProvider;
pub use provider::{
    DiskReading, HostUptime, InterfaceReading, MemoryReading, MetricDomain, MetricsProvider,
    ProviderError, Reading,
};
pub use snapshot::{DomainSample, HistoryPoint, MetricSnapshot};
