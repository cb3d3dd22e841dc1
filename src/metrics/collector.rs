//! Snapshot collection with a per-domain timeout.

use super::provider::{MetricDomain, MetricsProvider, ProviderError, Reading};
use super::snapshot::{DomainSample, MetricSnapshot};
use crate::error::{AgentError, Result};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Asks a [`MetricsProvider`] for every enabled domain and assembles a
/// [`MetricSnapshot`].
pub struct Collector {
    provider: Arc<dyn MetricsProvider>,
    domains: BTreeSet<MetricDomain>,
    timeout: Duration,
    started_at: Instant,
}

impl Collector {
    pub fn new(provider: Arc<dyn MetricsProvider>, domains: &[MetricDomain], timeout: Duration) -> Self {
        Self {
            provider,
            domains: domains.iter().copied().collect(),
            timeout,
            started_at: Instant::now(),
        }
    }

    pub fn domains(&self) -> impl Iterator<Item = MetricDomain> + '_ {
        self.domains.iter().copied()
    }

    /// Seconds since this collector (and so this agent run) started.
    pub fn client_uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Sample every enabled domain concurrently.
    ///
    /// A domain that fails or exceeds the timeout becomes an error marker in
    /// the snapshot; the other domains are unaffected.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Metrics`] only when every enabled domain failed.
    pub async fn collect(&self) -> Result<MetricSnapshot> {
        let results = futures_util::future::join_all(
            self.domains
                .iter()
                .map(|domain| async move { (*domain, self.sample(*domain).await) }),
        )
        .await;

        let mut snapshot = MetricSnapshot {
            timestamp: Utc::now(),
            cpu: DomainSample::Disabled,
            memory: DomainSample::Disabled,
            disks: DomainSample::Disabled,
            network: DomainSample::Disabled,
            host_uptime: DomainSample::Disabled,
            client_uptime_secs: self.client_uptime_secs(),
        };

        let mut failed = Vec::new();
        for (domain, result) in results {
            match result {
                Ok(Reading::Cpu { usage_percent }) => snapshot.cpu = DomainSample::Ok(usage_percent),
                Ok(Reading::Memory(memory)) => snapshot.memory = DomainSample::Ok(memory),
                Ok(Reading::Disk(disks)) => snapshot.disks = DomainSample::Ok(disks),
                Ok(Reading::Network(interfaces)) => {
                    snapshot.network = DomainSample::Ok(interfaces);
                }
                Ok(Reading::Uptime(uptime)) => snapshot.host_uptime = DomainSample::Ok(uptime),
                Err(e) => {
                    warn!(domain = %domain, error = %e, "metric domain failed");
                    mark_error(&mut snapshot, domain, e.to_string());
                    failed.push(domain);
                }
            }
        }

        if !self.domains.is_empty() && failed.len() == self.domains.len() {
            return Err(AgentError::Metrics(format!(
                "all {} metric domains failed",
                failed.len()
            )));
        }

        debug!(failed = failed.len(), "snapshot collected");
        Ok(snapshot)
    }

    async fn sample(&self, domain: MetricDomain) -> std::result::Result<Reading, ProviderError> {
        match tokio::time::timeout(self.timeout, self.provider.sample(domain)).await {
            Ok(Ok(reading)) if reading.domain() == domain => Ok(reading),
            Ok(Ok(reading)) => Err(ProviderError::Failed(format!(
                "provider answered {} when asked for {domain}",
                reading.domain()
            ))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProviderError::Timeout(
                u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            )),
        }
    }
}

fn mark_error(snapshot: &mut MetricSnapshot, domain: MetricDomain, reason: String) {
    match domain {
        MetricDomain::Cpu => snapshot.cpu = DomainSample::Error(reason),
        MetricDomain::Memory => snapshot.memory = DomainSample::Error(reason),
        MetricDomain::Disk => snapshot.disks = DomainSample::Error(reason),
        MetricDomain::Network => snapshot.network = DomainSample::Error(reason),
        MetricDomain::Uptime => snapshot.host_uptime = DomainSample::Error(reason),
    }
}
