//! Shared fakes for integration tests, built on the public traits only.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use vigil::agent::Collaborators;
use vigil::config::AgentConfig;
use vigil::connection::{LinkWriter, Transport, TransportEvent, TransportLink};
use vigil::error::{AgentError, Result};
use vigil::location::StaticLocationProvider;
use vigil::metrics::{
    DiskReading, HostUptime, InterfaceReading, MemoryReading, MetricDomain, MetricsProvider,
    ProviderError, Reading,
};
use vigil::reward::{RewardIssuer, TxId, Verification};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

/// Let spawned tasks run.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Config pointing state at `dir` with a fixed node identity.
pub(crate) fn temp_config(dir: &tempfile::TempDir) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.storage.state_path = Some(dir.path().join("state.json"));
    config.node.node_id = Some("node-it".to_owned());
    config.node.wallet = Some("wallet-it".to_owned());
    config
}

/// Fakes handed to an agent plus the test-side handles onto them.
pub(crate) struct Fakes {
    pub provider: Arc<FakeProvider>,
    pub issuer: Arc<FakeIssuer>,
    pub transport: FakeTransport,
}

impl Fakes {
    pub(crate) fn new() -> Self {
        Self {
            provider: Arc::new(FakeProvider::default()),
            issuer: Arc::new(FakeIssuer::default()),
            transport: FakeTransport::default(),
        }
    }

    pub(crate) fn collaborators(&self) -> Collaborators {
        Collaborators {
            metrics: Arc::clone(&self.provider) as Arc<dyn MetricsProvider>,
            rewards: Arc::clone(&self.issuer) as Arc<dyn RewardIssuer>,
            location: Arc::new(StaticLocationProvider::default()),
            transport: Arc::new(self.transport.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Provider with fixed readings that can be switched into a full outage.
#[derive(Default)]
pub(crate) struct FakeProvider {
    outage: AtomicBool,
    process_secs: AtomicU32,
}

impl FakeProvider {
    pub(crate) fn set_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    pub(crate) fn set_process_secs(&self, secs: u32) {
        self.process_secs.store(secs, Ordering::SeqCst);
    }
}

#[async_trait]
impl MetricsProvider for FakeProvider {
    async fn sample(&self, domain: MetricDomain) -> std::result::Result<Reading, ProviderError> {
        if self.outage.load(Ordering::SeqCst) {
            return Err(ProviderError::Failed(format!("{domain} source offline")));
        }
        Ok(match domain {
            MetricDomain::Cpu => Reading::Cpu { usage_percent: 7.5 },
            MetricDomain::Memory => Reading::Memory(MemoryReading {
                usage_percent: 40.0,
                total_bytes: 10 << 30,
                used_bytes: 4 << 30,
            }),
            MetricDomain::Disk => Reading::Disk(vec![DiskReading {
                mount: "/".to_owned(),
                total_bytes: 200 << 30,
                used_bytes: 50 << 30,
                usage_percent: 25.0,
            }]),
            MetricDomain::Network => Reading::Network(vec![InterfaceReading {
                name: "eth0".to_owned(),
                rx_bytes: 4_096,
                tx_bytes: 8_192,
            }]),
            MetricDomain::Uptime => Reading::Uptime(HostUptime {
                system_secs: 3_600,
                process_secs: u64::from(self.process_secs.load(Ordering::SeqCst)),
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Default)]
struct LinkState {
    sent: Mutex<Vec<String>>,
    terminated: AtomicBool,
}

struct FakeWriter {
    state: Arc<LinkState>,
}

#[async_trait]
impl LinkWriter for FakeWriter {
    async fn send(&self, text: String) -> Result<()> {
        if self.state.terminated.load(Ordering::SeqCst) {
            return Err(AgentError::Connection("link terminated".to_owned()));
        }
        lock(&self.state.sent).push(text);
        Ok(())
    }

    async fn close(&self) {
        self.state.terminated.store(true, Ordering::SeqCst);
    }

    fn terminate(&self) {
        self.state.terminated.store(true, Ordering::SeqCst);
    }
}

/// Test-side handle onto one opened link.
#[derive(Clone)]
pub(crate) struct FakeLink {
    state: Arc<LinkState>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl FakeLink {
    pub(crate) fn frames(&self) -> Vec<Value> {
        lock(&self.state.sent)
            .iter()
            .filter_map(|s| serde_json::from_str(s).ok())
            .collect()
    }

    pub(crate) fn frame_types(&self) -> Vec<String> {
        self.frames()
            .iter()
            .filter_map(|f| f["type"].as_str().map(str::to_owned))
            .collect()
    }

    pub(crate) fn inject(&self, text: &str) {
        let _ = self.events.send(TransportEvent::Message(text.to_owned()));
    }

    pub(crate) fn drop_from_peer(&self) {
        let _ = self.events.send(TransportEvent::Closed(Some("going away".to_owned())));
    }
}

#[derive(Default)]
struct TransportState {
    refuse: AtomicBool,
    attempts: AtomicU32,
    links: Mutex<Vec<FakeLink>>,
}

/// In-memory transport that can be told to refuse connections.
#[derive(Clone, Default)]
pub(crate) struct FakeTransport {
    state: Arc<TransportState>,
}

impl FakeTransport {
    pub(crate) fn refuse(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.state.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn links(&self) -> usize {
        lock(&self.state.links).len()
    }

    pub(crate) fn last_link(&self) -> FakeLink {
        lock(&self.state.links)
            .last()
            .cloned()
            .expect("no link opened")
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&self, url: &str) -> Result<TransportLink> {
        self.state.attempts.fetch_add(1, Ordering::SeqCst);
        if self.state.refuse.load(Ordering::SeqCst) {
            return Err(AgentError::Connection(format!("connect {url}: refused")));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let link_state = Arc::new(LinkState::default());
        lock(&self.state.links).push(FakeLink {
            state: Arc::clone(&link_state),
            events: tx,
        });
        Ok(TransportLink {
            writer: Arc::new(FakeWriter { state: link_state }),
            events: rx,
        })
    }
}

// ---------------------------------------------------------------------------
// Rewards
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct FakeIssuer {
    sent: Mutex<Vec<f64>>,
    verified: Mutex<Vec<String>>,
}

impl FakeIssuer {
    pub(crate) fn sent(&self) -> Vec<f64> {
        lock(&self.sent).clone()
    }

    pub(crate) fn verified(&self) -> Vec<String> {
        lock(&self.verified).clone()
    }
}

#[async_trait]
impl RewardIssuer for FakeIssuer {
    async fn send(&self, amount: f64) -> Result<TxId> {
        let mut sent = lock(&self.sent);
        sent.push(amount);
        Ok(TxId(format!("0xit{}", sent.len())))
    }

    async fn verify(&self, tx: &TxId) -> Result<Verification> {
        lock(&self.verified).push(tx.0.clone());
        Ok(Verification {
            confirmed: true,
            status: "confirmed".to_owned(),
        })
    }
}
