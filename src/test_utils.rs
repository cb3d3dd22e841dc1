//! Shared test fakes used across module tests.

use crate::config::ServerConfig;
use crate::connection::{
    ConnectionManager, LinkWriter, Transport, TransportEvent, TransportLink,
};
use crate::error::{AgentError, Result};
use crate::metrics::{
    DiskReading, HostUptime, InterfaceReading, MemoryReading, MetricDomain, MetricsProvider,
    ProviderError, Reading,
};
use crate::reward::{RewardIssuer, TxId, Verification};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

/// Let spawned tasks run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// A connection manager that never connects.
pub fn disconnected_connection() -> ConnectionManager {
    ConnectionManager::new(&ServerConfig::default(), Arc::new(MockTransport::new()))
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Script {
    delay: HashMap<MetricDomain, Duration>,
    failures: HashMap<MetricDomain, String>,
    readings: HashMap<MetricDomain, Reading>,
    fail_all: bool,
    calls: HashMap<MetricDomain, u32>,
}

/// Provider answering from a script, with per-domain delays and failures.
#[derive(Default)]
pub struct ScriptedProvider {
    script: Mutex<Script>,
}

impl ScriptedProvider {
    /// Every domain answers immediately with plausible values.
    pub fn healthy() -> Self {
        Self::default()
    }

    pub fn with_delay(self, domain: MetricDomain, delay: Duration) -> Self {
        self.set_delay(domain, delay);
        self
    }

    pub fn with_failure(self, domain: MetricDomain, message: &str) -> Self {
        lock(&self.script)
            .failures
            .insert(domain, message.to_owned());
        self
    }

    pub fn with_reading(self, domain: MetricDomain, reading: Reading) -> Self {
        lock(&self.script).readings.insert(domain, reading);
        self
    }

    pub fn set_delay(&self, domain: MetricDomain, delay: Duration) {
        lock(&self.script).delay.insert(domain, delay);
    }

    /// Make every domain fail until switched back.
    pub fn fail_all(&self, fail: bool) {
        lock(&self.script).fail_all = fail;
    }

    pub fn calls(&self, domain: MetricDomain) -> u32 {
        lock(&self.script).calls.get(&domain).copied().unwrap_or(0)
    }
}

fn default_reading(domain: MetricDomain) -> Reading {
    match domain {
        MetricDomain::Cpu => Reading::Cpu { usage_percent: 12.5 },
        MetricDomain::Memory => Reading::Memory(MemoryReading {
            usage_percent: 50.0,
            total_bytes: 8 << 30,
            used_bytes: 4 << 30,
        }),
        MetricDomain::Disk => Reading::Disk(vec![DiskReading {
            mount: "/".to_owned(),
            total_bytes: 100 << 30,
            used_bytes: 25 << 30,
            usage_percent: 25.0,
        }]),
        MetricDomain::Network => Reading::Network(vec![InterfaceReading {
            name: "eth0".to_owned(),
            rx_bytes: 1_000,
            tx_bytes: 2_000,
        }]),
        MetricDomain::Uptime => Reading::Uptime(HostUptime {
            system_secs: 86_400,
            process_secs: 60,
        }),
    }
}

#[async_trait]
impl MetricsProvider for ScriptedProvider {
    async fn sample(&self, domain: MetricDomain) -> std::result::Result<Reading, ProviderError> {
        let (delay, outcome) = {
            let mut script = lock(&self.script);
            *script.calls.entry(domain).or_insert(0) += 1;
            let outcome = if script.fail_all {
                Err(ProviderError::Failed("scripted outage".to_owned()))
            } else if let Some(message) = script.failures.get(&domain) {
                Err(ProviderError::Failed(message.clone()))
            } else {
                Ok(script
                    .readings
                    .get(&domain)
                    .cloned()
                    .unwrap_or_else(|| default_reading(domain)))
            };
            (script.delay.get(&domain).copied(), outcome)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        outcome
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Default)]
struct LinkState {
    sent: Mutex<Vec<String>>,
    fail_sends: AtomicBool,
    stall_sends: AtomicBool,
    terminated: AtomicBool,
    closed: AtomicBool,
}

struct MockWriter {
    state: Arc<LinkState>,
}

#[async_trait]
impl LinkWriter for MockWriter {
    async fn send(&self, text: String) -> Result<()> {
        if self.state.stall_sends.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.state.fail_sends.load(Ordering::SeqCst)
            || self.state.terminated.load(Ordering::SeqCst)
        {
            return Err(AgentError::Connection("mock link refused send".to_owned()));
        }
        lock(&self.state.sent).push(text);
        Ok(())
    }

    async fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }

    fn terminate(&self) {
        self.state.terminated.store(true, Ordering::SeqCst);
    }
}

/// Test-side view of one opened mock link.
#[derive(Clone)]
pub struct MockLink {
    state: Arc<LinkState>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MockLink {
    /// Every frame the agent wrote, parsed as JSON.
    pub fn sent_json(&self) -> Vec<Value> {
        lock(&self.state.sent)
            .iter()
            .filter_map(|s| serde_json::from_str(s).ok())
            .collect()
    }

    /// Deliver a frame as if the peer had sent it.
    pub fn inject(&self, text: &str) {
        let _ = self.events.send(TransportEvent::Message(text.to_owned()));
    }

    pub fn close_from_peer(&self) {
        let _ = self.events.send(TransportEvent::Closed(None));
    }

    pub fn fail_from_peer(&self, reason: &str) {
        let _ = self.events.send(TransportEvent::Error(reason.to_owned()));
    }

    /// Make every later send fail.
    pub fn fail_sends(&self) {
        self.state.fail_sends.store(true, Ordering::SeqCst);
    }

    /// Make every later send hang forever, as a wedged peer would.
    pub fn stall_sends(&self) {
        self.state.stall_sends.store(true, Ordering::SeqCst);
    }

    pub fn is_terminated(&self) -> bool {
        self.state.terminated.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct TransportState {
    fail_remaining: AtomicU32,
    hang_opens: AtomicBool,
    opens: AtomicU32,
    links: Mutex<Vec<MockLink>>,
}

/// In-memory transport recording every link it opens.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<TransportState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `n` opens.
    pub fn fail_opens(&self, n: u32) {
        self.state.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Make later opens never complete until switched back.
    pub fn hang_opens(&self, hang: bool) {
        self.state.hang_opens.store(hang, Ordering::SeqCst);
    }

    /// Number of open attempts, failed ones included.
    pub fn open_count(&self) -> u32 {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn last_link(&self) -> Option<MockLink> {
        lock(&self.state.links).last().cloned()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, url: &str) -> Result<TransportLink> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        if self.state.hang_opens.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let refused = self
            .state
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(AgentError::Connection(format!("connect {url}: refused")));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let link_state = Arc::new(LinkState::default());
        lock(&self.state.links).push(MockLink {
            state: Arc::clone(&link_state),
            events: tx,
        });
        Ok(TransportLink {
            writer: Arc::new(MockWriter { state: link_state }),
            events: rx,
        })
    }
}

// ---------------------------------------------------------------------------
// Rewards
// ---------------------------------------------------------------------------

/// Issuer recording payouts and verifications.
#[derive(Default)]
pub struct RecordingIssuer {
    sent: Mutex<Vec<f64>>,
    verified: Mutex<Vec<TxId>>,
    fail: AtomicBool,
}

impl RecordingIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<f64> {
        lock(&self.sent).clone()
    }

    pub fn verified(&self) -> Vec<TxId> {
        lock(&self.verified).clone()
    }
}

#[async_trait]
impl RewardIssuer for RecordingIssuer {
    async fn send(&self, amount: f64) -> Result<TxId> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AgentError::Reward("issuer unavailable".to_owned()));
        }
        let mut sent = lock(&self.sent);
        sent.push(amount);
        Ok(TxId(format!("tx-{}", sent.len())))
    }

    async fn verify(&self, tx: &TxId) -> Result<Verification> {
        lock(&self.verified).push(tx.clone());
        Ok(Verification {
            confirmed: true,
            status: "confirmed".to_owned(),
        })
    }
}
