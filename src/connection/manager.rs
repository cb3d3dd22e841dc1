//! The single logical link to the aggregator.
//!
//! [`ConnectionManager`] owns the connection state machine
//! (`Disconnected -> Connecting -> Connected -> Disconnected`), the reconnect
//! timer, the liveness ping, the health check, the pending-outbound queue and
//! the inbound handler table. Every link gets a generation number; signals
//! from a link that has already been replaced are ignored.

use super::backoff::{ReconnectPolicy, ReconnectStep};
use super::protocol::{InboundKind, InboundMessage, OutboundKind, OutboundMessage, Priority};
use super::queue::PendingQueue;
use super::transport::{LinkWriter, Transport, TransportEvent, TransportLink};
use crate::config::ServerConfig;
use crate::error::{AgentError, Result};
use crate::location::Location;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Attempts added when a link fails shortly after opening.
pub const GRACE_PENALTY: u32 = 2;

/// Connection phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
}

/// What happened to a message passed to [`ConnectionManager::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Held for replay on the next connect.
    Queued,
    Dropped,
}

/// Identity presented on authentication and registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub node_id: String,
    pub wallet: Option<String>,
}

/// Read-only view of the connection for status reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub phase: Phase,
    pub reconnect_attempts: u32,
    pub pending: usize,
    pub connected_since: Option<DateTime<Utc>>,
    pub last_pong: Option<DateTime<Utc>>,
}

/// Reacts to one inbound message type.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, connection: &ConnectionManager, data: Value) -> Result<()>;
}

struct ConnectionState {
    phase: Phase,
    reconnect_attempts: u32,
    pending: PendingQueue,
    connection_started_at: Option<Instant>,
    connected_since: Option<DateTime<Utc>>,
    last_pong: Option<DateTime<Utc>>,
    generation: u64,
    writer: Option<Arc<dyn LinkWriter>>,
    link_tasks: Vec<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
}

impl ConnectionState {
    /// Drop the current link without touching the reconnect timer.
    fn teardown(&mut self) {
        for task in self.link_tasks.drain(..) {
            task.abort();
        }
        if let Some(writer) = self.writer.take() {
            writer.terminate();
        }
        self.phase = Phase::Disconnected;
        self.connection_started_at = None;
        self.connected_since = None;
        self.generation = self.generation.wrapping_add(1);
    }

    fn current_writer(&self, generation: u64) -> Option<Arc<dyn LinkWriter>> {
        if self.generation == generation && self.phase == Phase::Connected {
            self.writer.clone()
        } else {
            None
        }
    }
}

struct Inner {
    url: String,
    ping_interval: Duration,
    health_check_interval: Duration,
    connect_timeout: Duration,
    send_timeout: Duration,
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    state: Mutex<ConnectionState>,
    handlers: RwLock<HashMap<InboundKind, Arc<dyn InboundHandler>>>,
    identity: RwLock<Option<NodeIdentity>>,
    shutdown: CancellationToken,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to the aggregator link.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.inner.url)
            .field("status", &self.status())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(config: &ServerConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(Inner {
                url: config.url.clone(),
                ping_interval: config.ping_interval(),
                health_check_interval: config.health_check_interval(),
                connect_timeout: config.connect_timeout(),
                send_timeout: config.send_timeout(),
                transport,
                policy: ReconnectPolicy::from(config),
                state: Mutex::new(ConnectionState {
                    phase: Phase::Disconnected,
                    reconnect_attempts: 0,
                    pending: PendingQueue::new(config.pending_capacity),
                    connection_started_at: None,
                    connected_since: None,
                    last_pong: None,
                    generation: 0,
                    writer: None,
                    link_tasks: Vec::new(),
                    reconnect_task: None,
                }),
                handlers: RwLock::new(HashMap::new()),
                identity: RwLock::new(None),
                shutdown: CancellationToken::new(),
                health_task: Mutex::new(None),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        match self.inner.state.lock() {
            Ok(s) => s,
            Err(p) => p.into_inner(),
        }
    }

    pub fn with_identity(self, identity: Option<NodeIdentity>) -> Self {
        self.set_identity(identity);
        self
    }

    pub fn set_identity(&self, identity: Option<NodeIdentity>) {
        match self.inner.identity.write() {
            Ok(mut slot) => *slot = identity,
            Err(p) => *p.into_inner() = identity,
        }
    }

    pub fn identity(&self) -> Option<NodeIdentity> {
        match self.inner.identity.read() {
            Ok(slot) => slot.clone(),
            Err(p) => p.into_inner().clone(),
        }
    }

    /// Install the handler for one inbound type, replacing any previous one.
    pub fn register_handler(&self, kind: InboundKind, handler: Arc<dyn InboundHandler>) {
        match self.inner.handlers.write() {
            Ok(mut table) => table.insert(kind, handler),
            Err(p) => p.into_inner().insert(kind, handler),
        };
    }

    fn handler(&self, kind: InboundKind) -> Option<Arc<dyn InboundHandler>> {
        match self.inner.handlers.read() {
            Ok(table) => table.get(&kind).cloned(),
            Err(p) => p.into_inner().get(&kind).cloned(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub fn is_connected(&self) -> bool {
        self.phase() == Phase::Connected
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.lock().reconnect_attempts
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn status(&self) -> ConnectionStatus {
        let st = self.lock();
        ConnectionStatus {
            phase: st.phase,
            reconnect_attempts: st.reconnect_attempts,
            pending: st.pending.len(),
            connected_since: st.connected_since,
            last_pong: st.last_pong,
        }
    }

    /// Start the health check and make the first connection attempt.
    ///
    /// A failed first attempt is not an error: the reconnect policy takes
    /// over.
    pub async fn start(&self) {
        let this = self.clone();
        let health = tokio::spawn(async move { this.health_loop().await });
        let mut slot = match self.inner.health_task.lock() {
            Ok(s) => s,
            Err(p) => p.into_inner(),
        };
        if let Some(previous) = slot.replace(health) {
            previous.abort();
        }
        drop(slot);

        if let Err(e) = self.connect().await {
            warn!(error = %e, "initial connection failed, will retry");
        }
    }

    /// Replace any existing link with a fresh one.
    ///
    /// # Errors
    ///
    /// Returns an error if the link cannot be opened (a reconnect is then
    /// scheduled) or if the manager has been shut down.
    pub async fn connect(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(AgentError::Connection("connection manager is shut down".to_owned()));
        }

        let generation = {
            let mut st = self.lock();
            if let Some(timer) = st.reconnect_task.take() {
                timer.abort();
            }
            st.teardown();
            st.phase = Phase::Connecting;
            st.generation
        };

        debug!(url = %self.inner.url, "connecting");
        let opened = tokio::time::timeout(
            self.inner.connect_timeout,
            self.inner.transport.open(&self.inner.url),
        )
        .await
        .unwrap_or_else(|_| {
            Err(AgentError::Connection(format!(
                "connect timed out after {}ms",
                self.inner.connect_timeout.as_millis()
            )))
        });
        let TransportLink { writer, events } = match opened {
            Ok(link) => link,
            Err(e) => {
                warn!(url = %self.inner.url, error = %e, "connect failed");
                self.handle_link_down(generation, &e.to_string());
                return Err(e);
            }
        };

        {
            let mut st = self.lock();
            if st.generation != generation || self.inner.shutdown.is_cancelled() {
                writer.terminate();
                return Err(AgentError::Connection(
                    "connection attempt superseded".to_owned(),
                ));
            }
            st.phase = Phase::Connected;
            st.reconnect_attempts = 0;
            st.connection_started_at = Some(Instant::now());
            st.connected_since = Some(Utc::now());
            st.writer = Some(writer);
            // A fresh authenticate follows; stale ones must not be replayed.
            st.pending.discard(OutboundKind::Authenticate);

            let reader = self.clone();
            st.link_tasks
                .push(tokio::spawn(async move { reader.read_loop(generation, events).await }));
            let pinger = self.clone();
            st.link_tasks
                .push(tokio::spawn(async move { pinger.ping_loop(generation).await }));
        }

        info!(url = %self.inner.url, "connected");
        self.authenticate().await;
        self.flush_pending(generation).await;
        Ok(())
    }

    /// Cancel any pending reconnect timer and connect now.
    ///
    /// # Errors
    ///
    /// See [`ConnectionManager::connect`].
    pub async fn force_reconnect(&self) -> Result<()> {
        info!("forcing reconnect");
        self.connect().await
    }

    /// Send a message built from its parts.
    pub async fn send(&self, kind: OutboundKind, data: Value, priority: Priority) -> SendOutcome {
        self.send_message(OutboundMessage::new(kind, data, priority))
            .await
    }

    /// Transmit now if connected; otherwise hold high-priority messages and
    /// drop the rest. A failed transmit counts as a disconnect.
    pub async fn send_message(&self, message: OutboundMessage) -> SendOutcome {
        let (writer, generation) = {
            let mut st = self.lock();
            let generation = st.generation;
            match st.current_writer(generation) {
                Some(writer) => (writer, generation),
                None => return hold_or_drop(&mut st.pending, message),
            }
        };

        match transmit(writer.as_ref(), &message, self.inner.send_timeout).await {
            Ok(()) => SendOutcome::Sent,
            Err(e) => {
                warn!(kind = %message.kind, error = %e, "send failed");
                self.handle_link_down(generation, &format!("send failed: {e}"));
                hold_or_drop(&mut self.lock().pending, message)
            }
        }
    }

    /// Send `authenticate` if an identity is configured.
    pub async fn authenticate(&self) -> SendOutcome {
        let Some(identity) = self.identity() else {
            debug!("no node identity configured, skipping authentication");
            return SendOutcome::Dropped;
        };
        self.send(
            OutboundKind::Authenticate,
            json!({ "nodeId": identity.node_id, "wallet": identity.wallet }),
            Priority::High,
        )
        .await
    }

    /// Register this node, then authenticate again.
    pub async fn register_node(&self, location: Option<Location>) -> SendOutcome {
        let Some(identity) = self.identity() else {
            warn!("cannot register without a node identity");
            return SendOutcome::Dropped;
        };
        info!(node_id = %identity.node_id, "registering node");
        let outcome = self
            .send(
                OutboundKind::Register,
                json!({
                    "nodeId": identity.node_id,
                    "wallet": identity.wallet,
                    "location": location,
                }),
                Priority::High,
            )
            .await;
        self.authenticate().await;
        outcome
    }

    /// Raise the reconnect counter to at least `min_attempts`.
    pub fn bias_backoff(&self, min_attempts: u32) {
        let mut st = self.lock();
        if st.reconnect_attempts < min_attempts {
            debug!(from = st.reconnect_attempts, to = min_attempts, "biasing reconnect backoff");
            st.reconnect_attempts = min_attempts;
        }
    }

    pub fn note_pong(&self) {
        self.lock().last_pong = Some(Utc::now());
    }

    /// Probe the link with a send. A failed probe hard-closes the link and
    /// starts the reconnect policy. Returns whether the link is healthy.
    pub async fn check_health(&self) -> bool {
        let (writer, generation) = {
            let st = self.lock();
            if st.phase != Phase::Connected {
                return false;
            }
            (st.writer.clone(), st.generation)
        };
        let Some(writer) = writer else {
            self.handle_link_down(generation, "connected without a transport");
            return false;
        };

        let probe = OutboundMessage::new(OutboundKind::Ping, json!({ "probe": true }), Priority::Low);
        match transmit(writer.as_ref(), &probe, self.inner.send_timeout).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "health probe failed, forcing disconnect");
                self.handle_link_down(generation, "health probe failed");
                false
            }
        }
    }

    /// Route one inbound frame to its handler. Unknown or malformed frames
    /// are logged and dropped.
    pub async fn dispatch(&self, text: &str) {
        let message = match InboundMessage::parse(text) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "dropping inbound frame");
                return;
            }
        };
        let Some(kind) = InboundKind::from_wire(&message.kind) else {
            warn!(kind = %message.kind, "dropping inbound message of unknown type");
            return;
        };
        let Some(handler) = self.handler(kind) else {
            debug!(kind = kind.as_str(), "no handler registered");
            return;
        };
        if let Err(e) = handler.handle(self, message.data).await {
            warn!(kind = kind.as_str(), error = %e, "inbound handler failed");
        }
    }

    /// Notify the peer (bounded by `notify_timeout`), close the link and stop
    /// every timer. Further connects are refused.
    pub async fn shutdown(&self, notify_timeout: Duration) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();

        let health = match self.inner.health_task.lock() {
            Ok(mut s) => s.take(),
            Err(p) => p.into_inner().take(),
        };
        if let Some(task) = health {
            task.abort();
        }

        let writer = {
            let mut st = self.lock();
            if let Some(timer) = st.reconnect_task.take() {
                timer.abort();
            }
            let generation = st.generation;
            st.current_writer(generation)
        };

        if let Some(writer) = writer {
            let notice = OutboundMessage::new(
                OutboundKind::Disconnect,
                json!({ "reason": "shutdown" }),
                Priority::High,
            );
            match transmit(writer.as_ref(), &notice, notify_timeout).await {
                Ok(()) => debug!("disconnect notice sent"),
                Err(e) => warn!(error = %e, "disconnect notice failed"),
            }
            if tokio::time::timeout(notify_timeout, writer.close())
                .await
                .is_err()
            {
                debug!("close handshake timed out");
            }
        }

        self.lock().teardown();
        info!("connection manager stopped");
    }

    /// React to a failed or closed link of `generation`.
    fn handle_link_down(&self, generation: u64, reason: &str) {
        let mut st = self.lock();
        if st.generation != generation {
            debug!(reason, "ignoring signal from a replaced link");
            return;
        }

        let in_grace = st.phase == Phase::Connected
            && st
                .connection_started_at
                .is_some_and(|started| started.elapsed() < self.inner.policy.grace_window);

        warn!(reason, in_grace, "link down");
        st.teardown();

        if self.inner.shutdown.is_cancelled() {
            return;
        }
        if in_grace {
            st.reconnect_attempts = st.reconnect_attempts.saturating_add(GRACE_PENALTY);
        }
        self.schedule_reconnect(&mut st);
    }

    fn schedule_reconnect(&self, st: &mut ConnectionState) {
        if st.reconnect_task.is_some() {
            return;
        }

        st.reconnect_attempts = st.reconnect_attempts.saturating_add(1);
        let step = self.inner.policy.next_step(st.reconnect_attempts);
        match step {
            ReconnectStep::Backoff { attempt, delay } => {
                info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
            }
            ReconnectStep::Cooldown { delay } => {
                warn!(
                    max_attempts = self.inner.policy.max_attempts,
                    cooldown_secs = delay.as_secs(),
                    "reconnect attempts exhausted, cooling down"
                );
                st.reconnect_attempts = 0;
            }
        }

        let this = self.clone();
        let delay = step.delay();
        st.reconnect_task = Some(tokio::spawn(async move {
            tokio::select! {
                _ = this.inner.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            this.lock().reconnect_task = None;
            if let Err(e) = this.connect().await {
                debug!(error = %e, "reconnect attempt failed");
            }
        }));
    }

    async fn flush_pending(&self, generation: u64) {
        let queued = {
            let mut st = self.lock();
            if st.generation != generation {
                return;
            }
            st.pending.drain()
        };
        if queued.is_empty() {
            return;
        }
        info!(count = queued.len(), "flushing pending messages");

        let mut remaining = queued.into_iter();
        while let Some(message) = remaining.next() {
            let writer = self.lock().current_writer(generation);
            let failure = match writer {
                Some(writer) => transmit(writer.as_ref(), &message, self.inner.send_timeout)
                    .await
                    .err(),
                None => Some(AgentError::Connection("link replaced during flush".to_owned())),
            };
            if let Some(e) = failure {
                warn!(kind = %message.kind, error = %e, "flush interrupted");
                let unsent: Vec<OutboundMessage> = std::iter::once(message)
                    .chain(remaining)
                    .filter(|m| m.priority == Priority::High)
                    .collect();
                self.handle_link_down(generation, &format!("flush failed: {e}"));
                self.lock().pending.requeue_front(unsent);
                return;
            }
        }
    }

    async fn read_loop(self, generation: u64, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        // Frames are handled one at a time in arrival order. The dispatcher is
        // detached from the link so a handler that replaces the link is not
        // aborted halfway; it exits once this loop drops the sender.
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.dispatch_loop(inbound_rx).await });

        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Message(text) => {
                    if inbound_tx.send(text).is_err() {
                        debug!("inbound dispatcher gone, dropping frame");
                    }
                }
                TransportEvent::Error(e) => {
                    self.handle_link_down(generation, &format!("transport error: {e}"));
                    return;
                }
                TransportEvent::Closed(reason) => {
                    let reason = reason.unwrap_or_else(|| "closed by peer".to_owned());
                    self.handle_link_down(generation, &reason);
                    return;
                }
            }
        }
        self.handle_link_down(generation, "transport event stream ended");
    }

    async fn dispatch_loop(self, mut inbound: mpsc::UnboundedReceiver<String>) {
        while let Some(text) = inbound.recv().await {
            self.dispatch(&text).await;
        }
    }

    async fn ping_loop(self, generation: u64) {
        let period = self.inner.ping_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if self.lock().current_writer(generation).is_none() {
                return;
            }
            self.send(OutboundKind::Ping, json!({}), Priority::Low).await;
        }
    }

    async fn health_loop(self) {
        let period = self.inner.health_check_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            self.check_health().await;
        }
    }
}

/// Write one frame, giving up after `limit`. A timeout is reported like any
/// other send failure so the caller drops the link.
async fn transmit(
    writer: &dyn LinkWriter,
    message: &OutboundMessage,
    limit: Duration,
) -> Result<()> {
    let json = message.to_json()?;
    match tokio::time::timeout(limit, writer.send(json)).await {
        Ok(sent) => sent,
        Err(_) => Err(AgentError::Connection(format!(
            "send of {} timed out after {}ms",
            message.kind,
            limit.as_millis()
        ))),
    }
}

fn hold_or_drop(pending: &mut PendingQueue, message: OutboundMessage) -> SendOutcome {
    match message.priority {
        Priority::High => {
            debug!(kind = %message.kind, "not connected, queueing message");
            pending.push(message);
            SendOutcome::Queued
        }
        Priority::Normal => {
            warn!(kind = %message.kind, "not connected, dropping message");
            SendOutcome::Dropped
        }
        Priority::Low => {
            debug!(kind = %message.kind, "not connected, dropping message");
            SendOutcome::Dropped
        }
    }
}
