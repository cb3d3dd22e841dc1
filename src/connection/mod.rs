//! Aggregator connectivity.
//!
//! One logical duplex link, kept alive across disconnects with jittered
//! exponential backoff, a liveness ping and an independent health check.
//! Outbound messages carry a priority; only high-priority ones are held for
//! replay while the link is down. Inbound messages are dispatched by type to
//! registered handlers.

pub mod backoff;
pub mod manager;
pub mod protocol;
pub mod queue;
pub mod transport;

pub use backoff::{ReconnectPolicy, ReconnectStep};
pub use manager::{
    ConnectionManager, ConnectionStatus, InboundHandler, NodeIdentity, Phase, SendOutcome,
};
pub use protocol::{InboundKind, InboundMessage, OutboundKind, OutboundMessage, Priority};
pub use queue::PendingQueue;
pub use transport::{LinkWriter, Transport, TransportEvent, TransportLink, WebSocketTransport};
