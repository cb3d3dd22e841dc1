//! Duplex message transport.
//!
//! A [`Transport`] opens one link at a time. An opened link is split into a
//! writer handle and a stream of [`TransportEvent`]s produced by a background
//! reader; the connection manager owns both.

use crate::error::{AgentError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// Signals produced by an open link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame from the peer.
    Message(String),
    /// The link failed; no further events follow.
    Error(String),
    /// The peer closed the link; no further events follow.
    Closed(Option<String>),
}

/// Write half of an open link.
#[async_trait]
pub trait LinkWriter: Send + Sync {
    async fn send(&self, text: String) -> Result<()>;

    /// Graceful close.
    async fn close(&self);

    /// Hard close without a handshake. Never blocks.
    fn terminate(&self);
}

/// An opened link.
pub struct TransportLink {
    pub writer: Arc<dyn LinkWriter>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens links to the aggregator.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Resolves once the link is open.
    async fn open(&self, url: &str) -> Result<TransportLink>;
}

/// WebSocket transport backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, tokio_tungstenite::tungstenite::Message>;

struct WsWriter {
    sink: tokio::sync::Mutex<WsSink>,
    reader: tokio::task::AbortHandle,
    closed: AtomicBool,
}

#[async_trait]
impl LinkWriter for WsWriter {
    async fn send(&self, text: String) -> Result<()> {
        use futures_util::SinkExt;
        use tokio_tungstenite::tungstenite::Message;

        if self.closed.load(Ordering::Acquire) {
            return Err(AgentError::Connection("link is closed".to_owned()));
        }
        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| AgentError::Connection(format!("send: {e}")))
    }

    async fn close(&self) {
        use futures_util::SinkExt;

        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.sink.lock().await.close().await {
            tracing::debug!("websocket close handshake failed: {e}");
        }
    }

    fn terminate(&self) {
        self.closed.store(true, Ordering::Release);
        self.reader.abort();
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &str) -> Result<TransportLink> {
        use futures_util::StreamExt;
        use tokio_tungstenite::{connect_async, tungstenite::Message};

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| AgentError::Connection(format!("connect {url}: {e}")))?;

        let (write, mut read) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let event = match frame {
                    Ok(Message::Text(text)) => TransportEvent::Message(text),
                    Ok(Message::Close(frame)) => {
                        TransportEvent::Closed(frame.map(|f| f.reason.into_owned()))
                    }
                    Ok(_) => continue, // Binary, Ping/Pong frames handled by tungstenite.
                    Err(e) => TransportEvent::Error(e.to_string()),
                };
                let terminal = !matches!(event, TransportEvent::Message(_));
                if tx.send(event).is_err() || terminal {
                    return;
                }
            }
            let _ = tx.send(TransportEvent::Closed(None));
        });

        let writer = WsWriter {
            sink: tokio::sync::Mutex::new(write),
            reader: reader.abort_handle(),
            closed: AtomicBool::new(false),
        };

        Ok(TransportLink {
            writer: Arc::new(writer),
            events: rx,
        })
    }
}
