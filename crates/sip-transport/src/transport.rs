//! The transport abstraction shared by the real and mock transports

use crate::error::TransportResult;
use async_trait::async_trait;
use softline_sip_core::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events pushed by a transport to its single consumer.
///
/// The receiver is handed out exactly once, at construction; the session
/// core owns it for the life of the transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// The socket is open and the SIP sub-protocol was accepted.
    Connected,
    /// The socket closed; `reason` is a human-readable cause.
    Disconnected { reason: String },
    /// A complete SIP message arrived.
    IncomingMessage(Box<Message>),
    /// Keep-alive probes exceeded the failure budget. A `Disconnected`
    /// event follows once the socket is torn down.
    KeepAliveTimeout,
    /// A non-fatal transport-level error (e.g. an unparseable frame).
    Error { reason: String },
}

/// Tunables applied when establishing a transport.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Interval between CRLF keep-alive probes.
    pub keep_alive_interval: Duration,
    /// Consecutive probe failures tolerated before the link is declared
    /// dead.
    pub keep_alive_max_failures: u32,
    /// Bound on connection establishment.
    pub connect_timeout: Duration,
    /// Log every SIP message at debug level.
    pub trace: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        TransportOptions {
            keep_alive_interval: Duration::from_secs(20),
            keep_alive_max_failures: 3,
            connect_timeout: Duration::from_secs(10),
            trace: false,
        }
    }
}

/// A connected SIP transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Serialize and send one SIP message.
    async fn send(&self, message: Message) -> TransportResult<()>;

    /// Close the transport. Idempotent; emits `Disconnected` once.
    async fn close(&self);

    fn state(&self) -> TransportState;

    /// The URL or description this transport is connected to.
    fn description(&self) -> String;
}

/// Factory used by the session core to (re)establish its transport, and by
/// tests to substitute mocks.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        options: &TransportOptions,
    ) -> TransportResult<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>)>;
}
