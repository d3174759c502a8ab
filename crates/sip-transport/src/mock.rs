//! In-memory transport for tests
//!
//! `MockTransport` implements [`Transport`] without a socket: messages the
//! client sends are captured on a channel the test drains, and the test
//! injects server messages through the paired [`MockTransportHandle`].
//! Integration tests in client-core script entire SIP exchanges this way.

use crate::error::{TransportError, TransportResult};
use crate::transport::{
    Transport, TransportEvent, TransportFactory, TransportOptions, TransportState,
};
use async_trait::async_trait;
use softline_sip_core::Message;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Test-side control handle for a [`MockTransport`].
#[derive(Clone)]
pub struct MockTransportHandle {
    event_tx: mpsc::Sender<TransportEvent>,
    sent_rx: Arc<Mutex<mpsc::UnboundedReceiver<Message>>>,
    connected: Arc<AtomicBool>,
}

impl MockTransportHandle {
    /// Deliver a message as if the server sent it.
    pub async fn inject(&self, message: Message) {
        let _ = self
            .event_tx
            .send(TransportEvent::IncomingMessage(Box::new(message)))
            .await;
    }

    /// Simulate a server-side disconnect.
    pub async fn drop_connection(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self
            .event_tx
            .send(TransportEvent::Disconnected {
                reason: reason.to_string(),
            })
            .await;
    }

    /// Next message the client sent, waiting up to `timeout`.
    pub async fn next_sent(&self, timeout: std::time::Duration) -> Option<Message> {
        let mut rx = self.sent_rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    /// Drain any already-captured messages without waiting.
    pub async fn drain_sent(&self) -> Vec<Message> {
        let mut rx = self.sent_rx.lock().await;
        let mut drained = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            drained.push(msg);
        }
        drained
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// A [`Transport`] that never touches the network.
pub struct MockTransport {
    sent_tx: mpsc::UnboundedSender<Message>,
    event_tx: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
    description: String,
}

impl MockTransport {
    /// Create a connected mock transport, its event stream, and the test
    /// handle. A `Connected` event is already queued.
    pub fn connected(
        description: &str,
    ) -> (
        Arc<Self>,
        mpsc::Receiver<TransportEvent>,
        MockTransportHandle,
    ) {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));

        let transport = Arc::new(MockTransport {
            sent_tx,
            event_tx: event_tx.clone(),
            connected: connected.clone(),
            description: description.to_string(),
        });
        let handle = MockTransportHandle {
            event_tx: event_tx.clone(),
            sent_rx: Arc::new(Mutex::new(sent_rx)),
            connected,
        };

        let _ = event_tx.try_send(TransportEvent::Connected);
        (transport, event_rx, handle)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, message: Message) -> TransportResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.sent_tx
            .send(message)
            .map_err(|_| TransportError::NotConnected)
    }

    async fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self
                .event_tx
                .send(TransportEvent::Disconnected {
                    reason: "closed locally".to_string(),
                })
                .await;
        }
    }

    fn state(&self) -> TransportState {
        if self.connected.load(Ordering::SeqCst) {
            TransportState::Connected
        } else {
            TransportState::Disconnected
        }
    }

    fn description(&self) -> String {
        self.description.clone()
    }
}

/// Factory handing out pre-built mocks, one per `connect` call.
///
/// Tests that exercise reconnection push several mocks; each connect pops
/// the next. Connecting with an empty queue fails, which is how tests
/// simulate an unreachable server.
pub struct MockTransportFactory {
    queue: Mutex<Vec<(Arc<MockTransport>, mpsc::Receiver<TransportEvent>)>>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        MockTransportFactory {
            queue: Mutex::new(Vec::new()),
        }
    }

    /// Queue a transport for the next `connect` call and return its handle.
    pub async fn push(&self, description: &str) -> MockTransportHandle {
        let (transport, events, handle) = MockTransport::connected(description);
        self.queue.lock().await.insert(0, (transport, events));
        handle
    }
}

impl Default for MockTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn connect(
        &self,
        _url: &str,
        _options: &TransportOptions,
    ) -> TransportResult<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>)> {
        match self.queue.lock().await.pop() {
            Some((transport, events)) => Ok((transport as Arc<dyn Transport>, events)),
            None => Err(TransportError::ConnectFailed {
                reason: "no mock transport queued".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use softline_sip_core::{Method, Request, SipUri};

    #[tokio::test]
    async fn captures_sent_messages() {
        let (transport, _events, handle) = MockTransport::connected("mock");
        let req = Request::new(Method::Options, SipUri::domain("pbx.example.com"));
        transport.send(req.into()).await.unwrap();
        let sent = handle
            .next_sent(std::time::Duration::from_millis(100))
            .await
            .unwrap();
        assert!(matches!(sent, Message::Request(_)));
    }

    #[tokio::test]
    async fn injected_messages_reach_the_event_stream() {
        let (_transport, mut events, handle) = MockTransport::connected("mock");
        // First event is Connected.
        assert!(matches!(events.recv().await, Some(TransportEvent::Connected)));
        let req = Request::new(Method::Options, SipUri::domain("pbx.example.com"));
        handle.inject(req.into()).await;
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::IncomingMessage(_))
        ));
    }

    #[tokio::test]
    async fn send_after_drop_fails() {
        let (transport, _events, handle) = MockTransport::connected("mock");
        handle.drop_connection("network gone").await;
        let req = Request::new(Method::Options, SipUri::domain("pbx.example.com"));
        assert!(transport.send(req.into()).await.is_err());
    }
}
