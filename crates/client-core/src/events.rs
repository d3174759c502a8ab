//! The typed event bus
//!
//! The bus is the only cross-component channel in the core: the session
//! core publishes, and the line manager, audio service, recovery controller
//! and any embedder UI subscribe. Delivery is FIFO per subscriber, so a
//! handler can never observe `SessionAnswered` before `SessionCreated` for
//! the same id.

use crate::blf::BlfState;
use crate::call::{CallDirection, CallHistoryRecord, CallInfo, CallState, SessionId};
use crate::connectivity::ConnectivitySnapshot;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use softline_sip_core::bodies::message_summary::MessageSummary;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

/// Registration lifecycle, published monotonically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
    Unregistering,
    Failed,
}

/// Transport lifecycle as seen by subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Hold-related session modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HoldAction {
    Hold,
    Unhold,
}

/// Progress of a consultation call during attended transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendedTransferStatus {
    Trying,
    Ringing,
    Answered,
    Rejected,
    Terminated,
}

/// Payload of a NOTIFY forwarded on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NotifyBody {
    /// `Event: message-summary` voicemail indication.
    Voicemail { summary: MessageSummary },
    /// Anything the core does not interpret, forwarded raw.
    Raw {
        content_type: Option<String>,
        body: String,
    },
}

/// The stable event set exported by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientEvent {
    TransportStateChanged {
        state: TransportStatus,
    },
    TransportConnected,
    TransportDisconnected {
        reason: String,
    },
    TransportError {
        reason: String,
    },
    RegistrationStateChanged {
        state: RegistrationState,
    },
    Registered,
    Unregistered,
    RegistrationFailed {
        reason: String,
    },
    SessionCreated {
        session: CallInfo,
    },
    IncomingCall {
        session: CallInfo,
    },
    SessionStateChanged {
        session_id: SessionId,
        line: u8,
        state: CallState,
    },
    SessionAnswered {
        session_id: SessionId,
        line: u8,
    },
    SessionTerminated {
        session_id: SessionId,
        line: u8,
        direction: CallDirection,
        reason: String,
    },
    SessionModified {
        session_id: SessionId,
        action: HoldAction,
    },
    SessionMuted {
        session_id: SessionId,
        muted: bool,
    },
    SessionDurationChanged {
        session_id: SessionId,
        line: u8,
        seconds: u64,
    },
    DtmfSent {
        session_id: SessionId,
        tone: char,
    },
    LineSelected {
        line: u8,
    },
    LineReleased {
        line: u8,
    },
    BlfSubscribed {
        extension: String,
    },
    BlfUnsubscribed {
        extension: String,
    },
    BlfStateChanged {
        extension: String,
        state: BlfState,
        remote_target: Option<String>,
    },
    BlfSubscriptionFailed {
        extension: String,
        reason: String,
    },
    MessageReceived {
        from: String,
        body: String,
    },
    NotifyReceived {
        event: String,
        body: NotifyBody,
    },
    TransferInitiated {
        session_id: SessionId,
        target: String,
    },
    TransferCompleted {
        session_id: SessionId,
        success: bool,
        reason: Option<String>,
    },
    AttendedTransferInitiated {
        session_id: SessionId,
        transfer_session_id: SessionId,
        target: String,
        status: AttendedTransferStatus,
    },
    AttendedTransferProgress {
        session_id: SessionId,
        transfer_session_id: SessionId,
        status: AttendedTransferStatus,
    },
    AttendedTransferAnswered {
        session_id: SessionId,
        transfer_session_id: SessionId,
    },
    AttendedTransferRejected {
        session_id: SessionId,
        transfer_session_id: SessionId,
        reason: String,
    },
    AttendedTransferTerminated {
        session_id: SessionId,
        transfer_session_id: SessionId,
    },
    AttendedTransferCompleted {
        session_id: SessionId,
        transfer_session_id: SessionId,
    },
    AttendedTransferCancelled {
        session_id: SessionId,
    },
    ConnectivityChanged {
        snapshot: ConnectivitySnapshot,
    },
    NetworkPathChanged {
        signature: String,
    },
    CallHistory {
        record: CallHistoryRecord,
    },
}

/// Push-style consumer, for embedders that prefer callbacks over draining
/// a broadcast receiver.
#[async_trait]
pub trait ClientEventHandler: Send + Sync {
    async fn on_event(&self, event: ClientEvent);
}

/// The shared pub/sub bus.
///
/// A thin wrapper over a tokio broadcast channel; emitting never blocks and
/// never fails (lagging subscribers drop their oldest events, which only
/// affects that subscriber).
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ClientEvent) {
        trace!(?event, "bus emit");
        let _ = self.tx.send(event);
    }

    /// Pump events into a push-style handler until the bus is dropped.
    pub fn attach_handler(&self, handler: Arc<dyn ClientEventHandler>) -> tokio::task::JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => handler.on_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_delivery_per_subscriber() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.emit(ClientEvent::TransportConnected);
        bus.emit(ClientEvent::Registered);
        assert!(matches!(rx.recv().await, Ok(ClientEvent::TransportConnected)));
        assert!(matches!(rx.recv().await, Ok(ClientEvent::Registered)));
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.emit(ClientEvent::TransportConnected);
    }

    #[test]
    fn events_serialize() {
        let event = ClientEvent::LineSelected { line: 2 };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("lineSelected"));
    }
}
