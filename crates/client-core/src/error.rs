//! Error handling for softphone operations
//!
//! Every public operation rejects with one of these kinds, and the same
//! failure is mirrored onto the event bus as a scoped `*Failed` event so UI
//! and programmatic callers do not have to double-handle.

use crate::call::CallState;
use softline_sip_transport::TransportError;
use thiserror::Error;

/// Errors surfaced by the softphone core.
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// Configuration is missing or malformed; `field` names the offender.
    #[error("invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    /// A SIP URI could not be built from the given input.
    #[error("could not build SIP URI from {input:?}")]
    UriBuildFailed { input: String },

    /// The transport could not be started.
    #[error("transport start failed: {reason}")]
    TransportStartFailed { reason: String },

    /// The operation requires an active registration.
    #[error("not registered with server")]
    NotRegistered,

    /// All three lines carry a live session.
    #[error("all lines busy")]
    AllLinesBusy,

    /// The dial target is empty or unusable.
    #[error("invalid call target {target:?}")]
    InvalidTarget { target: String },

    /// No live session matches the given id.
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    /// The session exists but is not in `established` state.
    #[error("session {session_id} not established (state: {state:?})")]
    SessionNotEstablished {
        session_id: String,
        state: CallState,
    },

    /// A DTMF character outside `[0-9A-D*#]`.
    #[error("invalid DTMF tone {tone:?}")]
    InvalidTone { tone: char },

    /// The media session cannot emit RFC 4733 telephone events.
    #[error("DTMF not supported by the media session")]
    DtmfUnsupported,

    /// The far end rejected a REFER.
    #[error("transfer rejected: {reason}")]
    TransferRejected { reason: String },

    /// A BLF SUBSCRIBE failed.
    #[error("subscribe failed for {extension}: {reason}")]
    SubscribeFailed { extension: String, reason: String },

    /// A connectivity probe did not complete within its bound.
    #[error("probe timed out: {target}")]
    ProbeTimeout { target: String },

    /// Registration was refused or never answered.
    #[error("registration failed: {reason}")]
    RegistrationFailed { reason: String },

    /// A request was sent but no final response arrived in time.
    #[error("operation timed out: {operation}")]
    OperationTimeout { operation: String },

    /// Transport-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A malformed message or protocol violation from the peer.
    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    /// The media layer failed.
    #[error("media error: {reason}")]
    Media { reason: String },

    /// A bug or impossible state.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl From<softline_sip_core::Error> for ClientError {
    fn from(e: softline_sip_core::Error) -> Self {
        ClientError::Protocol {
            reason: e.to_string(),
        }
    }
}

impl ClientError {
    /// Whether retrying the same operation later can reasonably succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ClientError::Transport(_)
                | ClientError::TransportStartFailed { .. }
                | ClientError::OperationTimeout { .. }
                | ClientError::ProbeTimeout { .. }
                | ClientError::RegistrationFailed { .. }
                | ClientError::SubscribeFailed { .. }
        )
    }

    /// Coarse grouping used in log fields and failure events.
    pub fn category(&self) -> &'static str {
        match self {
            ClientError::InvalidConfig { .. } => "configuration",
            ClientError::UriBuildFailed { .. } | ClientError::InvalidTarget { .. } => "addressing",
            ClientError::TransportStartFailed { .. } | ClientError::Transport(_) => "transport",
            ClientError::NotRegistered | ClientError::RegistrationFailed { .. } => "registration",
            ClientError::AllLinesBusy
            | ClientError::SessionNotFound { .. }
            | ClientError::SessionNotEstablished { .. } => "session",
            ClientError::InvalidTone { .. } | ClientError::DtmfUnsupported => "dtmf",
            ClientError::TransferRejected { .. } => "transfer",
            ClientError::SubscribeFailed { .. } => "presence",
            ClientError::ProbeTimeout { .. } => "connectivity",
            ClientError::OperationTimeout { .. } => "timeout",
            ClientError::Protocol { .. } => "protocol",
            ClientError::Media { .. } => "media",
            ClientError::Internal { .. } => "internal",
        }
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverability() {
        assert!(ClientError::OperationTimeout {
            operation: "register".into()
        }
        .is_recoverable());
        assert!(!ClientError::AllLinesBusy.is_recoverable());
        assert!(!ClientError::InvalidTone { tone: 'x' }.is_recoverable());
    }

    #[test]
    fn categories() {
        assert_eq!(ClientError::NotRegistered.category(), "registration");
        assert_eq!(ClientError::DtmfUnsupported.category(), "dtmf");
    }
}
