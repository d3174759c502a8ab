//! Error types for SIP message handling

use thiserror::Error;

/// Errors produced while building or parsing SIP messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The input could not be parsed as a SIP message.
    #[error("invalid SIP message: {reason}")]
    InvalidMessage { reason: String },

    /// A URI string could not be parsed.
    #[error("invalid SIP URI: {input}")]
    InvalidUri { input: String },

    /// A header value could not be parsed into its typed form.
    #[error("invalid {name} header: {value}")]
    InvalidHeader { name: String, value: String },

    /// A required header is missing from the message.
    #[error("missing {name} header")]
    MissingHeader { name: String },

    /// An SDP body could not be parsed.
    #[error("invalid SDP: {reason}")]
    InvalidSdp { reason: String },

    /// A NOTIFY body could not be parsed.
    #[error("invalid {content_type} body: {reason}")]
    InvalidBody {
        content_type: String,
        reason: String,
    },

    /// A digest challenge was malformed or used an unsupported scheme.
    #[error("invalid authentication challenge: {reason}")]
    InvalidChallenge { reason: String },
}

impl Error {
    pub(crate) fn message(reason: impl Into<String>) -> Self {
        Error::InvalidMessage {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
