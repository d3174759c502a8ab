//! Transport error types

use thiserror::Error;

/// Errors surfaced by the transport layer.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// The server URL could not be turned into a WebSocket request.
    #[error("invalid transport URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The WebSocket connection could not be established.
    #[error("connection failed: {reason}")]
    ConnectFailed { reason: String },

    /// Connecting took longer than the configured bound.
    #[error("connection timed out after {timeout_ms}ms")]
    ConnectTimeout { timeout_ms: u64 },

    /// A send was attempted on a transport that is not connected.
    #[error("transport not connected")]
    NotConnected,

    /// A frame could not be written to the socket.
    #[error("send failed: {reason}")]
    SendFailed { reason: String },

    /// The keep-alive probe failed more times in a row than allowed.
    #[error("keep-alive failed {failures} consecutive times")]
    KeepAliveFailed { failures: u32 },
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;
