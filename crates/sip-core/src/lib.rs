//! SIP protocol model for the softline softphone stack
//!
//! This crate provides the message-level building blocks the rest of the
//! stack signs, sends and parses: methods, status codes, URIs, addresses,
//! headers, digest authentication, a minimal audio-only SDP model, and the
//! NOTIFY body formats a busy-lamp-field client has to understand
//! (`application/dialog-info+xml` and `message-summary`).
//!
//! The model is deliberately scoped to what a WebSocket softphone needs.
//! Unknown headers are carried verbatim rather than rejected, so messages
//! survive a parse/serialize round trip even when a server adds headers we
//! do not interpret.

pub mod error;
pub mod types;
pub mod message;
pub mod builder;
pub mod parser;
pub mod sdp;
pub mod bodies;
pub mod auth;

pub use error::{Error, Result};
pub use types::method::Method;
pub use types::status::StatusCode;
pub use types::uri::SipUri;
pub use types::address::Address;
pub use types::header::{Header, HeaderName, Headers, CSeq};
pub use message::{Message, Request, Response};
pub use builder::{RequestBuilder, ResponseBuilder};
pub use parser::parse_message;
pub use sdp::{MediaDirection, SessionDescription};
pub use auth::{DigestChallenge, DigestCredentials};

/// Everything most callers need in one import.
pub mod prelude {
    pub use crate::{
        Address, CSeq, Header, HeaderName, Headers, Message, MediaDirection, Method, Request,
        RequestBuilder, Response, ResponseBuilder, SessionDescription, SipUri, StatusCode,
    };
    pub use crate::bodies::dialog_info::{DialogInfo, DialogState};
    pub use crate::bodies::message_summary::MessageSummary;
}
