//! SIP transport layer for the softline stack
//!
//! One transport flavor is supported: SIP over WebSocket (RFC 7118) with
//! the `sip` sub-protocol, which is what the PBXs this stack targets
//! expose to browser and headless clients alike. The [`Transport`] trait
//! keeps the client decoupled from the socket so tests can substitute the
//! in-memory [`mock::MockTransport`].

pub mod error;
pub mod transport;
pub mod ws;
pub mod mock;

pub use error::{TransportError, TransportResult};
pub use transport::{
    Transport, TransportEvent, TransportFactory, TransportOptions, TransportState,
};
pub use ws::{build_ws_url, WebSocketTransport, WsTransportFactory};
