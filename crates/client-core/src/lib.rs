//! softline-client-core: the multi-line SIP softphone core
//!
//! A contact-center softphone distilled to its engine: one WebSocket SIP
//! transport, one registration, up to three concurrent call sessions with
//! line semantics, busy-lamp-field presence, probe-driven connectivity
//! classification with automatic recovery, and locale-aware call-progress
//! tones.
//!
//! Components are wired by explicit construction and communicate over one
//! typed event bus — the [`events::EventBus`] — which is also the embedder
//! surface: subscribe to it and render whatever arrives.
//!
//! ```rust,no_run
//! use softline_client_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SipConfig::new("pbx.example.com", "1001", "secret", "pbx.example.com");
//! let client = SoftphoneClient::new(config);
//! let mut events = client.subscribe();
//!
//! client.create_user_agent().await?;
//! // ... registration happens automatically; place a call:
//! let session = client.make_call("2000", CallOptions::default()).await?;
//! client.send_dtmf(&session, '5').await?;
//! client.hangup_call(Some(session)).await?;
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod audio;
pub mod blf;
pub mod call;
pub mod client;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod events;
pub mod lines;
pub mod media;
pub mod recovery;

pub use blf::{BlfState, BlfSubscription};
pub use call::{
    CallDirection, CallHistoryRecord, CallInfo, CallOutcome, CallState, CallStats, CallType,
    SessionId, LINE_COUNT,
};
pub use client::calls::CallOptions;
pub use client::{SoftphoneClient, SoftphoneClientBuilder};
pub use config::{BundlePolicy, IceServer, MediaConfig, RtcpMuxPolicy, SipConfig, SipConfigPatch};
pub use connectivity::{ConnectivityMonitor, ConnectivitySnapshot, InternetStatus, MonitorConfig};
pub use error::{ClientError, ClientResult};
pub use events::{ClientEvent, ClientEventHandler, EventBus, RegistrationState};
pub use lines::{CallCommands, LineManager, LineState, LineStatus};
pub use recovery::{RecoveryConfig, RecoveryController, RecoveryTarget};

/// The common imports for embedders.
pub mod prelude {
    pub use crate::adapters::{ContactsDirectory, PhantomApi, Preferences};
    pub use crate::audio::{AudioService, ToneEngine, ToneLocale};
    pub use crate::blf::BlfState;
    pub use crate::call::{CallDirection, CallInfo, CallState, SessionId};
    pub use crate::client::calls::CallOptions;
    pub use crate::client::{SoftphoneClient, SoftphoneClientBuilder};
    pub use crate::config::{MediaConfig, SipConfig};
    pub use crate::connectivity::{ConnectivityMonitor, MonitorConfig};
    pub use crate::error::{ClientError, ClientResult};
    pub use crate::events::{ClientEvent, EventBus, RegistrationState};
    pub use crate::lines::LineManager;
    pub use crate::recovery::RecoveryController;
}
