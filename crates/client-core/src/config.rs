//! Softphone configuration
//!
//! A [`SipConfig`] is immutable once a user agent has been created; changing
//! it requires `stop` + `create_user_agent`. Partial reconfiguration merges
//! a [`SipConfigPatch`] whose unknown keys are rejected at deserialization.

use crate::error::{ClientError, ClientResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// An ICE server entry handed to the media layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        IceServer {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundlePolicy {
    Balanced,
    MaxBundle,
    MaxCompat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RtcpMuxPolicy {
    Require,
    Negotiate,
}

/// Media negotiation settings passed through to the media factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MediaConfig {
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServer>,
    #[serde(default = "default_bundle_policy")]
    pub bundle_policy: BundlePolicy,
    #[serde(default = "default_rtcp_mux_policy")]
    pub rtcp_mux_policy: RtcpMuxPolicy,
    /// Bound on ICE candidate gathering before the offer goes out anyway.
    #[serde(default = "default_ice_gathering_timeout")]
    pub ice_gathering_timeout: Duration,
}

fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer::stun("stun:stun.l.google.com:19302")]
}

fn default_bundle_policy() -> BundlePolicy {
    BundlePolicy::Balanced
}

fn default_rtcp_mux_policy() -> RtcpMuxPolicy {
    RtcpMuxPolicy::Require
}

fn default_ice_gathering_timeout() -> Duration {
    Duration::from_millis(2000)
}

impl Default for MediaConfig {
    fn default() -> Self {
        MediaConfig {
            ice_servers: default_ice_servers(),
            bundle_policy: default_bundle_policy(),
            rtcp_mux_policy: default_rtcp_mux_policy(),
            ice_gathering_timeout: default_ice_gathering_timeout(),
        }
    }
}

/// Full softphone configuration.
///
/// # Examples
///
/// ```rust
/// use softline_client_core::config::SipConfig;
///
/// let config = SipConfig::new("pbx.example.com", "1001", "secret", "pbx.example.com")
///     .with_register_ttl(600)
///     .with_auto_answer(false);
/// assert_eq!(config.register_ttl, 600);
/// assert_eq!(config.effective_display_name(), "1001-365Connect");
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SipConfig {
    /// Bare host (`pbx.example.com`), `host:port`, or a literal
    /// `ws://`/`wss://` URL.
    pub server_url: String,
    pub username: String,
    pub password: String,
    pub domain: String,
    /// Display name in From headers; defaults to `"{username}-365Connect"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Contact user part; defaults to `username`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_name: Option<String>,
    /// REGISTER expiry in seconds.
    #[serde(default = "default_register_ttl")]
    pub register_ttl: u32,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default = "default_keep_alive_interval")]
    pub keep_alive_interval: Duration,
    #[serde(default = "default_keep_alive_max_failures")]
    pub keep_alive_max_failures: u32,
    /// Outgoing calls never answered within this window are cancelled.
    #[serde(default = "default_no_answer_timeout")]
    pub no_answer_timeout: Duration,
    /// Log every SIP message at trace level.
    #[serde(default)]
    pub trace_sip: bool,
    /// Subscribe busy-lamp-field extensions after registration.
    #[serde(default = "default_true")]
    pub enable_blf: bool,
    /// Auto-accept incoming calls after 1.5 s when no other call is active.
    #[serde(default)]
    pub auto_answer: bool,
}

fn default_register_ttl() -> u32 {
    300
}

fn default_keep_alive_interval() -> Duration {
    Duration::from_secs(20)
}

fn default_keep_alive_max_failures() -> u32 {
    3
}

fn default_no_answer_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_true() -> bool {
    true
}

impl SipConfig {
    pub fn new(
        server_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        SipConfig {
            server_url: server_url.into(),
            username: username.into(),
            password: password.into(),
            domain: domain.into(),
            display_name: None,
            contact_name: None,
            register_ttl: default_register_ttl(),
            media: MediaConfig::default(),
            keep_alive_interval: default_keep_alive_interval(),
            keep_alive_max_failures: default_keep_alive_max_failures(),
            no_answer_timeout: default_no_answer_timeout(),
            trace_sip: false,
            enable_blf: true,
            auto_answer: false,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_contact_name(mut self, name: impl Into<String>) -> Self {
        self.contact_name = Some(name.into());
        self
    }

    pub fn with_register_ttl(mut self, seconds: u32) -> Self {
        self.register_ttl = seconds;
        self
    }

    pub fn with_media(mut self, media: MediaConfig) -> Self {
        self.media = media;
        self
    }

    pub fn with_no_answer_timeout(mut self, timeout: Duration) -> Self {
        self.no_answer_timeout = timeout;
        self
    }

    pub fn with_auto_answer(mut self, auto_answer: bool) -> Self {
        self.auto_answer = auto_answer;
        self
    }

    pub fn with_blf(mut self, enable: bool) -> Self {
        self.enable_blf = enable;
        self
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace_sip = trace;
        self
    }

    /// Display name used in From headers.
    pub fn effective_display_name(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| format!("{}-365Connect", self.username))
    }

    /// User part of the Contact URI.
    pub fn effective_contact_name(&self) -> &str {
        self.contact_name.as_deref().unwrap_or(&self.username)
    }

    /// Check the fields a user agent cannot start without.
    pub fn validate(&self) -> ClientResult<()> {
        for (field, value) in [
            ("server_url", &self.server_url),
            ("username", &self.username),
            ("domain", &self.domain),
        ] {
            if value.trim().is_empty() {
                return Err(ClientError::InvalidConfig {
                    field: field.to_string(),
                    reason: "must not be empty".to_string(),
                });
            }
        }
        if self.register_ttl == 0 {
            return Err(ClientError::InvalidConfig {
                field: "register_ttl".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Merge a partial reconfiguration. Does not restart anything; the new
    /// values take effect on the next `create_user_agent`.
    pub fn apply(&mut self, patch: SipConfigPatch) {
        macro_rules! merge {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = patch.$field { self.$field = value; })*
            };
        }
        merge!(
            server_url,
            username,
            password,
            domain,
            register_ttl,
            media,
            keep_alive_interval,
            keep_alive_max_failures,
            no_answer_timeout,
            trace_sip,
            enable_blf,
            auto_answer,
        );
        if patch.display_name.is_some() {
            self.display_name = patch.display_name;
        }
        if patch.contact_name.is_some() {
            self.contact_name = patch.contact_name;
        }
    }
}

/// Partial configuration; unknown keys are rejected at load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SipConfigPatch {
    pub server_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub domain: Option<String>,
    pub display_name: Option<String>,
    pub contact_name: Option<String>,
    pub register_ttl: Option<u32>,
    pub media: Option<MediaConfig>,
    pub keep_alive_interval: Option<Duration>,
    pub keep_alive_max_failures: Option<u32>,
    pub no_answer_timeout: Option<Duration>,
    pub trace_sip: Option<bool>,
    pub enable_blf: Option<bool>,
    pub auto_answer: Option<bool>,
}
