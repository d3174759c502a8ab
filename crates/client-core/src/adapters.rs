//! Adapter traits for external collaborators
//!
//! The core never renders UI, stores preferences, or talks to the REST
//! backend itself; it consumes these narrow interfaces. No-op
//! implementations ship so every adapter is optional.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Well-known preference keys (values are strings; booleans are encoded as
/// `"0"`/`"1"`).
pub mod pref_keys {
    pub const BUSYLIGHT_ENABLED: &str = "BusylightEnabled";
    pub const BUSYLIGHT_RING_SOUND: &str = "BusylightRingSound";
    pub const BUSYLIGHT_RING_VOLUME: &str = "BusylightRingVolume";
    pub const ACTIVE_VM_NOTIFY: &str = "activeVmNotify";
    pub const SIP_USERNAME: &str = "SipUsername";
    pub const APP_LANGUAGE: &str = "AppLanguage";
    pub const MICROPHONE_DEVICE: &str = "MicrophoneDeviceId";
    pub const SPEAKER_DEVICE: &str = "SpeakerDeviceId";
    pub const RINGER_DEVICE: &str = "RingerDeviceId";
    pub const RINGTONE: &str = "Ringtone";
}

/// String key/value preference store.
pub trait Preferences: Send + Sync {
    fn get(&self, key: &str, default: &str) -> String;
    fn set(&self, key: &str, value: &str);

    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key, if default { "1" } else { "0" }) == "1"
    }
}

/// In-memory preference store; the production default until the embedder
/// wires in persistence.
#[derive(Default)]
pub struct MemoryPreferences {
    values: DashMap<String, String>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Preferences for MemoryPreferences {
    fn get(&self, key: &str, default: &str) -> String {
        self.values
            .get(key)
            .map(|v| v.clone())
            .unwrap_or_else(|| default.to_string())
    }

    fn set(&self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }
}

/// A directory hit for caller-id resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactMatch {
    pub display_name: String,
}

/// Caller-id lookup against the embedder's contact store.
#[async_trait]
pub trait ContactsDirectory: Send + Sync {
    async fn lookup_by_number(&self, number: &str) -> Option<ContactMatch>;
}

/// Directory that never matches.
pub struct NullContacts;

#[async_trait]
impl ContactsDirectory for NullContacts {
    async fn lookup_by_number(&self, _number: &str) -> Option<ContactMatch> {
        None
    }
}

/// Agent state as reported by the Phantom backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentData {
    pub username: String,
    pub logged_on: bool,
    pub queue_count: u32,
}

/// The Phantom REST surface the recovery path touches. Used to restore
/// agent login indication after a reconnect, never by the SIP protocol
/// itself.
#[async_trait]
pub trait PhantomApi: Send + Sync {
    async fn query_agent_status(&self, username: &str) -> Option<AgentData>;
    async fn agent_logon(&self, username: &str) -> bool;
    async fn agent_logoff(&self, username: &str) -> bool;
}

pub struct NullPhantomApi;

#[async_trait]
impl PhantomApi for NullPhantomApi {
    async fn query_agent_status(&self, _username: &str) -> Option<AgentData> {
        None
    }

    async fn agent_logon(&self, _username: &str) -> bool {
        false
    }

    async fn agent_logoff(&self, _username: &str) -> bool {
        false
    }
}

/// Opaque handle for a displayed notification.
pub type NotificationHandle = u64;

/// Desktop-notification surface for incoming calls.
pub trait NotificationSink: Send + Sync {
    fn show_incoming(&self, name: &str, number: &str) -> NotificationHandle;
    fn close(&self, handle: NotificationHandle);
}

pub struct NullNotificationSink;

impl NotificationSink for NullNotificationSink {
    fn show_incoming(&self, _name: &str, _number: &str) -> NotificationHandle {
        0
    }

    fn close(&self, _handle: NotificationHandle) {}
}

/// Severity of a tab alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Ringing,
    Error,
}

/// UI tab flashing during ringing; purely advisory.
pub trait TabAlert: Send + Sync {
    fn set_alert(&self, tab: &str, severity: AlertSeverity);
    fn clear_alert(&self, tab: &str);
}

pub struct NullTabAlert;

impl TabAlert for NullTabAlert {
    fn set_alert(&self, _tab: &str, _severity: AlertSeverity) {}
    fn clear_alert(&self, _tab: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_preferences_round_trip() {
        let prefs = MemoryPreferences::new();
        assert_eq!(prefs.get(pref_keys::RINGTONE, "classic"), "classic");
        prefs.set(pref_keys::RINGTONE, "chime");
        assert_eq!(prefs.get(pref_keys::RINGTONE, "classic"), "chime");
    }

    #[test]
    fn bool_encoding() {
        let prefs = MemoryPreferences::new();
        assert!(!prefs.get_bool(pref_keys::BUSYLIGHT_ENABLED, false));
        prefs.set(pref_keys::BUSYLIGHT_ENABLED, "1");
        assert!(prefs.get_bool(pref_keys::BUSYLIGHT_ENABLED, false));
    }
}
