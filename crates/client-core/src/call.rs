//! Call/session data types
//!
//! A `Session` is owned exclusively by the session core; what other
//! components (and embedders) see are [`CallInfo`] snapshots and the events
//! carrying them. Ids stay stable for the whole call lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of call lines. Fixed: the UI renders exactly three line keys.
pub const LINE_COUNT: usize = 3;

/// Stable identifier for a session: a monotonic counter joined with the
/// wallclock millisecond it was created, e.g. `17-1722504000123`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub(crate) fn generate(counter: u64) -> Self {
        SessionId(format!("{}-{}", counter, Utc::now().timestamp_millis()))
    }

    /// Wrap an externally supplied id (tests, persistence).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        SessionId(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a call session.
///
/// ```text
/// initiating --100--> calling --180--> ringing --200--> established
/// initiating --CANCEL/reject/5xx--> failed/terminated
/// ringing(incoming) --accept--> established --BYE--> terminated
/// established <-> hold
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Initiating,
    Ringing,
    Calling,
    Connecting,
    Established,
    Hold,
    Terminating,
    Terminated,
    Failed,
}

impl CallState {
    /// Media can flow (or is gated by hold).
    pub fn is_active(&self) -> bool {
        matches!(self, CallState::Established | CallState::Hold)
    }

    /// A final state; the session never leaves it.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Terminated | CallState::Failed)
    }

    /// Early-dialog states before any final response.
    pub fn is_early(&self) -> bool {
        matches!(
            self,
            CallState::Initiating | CallState::Ringing | CallState::Calling | CallState::Connecting
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

/// Internal vs external call, when derivable from the dialed string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Internal,
    External,
}

impl CallType {
    /// Heuristic used by the dial plan: short all-digit strings are
    /// extensions, anything else leaves the building.
    pub fn derive(number: &str) -> Option<CallType> {
        let digits = number.chars().all(|c| c.is_ascii_digit());
        if number.is_empty() || !digits {
            None
        } else if number.len() <= 5 {
            Some(CallType::Internal)
        } else {
            Some(CallType::External)
        }
    }
}

/// Snapshot of a session, carried by events and returned by queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallInfo {
    pub session_id: SessionId,
    /// Assigned line, 1-based.
    pub line: u8,
    pub direction: CallDirection,
    pub remote_number: String,
    pub remote_display_name: Option<String>,
    pub state: CallState,
    pub call_type: Option<CallType>,
    pub created_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub duration_seconds: u64,
    pub on_hold: bool,
    pub muted: bool,
    /// Answered locally, as opposed to merely having nonzero duration.
    /// Discriminates missed from completed on termination.
    pub locally_answered: bool,
}

/// Aggregate call counters since the client started.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallStats {
    pub total_calls: u64,
    pub outgoing_calls: u64,
    pub incoming_calls: u64,
    pub missed_calls: u64,
    pub active_calls: usize,
}

/// Outcome recorded in history when a session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallOutcome {
    Completed,
    Missed,
    Cancelled,
}

/// Emitted on session termination; the core produces these but does not
/// store them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallHistoryRecord {
    pub id: SessionId,
    pub number: String,
    pub name: Option<String>,
    pub direction: CallDirection,
    pub duration_seconds: u64,
    pub status: CallOutcome,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique_and_ordered() {
        let a = SessionId::generate(1);
        let b = SessionId::generate(2);
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("1-"));
        assert!(b.as_str().starts_with("2-"));
    }

    #[test]
    fn state_classification() {
        assert!(CallState::Established.is_active());
        assert!(CallState::Hold.is_active());
        assert!(!CallState::Ringing.is_active());
        assert!(CallState::Failed.is_terminal());
        assert!(CallState::Initiating.is_early());
    }

    #[test]
    fn call_type_heuristic() {
        assert_eq!(CallType::derive("2001"), Some(CallType::Internal));
        assert_eq!(CallType::derive("441632960961"), Some(CallType::External));
        assert_eq!(CallType::derive("+441632960961"), None);
        assert_eq!(CallType::derive(""), None);
    }
}
