//! Internal dialog and session state
//!
//! A `Dialog` tracks the RFC 3261 identifiers of one SIP dialog (call or
//! subscription); a `Session` wraps a call dialog with everything the
//! softphone layers on top: line assignment, media handle, timers, transfer
//! linkage. Both are crate-internal; the outside world sees [`CallInfo`]
//! snapshots.

use crate::call::{CallDirection, CallInfo, CallState, CallType, SessionId};
use crate::media::MediaSession;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use softline_sip_core::{Address, Request, SipUri};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Identifiers of one dialog half.
#[derive(Debug, Clone)]
pub(crate) struct Dialog {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: Option<String>,
    pub local_uri: SipUri,
    pub local_display: Option<String>,
    pub remote_uri: SipUri,
    /// Peer Contact; in-dialog requests go here when known.
    pub remote_target: Option<SipUri>,
    pub local_cseq: u32,
}

impl Dialog {
    pub fn new(call_id: String, local_tag: String, local_uri: SipUri, remote_uri: SipUri) -> Self {
        Dialog {
            call_id,
            local_tag,
            remote_tag: None,
            local_uri,
            local_display: None,
            remote_uri,
            remote_target: None,
            local_cseq: 0,
        }
    }

    pub fn next_cseq(&mut self) -> u32 {
        self.local_cseq += 1;
        self.local_cseq
    }

    /// Our half as a From/To address.
    pub fn local_address(&self) -> Address {
        let mut addr = Address::new(self.local_uri.clone());
        if let Some(display) = &self.local_display {
            addr = addr.with_display_name(display.clone());
        }
        addr.with_tag(self.local_tag.clone())
    }

    /// The peer's half, tagged once the dialog is confirmed.
    pub fn remote_address(&self) -> Address {
        let addr = Address::new(self.remote_uri.clone());
        match &self.remote_tag {
            Some(tag) => addr.with_tag(tag.clone()),
            None => addr,
        }
    }

    /// Where in-dialog requests are addressed.
    pub fn request_uri(&self) -> SipUri {
        self.remote_target
            .clone()
            .unwrap_or_else(|| self.remote_uri.clone())
    }

    /// Record the peer tag and Contact learned from a response or request.
    pub fn confirm(&mut self, remote_tag: Option<String>, remote_target: Option<SipUri>) {
        if self.remote_tag.is_none() {
            self.remote_tag = remote_tag;
        }
        if remote_target.is_some() {
            self.remote_target = remote_target;
        }
    }
}

/// Cancellable timers owned by a session.
#[derive(Default)]
pub(crate) struct SessionTimers {
    pub no_answer: Option<JoinHandle<()>>,
    pub auto_answer: Option<JoinHandle<()>>,
    pub deferred_bye: Option<JoinHandle<()>>,
}

impl SessionTimers {
    pub fn cancel_all(&mut self) {
        for handle in [
            self.no_answer.take(),
            self.auto_answer.take(),
            self.deferred_bye.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

/// How a session participates in a transfer, if at all.
#[derive(Debug, Clone)]
pub(crate) enum TransferRole {
    /// This session sent a blind REFER; `completed` stops duplicate
    /// completion events when both the 2xx and the sipfrag NOTIFY arrive.
    Blind { target: String, completed: bool },
    /// This session is the original call of an attended transfer.
    Original { consultation: SessionId },
    /// This session is the consultation call of an attended transfer.
    Consultation { original: SessionId },
    /// This session sent REFER-with-Replaces and awaits the outcome.
    CompletePending {
        consultation: SessionId,
        completed: bool,
    },
}

/// One live call.
pub(crate) struct Session {
    pub id: SessionId,
    pub line: u8,
    pub direction: CallDirection,
    pub remote_number: String,
    pub remote_display: Mutex<Option<String>>,
    pub call_type: Option<CallType>,
    pub state: Mutex<CallState>,
    pub dialog: Mutex<Dialog>,
    pub media: Mutex<Option<Arc<dyn MediaSession>>>,
    pub on_hold: AtomicBool,
    pub muted: AtomicBool,
    pub locally_answered: AtomicBool,
    pub created_at: DateTime<Utc>,
    pub answered_at: Mutex<Option<DateTime<Utc>>>,
    /// The INVITE that created this session: ours (outgoing, kept for
    /// CANCEL and auth retry) or theirs (incoming, kept for replies).
    pub invite: Mutex<Option<Request>>,
    pub auth_retried: AtomicBool,
    pub timers: Mutex<SessionTimers>,
    pub transfer: Mutex<Option<TransferRole>>,
}

impl Session {
    pub fn new(
        id: SessionId,
        line: u8,
        direction: CallDirection,
        remote_number: String,
        dialog: Dialog,
        initial_state: CallState,
    ) -> Self {
        Session {
            id,
            line,
            direction,
            call_type: CallType::derive(&remote_number),
            remote_number,
            remote_display: Mutex::new(None),
            state: Mutex::new(initial_state),
            dialog: Mutex::new(dialog),
            media: Mutex::new(None),
            on_hold: AtomicBool::new(false),
            muted: AtomicBool::new(false),
            locally_answered: AtomicBool::new(false),
            created_at: Utc::now(),
            answered_at: Mutex::new(None),
            invite: Mutex::new(None),
            auth_retried: AtomicBool::new(false),
            timers: Mutex::new(SessionTimers::default()),
            transfer: Mutex::new(None),
        }
    }

    pub fn state(&self) -> CallState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: CallState) {
        *self.state.lock() = state;
    }

    pub fn call_id(&self) -> String {
        self.dialog.lock().call_id.clone()
    }

    pub fn is_on_hold(&self) -> bool {
        self.on_hold.load(Ordering::SeqCst)
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn was_locally_answered(&self) -> bool {
        self.locally_answered.load(Ordering::SeqCst)
    }

    pub fn media_session(&self) -> Option<Arc<dyn MediaSession>> {
        self.media.lock().clone()
    }

    /// Seconds of established talk time so far.
    pub fn duration_seconds(&self) -> u64 {
        self.answered_at
            .lock()
            .map(|answered| (Utc::now() - answered).num_seconds().max(0) as u64)
            .unwrap_or(0)
    }

    /// Public snapshot of this session.
    pub fn snapshot(&self) -> CallInfo {
        CallInfo {
            session_id: self.id.clone(),
            line: self.line,
            direction: self.direction,
            remote_number: self.remote_number.clone(),
            remote_display_name: self.remote_display.lock().clone(),
            state: self.state(),
            call_type: self.call_type,
            created_at: self.created_at,
            answered_at: *self.answered_at.lock(),
            duration_seconds: self.duration_seconds(),
            on_hold: self.is_on_hold(),
            muted: self.is_muted(),
            locally_answered: self.was_locally_answered(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dialog() -> Dialog {
        Dialog::new(
            "cid@test".to_string(),
            "lt1".to_string(),
            SipUri::new("1001", "pbx.example.com"),
            SipUri::new("2000", "pbx.example.com"),
        )
    }

    #[test]
    fn cseq_increments() {
        let mut dialog = test_dialog();
        assert_eq!(dialog.next_cseq(), 1);
        assert_eq!(dialog.next_cseq(), 2);
    }

    #[test]
    fn confirm_keeps_first_tag() {
        let mut dialog = test_dialog();
        dialog.confirm(Some("rt1".to_string()), None);
        dialog.confirm(Some("rt2".to_string()), None);
        assert_eq!(dialog.remote_tag.as_deref(), Some("rt1"));
    }

    #[test]
    fn request_uri_prefers_contact() {
        let mut dialog = test_dialog();
        assert_eq!(dialog.request_uri().user.as_deref(), Some("2000"));
        dialog.confirm(
            Some("rt".to_string()),
            Some(SipUri::new("2000", "198.51.100.7")),
        );
        assert_eq!(dialog.request_uri().host, "198.51.100.7");
    }

    #[test]
    fn snapshot_reflects_state() {
        let session = Session::new(
            SessionId::from_raw("1-0"),
            2,
            CallDirection::Outgoing,
            "2000".to_string(),
            test_dialog(),
            CallState::Initiating,
        );
        let info = session.snapshot();
        assert_eq!(info.line, 2);
        assert_eq!(info.state, CallState::Initiating);
        assert_eq!(info.call_type, Some(CallType::Internal));
        assert_eq!(info.duration_seconds, 0);
    }
}
