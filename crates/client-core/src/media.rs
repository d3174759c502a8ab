//! The media seam
//!
//! Signaling lives in this crate; actual audio I/O does not. A
//! [`MediaSession`] owns whatever the embedder uses to move RTP (a WebRTC
//! peer connection, a native stack, nothing at all in tests) and exposes
//! the handful of controls the session core needs: SDP exchange, track
//! gating for mute/hold, and RFC 4733 DTMF.

use crate::config::MediaConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use softline_sip_core::{MediaDirection, SessionDescription};
use std::sync::Arc;
use thiserror::Error;

/// Failures from the media layer.
#[derive(Error, Debug, Clone)]
pub enum MediaError {
    /// The operation is not supported by this media session (e.g. DTMF on
    /// a session without a telephone-event payload).
    #[error("operation not supported by media session")]
    Unsupported,
    #[error("media operation failed: {reason}")]
    Failed { reason: String },
}

pub type MediaResult<T> = std::result::Result<T, MediaError>;

/// One session's media half.
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Produce the local SDP offer (audio only).
    async fn create_offer(&self) -> MediaResult<String>;

    /// Produce the local SDP answer to a remote offer.
    async fn create_answer(&self, remote_offer: &str) -> MediaResult<String>;

    /// Apply the remote answer to our offer.
    async fn set_remote_description(&self, sdp: &str) -> MediaResult<()>;

    /// Gate the local audio track.
    async fn set_muted(&self, muted: bool);

    /// Gate both directions for hold. Independent of mute.
    async fn set_hold(&self, hold: bool);

    /// Whether the session can renegotiate (re-INVITE with a new SDP).
    fn supports_renegotiation(&self) -> bool;

    /// Current local description for a re-offer with `direction` applied.
    async fn reoffer(&self, direction: MediaDirection) -> MediaResult<String>;

    /// Emit one RFC 4733 telephone-event.
    async fn send_dtmf(&self, tone: char, duration_ms: u32) -> MediaResult<()>;

    async fn close(&self);
}

/// Creates one [`MediaSession`] per call.
#[async_trait]
pub trait MediaFactory: Send + Sync {
    async fn create_session(&self, config: &MediaConfig) -> MediaResult<Arc<dyn MediaSession>>;
}

/// Operations a [`NullMediaSession`] has performed, for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaOp {
    Offer,
    Answer,
    RemoteDescription,
    Mute(bool),
    Hold(bool),
    Dtmf(char),
    Close,
}

/// A signaling-complete, media-free session.
///
/// Generates well-formed audio SDP and records every control call. The
/// production default when no real media stack is wired in, and the test
/// double (it is its own mock, the way the audio platform layer ships its
/// mock as an ordinary implementation).
pub struct NullMediaSession {
    local: Mutex<SessionDescription>,
    remote: Mutex<Option<SessionDescription>>,
    ops: Mutex<Vec<MediaOp>>,
    muted: Mutex<bool>,
    held: Mutex<bool>,
    dtmf_supported: bool,
}

impl NullMediaSession {
    pub fn new() -> Self {
        NullMediaSession {
            local: Mutex::new(SessionDescription::audio_offer("0.0.0.0", 9)),
            remote: Mutex::new(None),
            ops: Mutex::new(Vec::new()),
            muted: Mutex::new(false),
            held: Mutex::new(false),
            dtmf_supported: true,
        }
    }

    /// A session that refuses DTMF, for exercising the unsupported path.
    pub fn without_dtmf() -> Self {
        NullMediaSession {
            dtmf_supported: false,
            ..Self::new()
        }
    }

    pub fn operations(&self) -> Vec<MediaOp> {
        self.ops.lock().clone()
    }

    pub fn is_muted(&self) -> bool {
        *self.muted.lock()
    }

    pub fn is_held(&self) -> bool {
        *self.held.lock()
    }

    fn record(&self, op: MediaOp) {
        self.ops.lock().push(op);
    }
}

impl Default for NullMediaSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSession for NullMediaSession {
    async fn create_offer(&self) -> MediaResult<String> {
        self.record(MediaOp::Offer);
        Ok(self.local.lock().to_string())
    }

    async fn create_answer(&self, remote_offer: &str) -> MediaResult<String> {
        self.record(MediaOp::Answer);
        let remote: SessionDescription =
            remote_offer.parse().map_err(|e: softline_sip_core::Error| {
                MediaError::Failed {
                    reason: e.to_string(),
                }
            })?;
        *self.remote.lock() = Some(remote);
        Ok(self.local.lock().to_string())
    }

    async fn set_remote_description(&self, sdp: &str) -> MediaResult<()> {
        self.record(MediaOp::RemoteDescription);
        let remote: SessionDescription =
            sdp.parse().map_err(|e: softline_sip_core::Error| MediaError::Failed {
                reason: e.to_string(),
            })?;
        *self.remote.lock() = Some(remote);
        Ok(())
    }

    async fn set_muted(&self, muted: bool) {
        self.record(MediaOp::Mute(muted));
        *self.muted.lock() = muted;
    }

    async fn set_hold(&self, hold: bool) {
        self.record(MediaOp::Hold(hold));
        *self.held.lock() = hold;
    }

    fn supports_renegotiation(&self) -> bool {
        true
    }

    async fn reoffer(&self, direction: MediaDirection) -> MediaResult<String> {
        let mut local = self.local.lock();
        *local = local.clone().reoffer(direction);
        Ok(local.to_string())
    }

    async fn send_dtmf(&self, tone: char, _duration_ms: u32) -> MediaResult<()> {
        if !self.dtmf_supported {
            return Err(MediaError::Unsupported);
        }
        self.record(MediaOp::Dtmf(tone));
        Ok(())
    }

    async fn close(&self) {
        self.record(MediaOp::Close);
    }
}

/// Factory producing [`NullMediaSession`]s; keeps handles to every session
/// it created so tests can inspect them afterwards.
pub struct NullMediaFactory {
    dtmf_supported: bool,
    created: Mutex<Vec<Arc<NullMediaSession>>>,
}

impl NullMediaFactory {
    pub fn new() -> Self {
        NullMediaFactory {
            dtmf_supported: true,
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn without_dtmf() -> Self {
        NullMediaFactory {
            dtmf_supported: false,
            created: Mutex::new(Vec::new()),
        }
    }

    /// Sessions created so far, in creation order.
    pub fn sessions(&self) -> Vec<Arc<NullMediaSession>> {
        self.created.lock().clone()
    }
}

impl Default for NullMediaFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaFactory for NullMediaFactory {
    async fn create_session(&self, _config: &MediaConfig) -> MediaResult<Arc<dyn MediaSession>> {
        let session = Arc::new(if self.dtmf_supported {
            NullMediaSession::new()
        } else {
            NullMediaSession::without_dtmf()
        });
        self.created.lock().push(session.clone());
        Ok(session as Arc<dyn MediaSession>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_session_round_trips_sdp() {
        let session = NullMediaSession::new();
        let offer = session.create_offer().await.unwrap();
        assert!(offer.contains("m=audio"));
        let answer = session.create_answer(&offer).await.unwrap();
        assert!(answer.contains("m=audio"));
        assert_eq!(
            session.operations(),
            vec![MediaOp::Offer, MediaOp::Answer]
        );
    }

    #[tokio::test]
    async fn dtmf_unsupported_path() {
        let session = NullMediaSession::without_dtmf();
        assert!(matches!(
            session.send_dtmf('5', 100).await,
            Err(MediaError::Unsupported)
        ));
    }

    #[tokio::test]
    async fn mute_and_hold_track_state() {
        let session = NullMediaSession::new();
        session.set_muted(true).await;
        session.set_hold(true).await;
        assert!(session.is_muted());
        assert!(session.is_held());
        session.set_hold(false).await;
        assert!(!session.is_held());
    }
}
