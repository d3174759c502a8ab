//! Ringtone and progress-tone orchestration
//!
//! Subscribes to the bus and turns session events into sound: looping
//! ringtone for a lone incoming call, the short alert clip on a 3-second
//! cadence when another call is already up, ringback while an outgoing
//! call rings, busy/reorder on failure. Device and ringtone selection come
//! from preferences.

use crate::adapters::{pref_keys, Preferences};
use crate::audio::device::{AudioOutput, AudioResult, PlaybackId};
use crate::audio::tones::ToneEngine;
use crate::call::{CallDirection, CallState, SessionId};
use crate::events::{ClientEvent, EventBus};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Cadence for the call-waiting alert clip.
const ALERT_REPLAY_INTERVAL: Duration = Duration::from_secs(3);
/// Clip played when another call is already active.
const ALERT_CLIP: &str = "alert.mp3";
/// Clip used to unlock playback after an autoplay gate.
const SILENT_CLIP: &str = "silence.mp3";
/// Fallback ringtone when no preference is stored.
const DEFAULT_RINGTONE: &str = "classic.mp3";
/// Default ringer device id.
const DEFAULT_RINGER_DEVICE: &str = "default";

#[derive(Default)]
struct RingPlayback {
    playback: Option<PlaybackId>,
    replay: Option<JoinHandle<()>>,
    for_session: Option<SessionId>,
}

struct ServiceInner {
    output: Arc<dyn AudioOutput>,
    prefs: Arc<dyn Preferences>,
    tones: Arc<ToneEngine>,
    bus: EventBus,
    ring: Mutex<RingPlayback>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Bus-driven audio coordinator.
#[derive(Clone)]
pub struct AudioService {
    inner: Arc<ServiceInner>,
}

impl AudioService {
    pub fn new(
        bus: EventBus,
        output: Arc<dyn AudioOutput>,
        prefs: Arc<dyn Preferences>,
        tones: Arc<ToneEngine>,
    ) -> Self {
        tones.set_locale_from_tag(&prefs.get(pref_keys::APP_LANGUAGE, "en-US"));
        AudioService {
            inner: Arc::new(ServiceInner {
                output,
                prefs,
                tones,
                bus,
                ring: Mutex::new(RingPlayback::default()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn tones(&self) -> Arc<ToneEngine> {
        self.inner.tones.clone()
    }

    /// Start the event pump.
    pub fn start(&self) {
        let mut tasks = self.inner.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        let service = self.clone();
        let mut rx = self.inner.bus.subscribe();
        tasks.push(tokio::spawn(async move {
            // Per-session context the events alone do not carry.
            let mut directions: HashMap<SessionId, CallDirection> = HashMap::new();
            let mut active: HashSet<SessionId> = HashSet::new();
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        service
                            .handle_event(event, &mut directions, &mut active)
                            .await
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "audio service lagged on the bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    pub fn stop(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.stop_ringing_sync();
        self.inner.tones.stop();
    }

    /// Resume the output and push a silent buffer through it, satisfying
    /// host autoplay policies that require a first gesture-driven play.
    pub async fn enable_audio_playback(&self) -> AudioResult<()> {
        self.inner.output.resume().await?;
        let id = self.inner.output.play_clip(SILENT_CLIP, false).await?;
        self.inner.output.stop_clip(id).await;
        Ok(())
    }

    /// Start ringing for `session`. With `use_alert_tone` (some other call
    /// is live) the short alert clip plays once plus a 3 s replay cadence;
    /// otherwise the configured ringtone loops.
    pub async fn start_ringing(&self, session: SessionId, use_alert_tone: bool) {
        self.stop_ringing().await;

        let device = self
            .inner
            .prefs
            .get(pref_keys::RINGER_DEVICE, DEFAULT_RINGER_DEVICE);
        if let Err(e) = self.inner.output.set_ringer_device(&device).await {
            warn!(error = %e, device, "ringer device unavailable");
        }

        if use_alert_tone {
            let first = self.inner.output.play_clip(ALERT_CLIP, false).await.ok();
            let output = self.inner.output.clone();
            // The interval enforces the cadence even if the clip's end is
            // reported late.
            let replay = tokio::spawn(async move {
                loop {
                    tokio::time::sleep(ALERT_REPLAY_INTERVAL).await;
                    if output.play_clip(ALERT_CLIP, false).await.is_err() {
                        break;
                    }
                }
            });
            let mut ring = self.inner.ring.lock();
            ring.playback = first;
            ring.replay = Some(replay);
            ring.for_session = Some(session);
        } else {
            let ringtone = self
                .inner
                .prefs
                .get(pref_keys::RINGTONE, DEFAULT_RINGTONE);
            let playback = self.inner.output.play_clip(&ringtone, true).await.ok();
            let mut ring = self.inner.ring.lock();
            ring.playback = playback;
            ring.replay = None;
            ring.for_session = Some(session);
        }
        debug!(use_alert_tone, "ringing started");
    }

    /// Stop the ringtone and its replay cadence.
    pub async fn stop_ringing(&self) {
        let playback = {
            let mut ring = self.inner.ring.lock();
            if let Some(replay) = ring.replay.take() {
                replay.abort();
            }
            ring.for_session = None;
            ring.playback.take()
        };
        if let Some(id) = playback {
            self.inner.output.stop_clip(id).await;
        }
    }

    fn stop_ringing_sync(&self) {
        let mut ring = self.inner.ring.lock();
        if let Some(replay) = ring.replay.take() {
            replay.abort();
        }
        ring.playback = None;
        ring.for_session = None;
    }

    fn ringing_for(&self) -> Option<SessionId> {
        self.inner.ring.lock().for_session.clone()
    }

    async fn handle_event(
        &self,
        event: ClientEvent,
        directions: &mut HashMap<SessionId, CallDirection>,
        active: &mut HashSet<SessionId>,
    ) {
        match event {
            ClientEvent::SessionCreated { session } => {
                directions.insert(session.session_id.clone(), session.direction);
            }
            ClientEvent::IncomingCall { session } => {
                let use_alert = !active.is_empty();
                self.start_ringing(session.session_id, use_alert).await;
            }
            ClientEvent::SessionStateChanged {
                session_id, state, ..
            } => match state {
                CallState::Ringing => {
                    if directions.get(&session_id) == Some(&CallDirection::Outgoing) {
                        self.inner.tones.start_ringback();
                    }
                }
                CallState::Established => {
                    active.insert(session_id.clone());
                    self.inner.tones.stop();
                    if self.ringing_for().as_ref() == Some(&session_id) {
                        self.stop_ringing().await;
                    }
                }
                _ => {}
            },
            ClientEvent::SessionAnswered { session_id, .. } => {
                active.insert(session_id.clone());
                self.inner.tones.stop();
                if self.ringing_for().as_ref() == Some(&session_id) {
                    self.stop_ringing().await;
                }
            }
            ClientEvent::SessionTerminated {
                session_id,
                direction,
                reason,
                ..
            } => {
                active.remove(&session_id);
                directions.remove(&session_id);
                if self.ringing_for().as_ref() == Some(&session_id) {
                    self.stop_ringing().await;
                }
                // Locally generated progress tone for failed outgoing
                // calls; the server rarely plays one in-band.
                if direction == CallDirection::Outgoing {
                    if reason.starts_with("486") || reason.contains("Busy") {
                        self.inner.tones.start_busy(None);
                    } else if reason
                        .chars()
                        .next()
                        .map(|c| c == '4' || c == '5' || c == '6')
                        .unwrap_or(false)
                    {
                        self.inner.tones.start_error(None);
                    } else {
                        self.inner.tones.stop();
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryPreferences;
    use crate::audio::device::{NullAudioSink, RecordingAudioOutput};
    use crate::call::CallInfo;
    use chrono::Utc;

    fn service() -> (AudioService, Arc<RecordingAudioOutput>, EventBus) {
        let bus = EventBus::new(64);
        let output = Arc::new(RecordingAudioOutput::new());
        let prefs = Arc::new(MemoryPreferences::new());
        prefs.set(pref_keys::RINGTONE, "chime.mp3");
        let tones = Arc::new(ToneEngine::new(Arc::new(NullAudioSink)));
        let service = AudioService::new(bus.clone(), output.clone(), prefs, tones);
        (service, output, bus)
    }

    fn call_info(id: &str) -> CallInfo {
        CallInfo {
            session_id: SessionId::from_raw(id),
            line: 1,
            direction: CallDirection::Incoming,
            remote_number: "3000".to_string(),
            remote_display_name: None,
            state: CallState::Ringing,
            call_type: None,
            created_at: Utc::now(),
            answered_at: None,
            duration_seconds: 0,
            on_hold: false,
            muted: false,
            locally_answered: false,
        }
    }

    #[tokio::test]
    async fn lone_incoming_call_loops_ringtone() {
        let (service, output, _bus) = service();
        service
            .start_ringing(SessionId::from_raw("s1"), false)
            .await;
        let plays = output.plays();
        assert_eq!(plays.len(), 1);
        assert_eq!(plays[0].clip, "chime.mp3");
        assert!(plays[0].looping);
        service.stop_ringing().await;
        assert_eq!(output.stopped().len(), 1);
    }

    #[tokio::test]
    async fn call_waiting_uses_alert_cadence() {
        let (service, output, _bus) = service();
        service.start_ringing(SessionId::from_raw("s2"), true).await;
        // One immediate play, then replays every ~3 s.
        assert_eq!(output.plays().len(), 1);
        assert_eq!(output.plays()[0].clip, ALERT_CLIP);
        assert!(!output.plays()[0].looping);

        tokio::time::sleep(Duration::from_millis(3200)).await;
        let count = output.plays().len();
        assert!(count >= 2, "expected a replay, saw {}", count);
        service.stop_ringing().await;
    }

    #[tokio::test]
    async fn answer_stops_ringing() {
        let (service, output, _bus) = service();
        let mut directions = HashMap::new();
        let mut active = HashSet::new();
        service
            .handle_event(
                ClientEvent::IncomingCall {
                    session: call_info("s1"),
                },
                &mut directions,
                &mut active,
            )
            .await;
        assert_eq!(output.plays().len(), 1);
        service
            .handle_event(
                ClientEvent::SessionAnswered {
                    session_id: SessionId::from_raw("s1"),
                    line: 1,
                },
                &mut directions,
                &mut active,
            )
            .await;
        assert_eq!(output.stopped().len(), 1);
    }

    #[tokio::test]
    async fn playback_unlock_resumes_and_plays_silence() {
        let (service, output, _bus) = service();
        service.enable_audio_playback().await.unwrap();
        assert!(output.was_resumed());
        assert_eq!(output.plays()[0].clip, SILENT_CLIP);
    }

    #[tokio::test]
    async fn ringer_device_comes_from_preferences() {
        let bus = EventBus::new(16);
        let output = Arc::new(RecordingAudioOutput::new());
        let prefs = Arc::new(MemoryPreferences::new());
        prefs.set(pref_keys::RINGER_DEVICE, "usb-headset");
        let tones = Arc::new(ToneEngine::new(Arc::new(NullAudioSink)));
        let service = AudioService::new(bus, output.clone(), prefs, tones);
        service
            .start_ringing(SessionId::from_raw("s1"), false)
            .await;
        assert_eq!(output.ringer_device().as_deref(), Some("usb-headset"));
    }
}
