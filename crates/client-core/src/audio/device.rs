//! Audio device seams
//!
//! Two surfaces: [`AudioSink`] receives synthesized tone samples, and
//! [`AudioOutput`] plays named clips (ringtones, the call-waiting alert)
//! with device routing. Both ship null and recording implementations; real
//! hardware is the embedder's business.

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum AudioError {
    #[error("audio device unavailable: {device_id}")]
    DeviceUnavailable { device_id: String },
    #[error("audio playback failed: {reason}")]
    Failed { reason: String },
}

pub type AudioResult<T> = std::result::Result<T, AudioError>;

/// Receives blocks of mono f32 samples from the tone engine. Writes are
/// non-blocking; pacing is the tone engine's job.
#[async_trait]
pub trait AudioSink: Send + Sync {
    fn sample_rate(&self) -> u32 {
        48_000
    }

    async fn write(&self, samples: &[f32]);
}

/// Discards samples.
pub struct NullAudioSink;

#[async_trait]
impl AudioSink for NullAudioSink {
    async fn write(&self, _samples: &[f32]) {}
}

/// Records every written block's length and peak amplitude.
#[derive(Default)]
pub struct RecordingAudioSink {
    writes: Mutex<Vec<(usize, f32)>>,
}

impl RecordingAudioSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(sample_count, peak_amplitude)` per write, in order.
    pub fn writes(&self) -> Vec<(usize, f32)> {
        self.writes.lock().clone()
    }
}

#[async_trait]
impl AudioSink for RecordingAudioSink {
    async fn write(&self, samples: &[f32]) {
        let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        self.writes.lock().push((samples.len(), peak));
    }
}

/// Handle for a started clip playback.
pub type PlaybackId = u64;

/// Clip playback with ringer-device routing. Clips are referred to by the
/// file names stored in preferences; resolution is the implementation's
/// concern.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    async fn play_clip(&self, clip: &str, looping: bool) -> AudioResult<PlaybackId>;
    async fn stop_clip(&self, id: PlaybackId);
    async fn stop_all(&self);
    async fn set_ringer_device(&self, device_id: &str) -> AudioResult<()>;
    /// Unblock playback after a host autoplay policy gated it.
    async fn resume(&self) -> AudioResult<()>;
}

/// Discards playback requests; the default until the embedder wires real
/// audio in.
pub struct NullAudioOutput;

#[async_trait]
impl AudioOutput for NullAudioOutput {
    async fn play_clip(&self, _clip: &str, _looping: bool) -> AudioResult<PlaybackId> {
        Ok(0)
    }

    async fn stop_clip(&self, _id: PlaybackId) {}

    async fn stop_all(&self) {}

    async fn set_ringer_device(&self, _device_id: &str) -> AudioResult<()> {
        Ok(())
    }

    async fn resume(&self) -> AudioResult<()> {
        Ok(())
    }
}

/// One recorded `play_clip` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipPlay {
    pub id: PlaybackId,
    pub clip: String,
    pub looping: bool,
}

/// Records playback requests; the test double for [`AudioOutput`].
#[derive(Default)]
pub struct RecordingAudioOutput {
    plays: Mutex<Vec<ClipPlay>>,
    stopped: Mutex<Vec<PlaybackId>>,
    ringer_device: Mutex<Option<String>>,
    resumed: Mutex<bool>,
    next_id: Mutex<PlaybackId>,
}

impl RecordingAudioOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plays(&self) -> Vec<ClipPlay> {
        self.plays.lock().clone()
    }

    pub fn stopped(&self) -> Vec<PlaybackId> {
        self.stopped.lock().clone()
    }

    pub fn ringer_device(&self) -> Option<String> {
        self.ringer_device.lock().clone()
    }

    pub fn was_resumed(&self) -> bool {
        *self.resumed.lock()
    }
}

#[async_trait]
impl AudioOutput for RecordingAudioOutput {
    async fn play_clip(&self, clip: &str, looping: bool) -> AudioResult<PlaybackId> {
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            *next
        };
        self.plays.lock().push(ClipPlay {
            id,
            clip: clip.to_string(),
            looping,
        });
        Ok(id)
    }

    async fn stop_clip(&self, id: PlaybackId) {
        self.stopped.lock().push(id);
    }

    async fn stop_all(&self) {
        let ids: Vec<PlaybackId> = self.plays.lock().iter().map(|p| p.id).collect();
        self.stopped.lock().extend(ids);
    }

    async fn set_ringer_device(&self, device_id: &str) -> AudioResult<()> {
        *self.ringer_device.lock() = Some(device_id.to_string());
        Ok(())
    }

    async fn resume(&self) -> AudioResult<()> {
        *self.resumed.lock() = true;
        Ok(())
    }
}
