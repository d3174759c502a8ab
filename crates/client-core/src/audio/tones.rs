//! Call-progress tone synthesis
//!
//! The PBXs this stack talks to do not reliably deliver in-band ringback
//! or busy tone, so the client generates its own: an oscillator bank summed
//! at `volume / n` into a cadence gate driven by a timer over the tone's
//! pattern. Profiles follow the national tone plans.

use crate::audio::device::AudioSink;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::f32::consts::TAU;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Default auto-stop for busy/error tones.
const DEFAULT_AUTO_STOP: Duration = Duration::from_secs(3);
/// Mixing level for generated tones.
const DEFAULT_VOLUME: f32 = 0.2;

/// One cadenced tone: up to three sinusoids and an on/off pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToneDefinition {
    /// Sinusoid frequencies in Hz, mixed at `volume / len`.
    pub frequencies: Vec<f32>,
    /// Alternating on/off durations in milliseconds, starting with on.
    /// `[2000, 4000]` is two seconds of tone, four of silence.
    pub pattern: Vec<u64>,
    pub volume: f32,
}

impl ToneDefinition {
    pub fn new(frequencies: Vec<f32>, pattern: Vec<u64>) -> Self {
        ToneDefinition {
            frequencies,
            pattern,
            volume: DEFAULT_VOLUME,
        }
    }
}

/// Tone-plan locales with distinct cadences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToneLocale {
    Uk,
    Us,
    Eu,
    Au,
    Fr,
    Jp,
}

/// The three progress tones of a locale.
#[derive(Debug, Clone)]
pub struct ToneProfile {
    pub ringback: ToneDefinition,
    pub busy: ToneDefinition,
    pub error: ToneDefinition,
}

impl ToneLocale {
    pub fn profile(&self) -> ToneProfile {
        match self {
            ToneLocale::Uk => ToneProfile {
                ringback: ToneDefinition::new(vec![400.0, 450.0], vec![400, 200, 400, 2000]),
                busy: ToneDefinition::new(vec![400.0], vec![375, 375]),
                error: ToneDefinition::new(vec![400.0], vec![400, 350]),
            },
            ToneLocale::Us => ToneProfile {
                ringback: ToneDefinition::new(vec![440.0, 480.0], vec![2000, 4000]),
                busy: ToneDefinition::new(vec![480.0, 620.0], vec![500, 500]),
                error: ToneDefinition::new(vec![480.0, 620.0], vec![250, 250]),
            },
            ToneLocale::Eu => ToneProfile {
                ringback: ToneDefinition::new(vec![425.0], vec![1000, 4000]),
                busy: ToneDefinition::new(vec![425.0], vec![500, 500]),
                error: ToneDefinition::new(vec![425.0], vec![250, 250]),
            },
            ToneLocale::Au => ToneProfile {
                ringback: ToneDefinition::new(vec![400.0, 425.0], vec![400, 200, 400, 2000]),
                busy: ToneDefinition::new(vec![425.0], vec![375, 375]),
                error: ToneDefinition::new(vec![425.0], vec![250, 250]),
            },
            ToneLocale::Fr => ToneProfile {
                ringback: ToneDefinition::new(vec![440.0], vec![1500, 3500]),
                busy: ToneDefinition::new(vec![440.0], vec![500, 500]),
                error: ToneDefinition::new(vec![440.0], vec![250, 250]),
            },
            ToneLocale::Jp => ToneProfile {
                ringback: ToneDefinition::new(vec![400.0], vec![1000, 2000]),
                busy: ToneDefinition::new(vec![400.0], vec![500, 500]),
                error: ToneDefinition::new(vec![400.0], vec![250, 250]),
            },
        }
    }
}

/// Map a BCP-47 language tag to a tone locale: full tag first, then the
/// language prefix, then US.
pub fn detect_locale(tag: &str) -> ToneLocale {
    let tag = tag.trim().to_ascii_lowercase();
    match tag.as_str() {
        "en-gb" | "en-ie" => return ToneLocale::Uk,
        "en-au" | "en-nz" => return ToneLocale::Au,
        "en-us" | "en-ca" => return ToneLocale::Us,
        _ => {}
    }
    match tag.split(['-', '_']).next().unwrap_or("") {
        "fr" => ToneLocale::Fr,
        "ja" => ToneLocale::Jp,
        "de" | "es" | "it" | "nl" | "pt" | "sv" | "da" | "no" | "fi" | "pl" | "cs" | "el" => {
            ToneLocale::Eu
        }
        _ => ToneLocale::Us,
    }
}

/// Generate `duration_ms` of summed sinusoids, keeping per-oscillator
/// phase across calls so cadence segments join cleanly.
fn synthesize(
    frequencies: &[f32],
    volume: f32,
    phases: &mut Vec<f32>,
    sample_rate: u32,
    duration_ms: u64,
) -> Vec<f32> {
    phases.resize(frequencies.len(), 0.0);
    let count = (sample_rate as u64 * duration_ms / 1000) as usize;
    let gain = if frequencies.is_empty() {
        0.0
    } else {
        volume / frequencies.len() as f32
    };
    let mut samples = vec![0.0f32; count];
    for (frequency, phase) in frequencies.iter().zip(phases.iter_mut()) {
        let step = TAU * frequency / sample_rate as f32;
        for sample in samples.iter_mut() {
            *sample += phase.sin() * gain;
            *phase += step;
        }
        *phase %= TAU;
    }
    samples
}

/// The cadence player.
pub struct ToneEngine {
    sink: Arc<dyn AudioSink>,
    locale: Mutex<ToneLocale>,
    current: Mutex<Option<JoinHandle<()>>>,
}

impl ToneEngine {
    pub fn new(sink: Arc<dyn AudioSink>) -> Self {
        ToneEngine {
            sink,
            locale: Mutex::new(ToneLocale::Us),
            current: Mutex::new(None),
        }
    }

    /// Override the detected locale.
    pub fn set_locale(&self, locale: ToneLocale) {
        *self.locale.lock() = locale;
    }

    /// Set the locale from a language tag (e.g. a stored `AppLanguage`).
    pub fn set_locale_from_tag(&self, tag: &str) {
        self.set_locale(detect_locale(tag));
    }

    pub fn locale(&self) -> ToneLocale {
        *self.locale.lock()
    }

    pub fn is_playing(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    /// Repeating ringback for an outgoing call; runs until stopped.
    pub fn start_ringback(&self) {
        let tone = self.locale().profile().ringback;
        self.play(tone, true, None);
    }

    /// Busy tone, auto-stopping (default 3 s).
    pub fn start_busy(&self, auto_stop: Option<Duration>) {
        let tone = self.locale().profile().busy;
        self.play(tone, true, Some(auto_stop.unwrap_or(DEFAULT_AUTO_STOP)));
    }

    /// Reorder/congestion tone, auto-stopping (default 3 s).
    pub fn start_error(&self, auto_stop: Option<Duration>) {
        let tone = self.locale().profile().error;
        self.play(tone, true, Some(auto_stop.unwrap_or(DEFAULT_AUTO_STOP)));
    }

    /// The call-waiting indication: two 200 ms beeps at 440 Hz with a
    /// 400 ms gap, played once.
    pub fn play_call_waiting(&self) {
        self.play(
            ToneDefinition::new(vec![440.0], vec![200, 400, 200]),
            false,
            None,
        );
    }

    /// Start an arbitrary tone. Replaces whatever is playing.
    pub fn play(&self, tone: ToneDefinition, repeat: bool, auto_stop: Option<Duration>) {
        self.stop();
        if tone.pattern.is_empty() || tone.frequencies.is_empty() {
            return;
        }
        debug!(?tone, repeat, "tone start");
        let sink = self.sink.clone();
        let handle = tokio::spawn(async move {
            let sample_rate = sink.sample_rate();
            let mut phases: Vec<f32> = Vec::new();
            let started = tokio::time::Instant::now();
            'outer: loop {
                for (index, duration_ms) in tone.pattern.iter().enumerate() {
                    let mut segment = Duration::from_millis(*duration_ms);
                    if let Some(limit) = auto_stop {
                        let elapsed = started.elapsed();
                        if elapsed >= limit {
                            break 'outer;
                        }
                        // Truncate the last segment to land on the limit.
                        segment = segment.min(limit - elapsed);
                    }
                    let on = index % 2 == 0;
                    if on {
                        let samples = synthesize(
                            &tone.frequencies,
                            tone.volume,
                            &mut phases,
                            sample_rate,
                            segment.as_millis() as u64,
                        );
                        sink.write(&samples).await;
                    }
                    tokio::time::sleep(segment).await;
                }
                if !repeat {
                    break;
                }
            }
        });
        *self.current.lock() = Some(handle);
    }

    /// Disconnect the oscillators and clear the cadence timer.
    pub fn stop(&self) {
        if let Some(task) = self.current.lock().take() {
            task.abort();
        }
    }
}

impl Drop for ToneEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::RecordingAudioSink;

    #[test]
    fn locale_detection() {
        assert_eq!(detect_locale("en-GB"), ToneLocale::Uk);
        assert_eq!(detect_locale("en-AU"), ToneLocale::Au);
        assert_eq!(detect_locale("en-US"), ToneLocale::Us);
        assert_eq!(detect_locale("fr-FR"), ToneLocale::Fr);
        assert_eq!(detect_locale("fr"), ToneLocale::Fr);
        assert_eq!(detect_locale("ja-JP"), ToneLocale::Jp);
        assert_eq!(detect_locale("de-DE"), ToneLocale::Eu);
        assert_eq!(detect_locale("pt_BR"), ToneLocale::Eu);
        assert_eq!(detect_locale("xx"), ToneLocale::Us);
        assert_eq!(detect_locale(""), ToneLocale::Us);
    }

    #[test]
    fn synthesis_length_and_level() {
        let mut phases = Vec::new();
        let samples = synthesize(&[440.0], 0.2, &mut phases, 48_000, 100);
        assert_eq!(samples.len(), 4800);
        let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak > 0.15 && peak <= 0.2, "peak was {}", peak);
    }

    #[test]
    fn two_oscillators_split_the_volume() {
        let mut phases = Vec::new();
        // In-phase start: first samples near zero, peak bounded by volume.
        let samples = synthesize(&[440.0, 480.0], 0.2, &mut phases, 48_000, 50);
        let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak <= 0.2 + f32::EPSILON);
    }

    #[tokio::test]
    async fn call_waiting_writes_two_beeps() {
        let sink = Arc::new(RecordingAudioSink::new());
        let engine = ToneEngine::new(sink.clone());
        engine.play_call_waiting();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let writes = sink.writes();
        assert_eq!(writes.len(), 2, "expected exactly two on-segments");
        // 200 ms at 48 kHz.
        assert_eq!(writes[0].0, 9600);
        assert_eq!(writes[1].0, 9600);
        assert!(!engine.is_playing());
    }

    #[tokio::test]
    async fn busy_tone_auto_stops() {
        let sink = Arc::new(RecordingAudioSink::new());
        let engine = ToneEngine::new(sink.clone());
        engine.start_busy(Some(Duration::from_millis(600)));
        tokio::time::sleep(Duration::from_millis(900)).await;
        assert!(!engine.is_playing());
        // 500 ms on / 500 ms off: only the first on-segment fits the limit.
        assert!(!sink.writes().is_empty());
    }

    #[tokio::test]
    async fn stop_cancels_playback() {
        let sink = Arc::new(RecordingAudioSink::new());
        let engine = ToneEngine::new(sink.clone());
        engine.start_ringback();
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.stop();
        let count = sink.writes().len();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.writes().len(), count);
        assert!(!engine.is_playing());
    }
}
