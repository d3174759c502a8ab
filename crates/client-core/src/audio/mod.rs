//! Audio: call-progress tones and ringtone playback
//!
//! Split the way the rest of the core is: logic here, hardware behind
//! traits. [`device`] holds the sink/output seams with their null and mock
//! implementations, [`tones`] synthesizes cadenced progress tones, and
//! [`service`] drives ringtones and alert cadences off the event bus.

pub mod device;
pub mod tones;
pub mod service;

pub use device::{AudioError, AudioOutput, AudioResult, AudioSink, PlaybackId};
pub use service::AudioService;
pub use tones::{ToneDefinition, ToneEngine, ToneLocale};
