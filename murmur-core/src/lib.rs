//! # murmur-core
//!
//! Audio data-plane of a voice assistant: byte rings, audio streams,
//! network playback with playlists, and the voice capture pipeline.
//!
//! ## Architecture
//!
//! ```text
//! Capture:
//!   AudioHal ─► I2S reader AudioStream ─► raw-mic ring ─► DspPipeline
//!                                                           │ resample, wake word, preroll
//!                                                           ▼
//!                                                   SpeechRecognizer
//!
//! Playback:
//!   HttpPlaybackStream / FsStream ─► reader AudioStream ─► anchored ring
//!                                                            │ markers in-band
//!                                                            ▼
//!                                      writer AudioStream ─► I2S ─► AudioHal
//! ```
//!
//! Every ring has exactly one producer and one consumer half; anything
//! else steers it through a cloneable control handle.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod buffering;
pub mod config;
pub mod dsp;
pub mod error;
pub mod events;
pub mod hal;
pub mod notify;
pub mod protocol;
pub mod stream;

// Convenience re-exports for downstream crates
pub use buffering::{
    AnchoredConsumer, AnchoredProducer, AnchoredRingBuffer, RingBuffer, RingConsumer, RingControl,
    RingProducer, Wait,
};
pub use config::AudioSettings;
pub use dsp::{DspConfig, DspHandle, DspParts, DspPipeline};
pub use error::{MurmurError, Result};
pub use events::{CaptureState, CaptureStateEvent, PipelineStatus, PipelineStatusEvent};
pub use hal::{AudioHal, MediaHal};
pub use protocol::MultipartParser;
pub use stream::http::{HttpConfig, HttpPlaybackStream};
pub use stream::{AudioStream, StreamBackend, StreamEvent, StreamOptions, StreamState};

#[cfg(feature = "audio-cpal")]
pub use hal::cpal::CpalHal;
