//! External service adapters for the Solace pipeline.
//!
//! Transcription, generation and synthesis are third-party services. This
//! crate defines their call contracts ([`Transcriber`], [`Generator`],
//! [`Synthesizer`]), HTTP implementations of each, a local Piper
//! synthesizer, the file-backed [`AudioStore`] that audio references point
//! into, and the content-safety gate applied to generated replies.
//!
//! Every fault is reported as an [`AdapterError`]; callers use
//! [`AdapterError::is_transient`] to decide between retrying and giving up.

pub mod adapter;
pub mod audio;
pub mod error;
pub mod http;
pub mod piper;
pub mod safety;

pub use adapter::{
    estimate_speech_ms, with_timeout, Generation, GenerationRequest, Generator, SynthesizedAudio,
    Synthesizer, Transcriber, Transcription,
};
pub use audio::AudioStore;
pub use error::AdapterError;
pub use http::{Endpoint, HttpGenerator, HttpSynthesizer, HttpTranscriber};
pub use piper::PiperSynthesizer;
pub use safety::{SafetyPolicy, FALLBACK_REPLY};
