//! Call contracts for the three external services.
//!
//! Both the queue workers and the live session manager hold these as
//! `Arc<dyn _>`, so providers can be swapped (or faked in tests) without
//! touching the callers.

use crate::error::AdapterError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use solace_types::{ContextTurn, VoiceProfile};
use std::future::Future;
use std::time::Duration;

/// Text recognised from one audio clip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcription {
    pub text: String,
    /// Recogniser confidence in `0.0..=1.0`.
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub conversation_id: String,
    pub user_text: String,
    /// Earlier turns, oldest first.
    pub context: Vec<ContextTurn>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub tokens_in: Option<u32>,
    pub tokens_out: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedAudio {
    /// Opaque reference into the audio store.
    pub audio_ref: String,
    pub duration_estimate_ms: u64,
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &[u8]) -> Result<Transcription, AdapterError>;
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, AdapterError>;
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        profile: &VoiceProfile,
    ) -> Result<SynthesizedAudio, AdapterError>;
}

/// Bounds an adapter call. Expiry surfaces as [`AdapterError::Timeout`].
pub async fn with_timeout<T, F>(
    service: &'static str,
    timeout: Duration,
    call: F,
) -> Result<T, AdapterError>
where
    F: Future<Output = Result<T, AdapterError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(AdapterError::Timeout { service, timeout }),
    }
}

/// Rough speaking time for `text` at the given speed, used when the provider
/// does not report one.
pub fn estimate_speech_ms(text: &str, speed: f32) -> u64 {
    const MS_PER_WORD: f32 = 400.0;
    let words = text.split_whitespace().count() as f32;
    let speed = if speed > 0.0 { speed } else { 1.0 };
    (words * MS_PER_WORD / speed).round() as u64
}
