//! Solace server library logic.
//!
//! Hosts the two turn-processing paths: the durable queue pipeline
//! (Transcription → Generation → Synthesis, plus notifications) and the
//! real-time WebSocket sessions, behind a shared rate limiter.

pub mod api;
pub mod api_ws;
pub mod auth;
pub mod background;
pub mod config;
pub mod middleware;
pub mod notify;
pub mod pipeline;
pub mod ratelimit;
pub mod session;
pub mod workers;

use async_trait::async_trait;
use auth::TokenSigner;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Router,
};
use config::AdaptersConfig;
use notify::{LogNotifier, Notifier, WebhookNotifier};
use pipeline::{Adapters, PipelineContext};
use ratelimit::RateLimiter;
use session::SessionManager;
use solace_types::VoiceProfile;
use solace_voice::{
    AdapterError, AudioStore, Endpoint, Generation, GenerationRequest, Generator, HttpGenerator,
    HttpSynthesizer, HttpTranscriber, PiperSynthesizer, SafetyPolicy, SynthesizedAudio,
    Synthesizer, Transcriber, Transcription,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Pool, broker, adapters and settings shared with the workers.
    pub pipeline: PipelineContext,
    pub rate_limiter: RateLimiter,
    /// Verifies bearer and session tokens.
    pub tokens: TokenSigner,
    /// Live real-time sessions.
    pub sessions: SessionManager,
    /// Dead-job count above which a queue reports unhealthy.
    pub failed_threshold: u64,
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Maximum request body size (64 KiB) outside the audio upload route.
const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

/// Stand-in for an adapter with no configured endpoint. Every call fails as
/// unavailable, so jobs retry and eventually dead-letter instead of being
/// silently dropped.
#[derive(Debug, Clone, Copy)]
pub struct Unconfigured {
    service: &'static str,
}

impl Unconfigured {
    fn error(&self) -> AdapterError {
        AdapterError::Unavailable {
            service: self.service,
            message: "no endpoint configured".to_string(),
        }
    }
}

#[async_trait]
impl Transcriber for Unconfigured {
    async fn transcribe(&self, _audio: &[u8]) -> Result<Transcription, AdapterError> {
        Err(self.error())
    }
}

#[async_trait]
impl Generator for Unconfigured {
    async fn generate(&self, _request: &GenerationRequest) -> Result<Generation, AdapterError> {
        Err(self.error())
    }
}

#[async_trait]
impl Synthesizer for Unconfigured {
    async fn synthesize(
        &self,
        _text: &str,
        _profile: &VoiceProfile,
    ) -> Result<SynthesizedAudio, AdapterError> {
        Err(self.error())
    }
}

fn endpoint(url: &str, api_key: Option<&String>, config: &AdaptersConfig) -> Endpoint {
    let endpoint = Endpoint::new(url).with_timeout(config.timeout());
    match api_key {
        Some(key) if !key.is_empty() => endpoint.with_api_key(key),
        _ => endpoint,
    }
}

/// Builds the external adapters from configuration.
pub fn build_adapters(config: &AdaptersConfig) -> Adapters {
    let audio = AudioStore::new(&config.audio_dir);

    let transcriber: Arc<dyn Transcriber> = match &config.transcription_url {
        Some(url) => Arc::new(HttpTranscriber::new(endpoint(
            url,
            config.transcription_api_key.as_ref(),
            config,
        ))),
        None => {
            tracing::warn!("no transcription endpoint configured, voice turns will dead-letter");
            Arc::new(Unconfigured {
                service: "transcription",
            })
        }
    };

    let generator: Arc<dyn Generator> = match &config.generation_url {
        Some(url) => {
            let generator = HttpGenerator::new(
                endpoint(url, config.generation_api_key.as_ref(), config),
                &config.generation_model,
            );
            match &config.system_prompt {
                Some(prompt) => Arc::new(generator.with_system_prompt(prompt)),
                None => Arc::new(generator),
            }
        }
        None => {
            tracing::warn!("no generation endpoint configured, replies will dead-letter");
            Arc::new(Unconfigured {
                service: "generation",
            })
        }
    };

    let synthesizer: Arc<dyn Synthesizer> = match (&config.piper_binary, &config.synthesis_url) {
        (Some(binary), _) => Arc::new(PiperSynthesizer::new(
            binary,
            &config.voices_dir,
            audio.clone(),
            config.timeout(),
        )),
        (None, Some(url)) => Arc::new(HttpSynthesizer::new(
            endpoint(url, config.synthesis_api_key.as_ref(), config),
            audio.clone(),
        )),
        (None, None) => {
            tracing::warn!("no synthesis backend configured, reply audio will dead-letter");
            Arc::new(Unconfigured {
                service: "synthesis",
            })
        }
    };

    Adapters {
        transcriber,
        generator,
        synthesizer,
        audio,
        safety: SafetyPolicy::new(&config.blocked_terms),
        timeout: config.timeout(),
    }
}

/// Picks the notification collaborator.
pub fn build_notifier(config: &AdaptersConfig) -> Arc<dyn Notifier> {
    match &config.notification_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url, config.timeout())),
        None => Arc::new(LogNotifier),
    }
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route(
            "/api/conversations/{conversationId}/messages",
            post(api::post_message_handler).get(api::list_messages_handler),
        )
        .route("/api/queues", get(api::list_queues_handler))
        .route("/api/queues/{queue}/dead", get(api::list_dead_handler))
        .route(
            "/api/queues/{queue}/dead/{jobId}/retry",
            post(api::retry_dead_handler),
        )
        .layer(axum::middleware::from_fn(auth::auth_middleware));

    // Audio uploads need a larger body limit; the handler enforces the exact cap.
    let audio_routes = Router::new()
        .route(
            "/api/conversations/{conversationId}/audio",
            post(api::post_audio_handler),
        )
        .layer(DefaultBodyLimit::max(solace_voice::audio::MAX_AUDIO_BYTES + 1))
        .layer(axum::middleware::from_fn(auth::auth_middleware));

    Router::new()
        .route("/health", get(api::health_handler))
        .route("/ws", get(api_ws::ws_handler))
        .merge(protected_routes)
        .merge(audio_routes)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(axum::middleware::from_fn(middleware::rate_limit_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_adapters_fail_as_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let config = AdaptersConfig {
            audio_dir: dir.path().to_string_lossy().into_owned(),
            ..AdaptersConfig::default()
        };
        let adapters = build_adapters(&config);

        let err = adapters
            .generate(&GenerationRequest {
                conversation_id: "c1".to_string(),
                user_text: "oi".to_string(),
                context: Vec::new(),
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(adapters.transcribe(b"pcm").await.unwrap_err().is_transient());
    }
}
