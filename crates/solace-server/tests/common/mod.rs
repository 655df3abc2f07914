//! Shared fixtures: a file-backed database, scripted adapters and an
//! `AppState` wired the way the binary wires it.

#![allow(dead_code)]

use async_trait::async_trait;
use solace_conversations::create_conversation;
use solace_db::{create_pool, run_migrations, DbPool, DbRuntimeSettings};
use solace_queue::{Broker, JobEvent};
use solace_server::{
    auth::TokenSigner,
    config::{QueuesConfig, RateLimitConfig},
    notify::LogNotifier,
    pipeline::{Adapters, PipelineContext, PipelineSettings},
    ratelimit::RateLimiter,
    session::{ConnectionHandler, ServerMessage, SessionManager},
    workers::{queue_defaults, Workers},
    AppState,
};
use solace_types::VoiceProfile;
use solace_voice::{
    estimate_speech_ms, AdapterError, AudioStore, Generation, GenerationRequest, Generator,
    SafetyPolicy, SynthesizedAudio, Synthesizer, Transcriber, Transcription,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

pub const SECRET: &str = "test-secret";

/// Returns a fixed transcript.
pub struct ScriptedTranscriber {
    pub text: String,
    pub confidence: f32,
    pub calls: AtomicUsize,
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(&self, _audio: &[u8]) -> Result<Transcription, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Transcription {
            text: self.text.clone(),
            confidence: self.confidence,
        })
    }
}

/// Returns a fixed reply after an optional delay, or fails as unavailable
/// while `fail` is set.
pub struct ScriptedGenerator {
    pub reply: String,
    pub delay: Duration,
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
    /// Context of the most recent request.
    pub last_context: Mutex<Vec<solace_types::ContextTurn>>,
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_context.lock().unwrap() = request.context.clone();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(AdapterError::Unavailable {
                service: "generation",
                message: "scripted outage".to_string(),
            });
        }
        Ok(Generation {
            text: self.reply.clone(),
            tokens_in: Some(12),
            tokens_out: Some(8),
        })
    }
}

/// Writes a small fake clip into the audio store, or fails as unavailable
/// while `fail` is set.
pub struct ScriptedSynthesizer {
    pub store: AudioStore,
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
}

#[async_trait]
impl Synthesizer for ScriptedSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        profile: &VoiceProfile,
    ) -> Result<SynthesizedAudio, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(AdapterError::Unavailable {
                service: "synthesis",
                message: "scripted outage".to_string(),
            });
        }
        let audio_ref = self.store.put(b"ID3-fake-audio", "mp3").await?;
        Ok(SynthesizedAudio {
            audio_ref,
            duration_estimate_ms: estimate_speech_ms(text, profile.speed()),
        })
    }
}

pub struct Options {
    pub transcript: &'static str,
    pub confidence: f32,
    pub reply: &'static str,
    pub generation_delay: Duration,
    pub generation_fails: bool,
    pub synthesis_fails: bool,
    /// Bound on every adapter call.
    pub adapter_timeout: Duration,
    pub blocked_terms: Vec<String>,
    pub rate_limit: RateLimitConfig,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            transcript: "Estou ansiosa",
            confidence: 0.92,
            reply: "Entendo. Vamos respirar juntos por um momento.",
            generation_delay: Duration::ZERO,
            generation_fails: false,
            synthesis_fails: false,
            adapter_timeout: Duration::from_secs(5),
            blocked_terms: Vec::new(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

pub struct Harness {
    pub pool: DbPool,
    pub state: AppState,
    pub transcriber: Arc<ScriptedTranscriber>,
    pub generator: Arc<ScriptedGenerator>,
    pub synthesizer: Arc<ScriptedSynthesizer>,
    pub events: broadcast::Sender<JobEvent>,
    pub shutdown: watch::Sender<bool>,
    pub queues: QueuesConfig,
    _dir: tempfile::TempDir,
}

/// Queue settings with short polls and backoff so retries finish quickly.
pub fn fast_queues() -> QueuesConfig {
    QueuesConfig {
        backoff_base_ms: 5,
        backoff_cap_ms: 50,
        poll_interval_ms: 10,
        job_timeout_secs: 5,
        ..QueuesConfig::default()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with(Options::default())
    }

    pub fn with(options: Options) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("solace.db");
        let pool = create_pool(db_path.to_str().unwrap(), DbRuntimeSettings::default()).unwrap();
        run_migrations(&pool.get().unwrap()).unwrap();

        let audio = AudioStore::new(dir.path().join("audio"));
        let transcriber = Arc::new(ScriptedTranscriber {
            text: options.transcript.to_string(),
            confidence: options.confidence,
            calls: AtomicUsize::new(0),
        });
        let generator = Arc::new(ScriptedGenerator {
            reply: options.reply.to_string(),
            delay: options.generation_delay,
            fail: AtomicBool::new(options.generation_fails),
            calls: AtomicUsize::new(0),
            last_context: Mutex::new(Vec::new()),
        });
        let synthesizer = Arc::new(ScriptedSynthesizer {
            store: audio.clone(),
            fail: AtomicBool::new(options.synthesis_fails),
            calls: AtomicUsize::new(0),
        });

        let queues = fast_queues();
        let broker = Broker::with_defaults(pool.clone(), queue_defaults(&queues));
        let pipeline = PipelineContext {
            pool: pool.clone(),
            broker,
            adapters: Adapters {
                transcriber: transcriber.clone(),
                generator: generator.clone(),
                synthesizer: synthesizer.clone(),
                audio,
                safety: SafetyPolicy::new(&options.blocked_terms),
                timeout: options.adapter_timeout,
            },
            settings: PipelineSettings::default(),
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let tokens = TokenSigner::new(SECRET, Duration::from_secs(3600));
        let rate_limiter = RateLimiter::in_memory(&options.rate_limit);
        let state = AppState {
            sessions: SessionManager::new(
                pipeline.clone(),
                rate_limiter.clone(),
                tokens.clone(),
                shutdown_rx,
            ),
            pipeline,
            rate_limiter,
            tokens,
            failed_threshold: 5,
        };

        Self {
            pool,
            state,
            transcriber,
            generator,
            synthesizer,
            events: broadcast::channel(256).0,
            shutdown,
            queues,
            _dir: dir,
        }
    }

    pub fn token(&self, user_id: &str) -> String {
        self.state.tokens.issue_token(user_id)
    }

    pub fn conversation(&self, conversation_id: &str, user_id: &str) {
        create_conversation(&self.pool.get().unwrap(), conversation_id, user_id).unwrap();
    }

    pub fn spawn_workers(&self) -> Workers {
        Workers::spawn(
            &self.state.pipeline,
            Arc::new(LogNotifier),
            &self.queues,
            self.events.clone(),
            self.shutdown.subscribe(),
        )
    }

    /// An authenticated connection handler plus its outbound receiver.
    pub fn connect(&self, user_id: &str) -> (ConnectionHandler, mpsc::Receiver<ServerMessage>) {
        self.connect_with_buffer(user_id, 64)
    }

    /// Like [`connect`](Self::connect) with an outbound buffer of `capacity`.
    pub fn connect_with_buffer(
        &self,
        user_id: &str,
        capacity: usize,
    ) -> (ConnectionHandler, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        let mut conn = ConnectionHandler::new(self.state.sessions.clone(), tx);
        conn.authenticate(&self.token(user_id)).unwrap();
        (conn, rx)
    }

    /// Serves the router on an ephemeral port.
    pub async fn serve(&self) -> SocketAddr {
        let app = solace_server::app(self.state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        addr
    }
}

/// Next outbound message, failing the test after two seconds.
pub async fn recv(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a session message")
        .expect("outbound channel closed")
}

/// Waits for the first job event matching `pred`.
pub async fn next_event<F>(rx: &mut broadcast::Receiver<JobEvent>, mut pred: F) -> JobEvent
where
    F: FnMut(&JobEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for job event")
}
