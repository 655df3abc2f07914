//! Real-time session management.
//!
//! A [`ConnectionHandler`] owns one connection's state machine
//! (`CONNECTING → AUTHENTICATED → ACTIVE → ENDED`) and talks to the client
//! only through a typed outbound channel, so it can be driven without a
//! socket. The shared [`SessionManager`] holds the live registry and the
//! pipeline collaborators.
//!
//! Live text turns are single-flight per session: a `text` arriving while a
//! turn is in flight is rejected with a `busy` error. The in-flight turn runs
//! on its own task so the connection keeps reading (and can end) meanwhile.

use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use solace_conversations::{self as conversations, CreateMessageParams, EndReason, SessionRecord};
use solace_types::{QueueName, Sender, SessionState, TranscriptionPayload, VoiceProfile};
use solace_voice::{GenerationRequest, FALLBACK_REPLY};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use crate::auth::{AuthError, TokenSigner};
use crate::pipeline::PipelineContext;
use crate::ratelimit::{RateDecision, RateLimitCategory, RateLimiter};

/// Largest decoded audio chunk accepted (512 KiB).
pub const MAX_CHUNK_BYTES: usize = 512 * 1024;

/// Largest text turn accepted (4 KiB).
pub const MAX_TEXT_BYTES: usize = 4 * 1024;

/// How long an acknowledgment may wait for room in the outbound buffer
/// before the connection is closed as unresponsive.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Messages sent by the client. All carry a `type` discriminator.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Start { conversation_id: String },
    /// Base64-encoded audio.
    Chunk { audio: String },
    Text { content: String },
    End,
}

/// Messages sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    SessionStarted {
        session_id: String,
    },
    ChunkReceived {
        index: u32,
    },
    Reply {
        message_id: String,
        text: String,
        audio_ref: Option<String>,
        duration_estimate: Option<u64>,
    },
    SessionEnded {
        duration_ms: u64,
        chunks_processed: u32,
    },
    Error {
        message: String,
    },
    RateLimited {
        limit: u32,
        remaining: u32,
        reset_at: i64,
    },
}

impl ServerMessage {
    fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    fn rate_limited(decision: &RateDecision) -> Self {
        Self::RateLimited {
            limit: decision.limit,
            remaining: decision.remaining,
            reset_at: decision.reset_at,
        }
    }
}

/// Registry entry of a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSession {
    pub user_id: String,
    pub conversation_id: String,
    pub started_at: DateTime<Utc>,
}

struct Inner {
    ctx: PipelineContext,
    rate_limiter: RateLimiter,
    tokens: TokenSigner,
    live: RwLock<HashMap<Uuid, LiveSession>>,
    shutdown: watch::Receiver<bool>,
}

/// Process-wide session registry and collaborators.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        ctx: PipelineContext,
        rate_limiter: RateLimiter,
        tokens: TokenSigner,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                rate_limiter,
                tokens,
                live: RwLock::new(HashMap::new()),
                shutdown,
            }),
        }
    }

    pub async fn is_live(&self, session_id: Uuid) -> bool {
        self.inner.live.read().await.contains_key(&session_id)
    }

    pub async fn live_count(&self) -> usize {
        self.inner.live.read().await.len()
    }

    /// Receiver that flips to `true` when the server shuts down.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.clone()
    }

    async fn register(&self, session_id: Uuid, session: LiveSession) {
        self.inner.live.write().await.insert(session_id, session);
    }

    async fn unregister(&self, session_id: Uuid) -> bool {
        self.inner.live.write().await.remove(&session_id).is_some()
    }
}

/// What the transport should do after a message was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

struct ActiveSession {
    id: Uuid,
    conversation_id: String,
    started_at: DateTime<Utc>,
    started: Instant,
    chunks: Vec<Vec<u8>>,
    buffered_bytes: usize,
    turn_lock: Arc<Mutex<()>>,
}

/// One connection's state machine.
pub struct ConnectionHandler {
    manager: SessionManager,
    outbound: mpsc::Sender<ServerMessage>,
    state: SessionState,
    user_id: Option<String>,
    session: Option<ActiveSession>,
    send_timeout: Duration,
    /// Set once an outbound message could not be delivered.
    stalled: AtomicBool,
}

impl ConnectionHandler {
    pub fn new(manager: SessionManager, outbound: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            manager,
            outbound,
            state: SessionState::Connecting,
            user_id: None,
            session: None,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            stalled: AtomicBool::new(false),
        }
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session.as_ref().map(|s| s.id)
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(self.state.can_transition_to(next));
        tracing::debug!(from = %self.state, to = %next, "session state change");
        self.state = next;
    }

    /// Queues a message for the client, waiting for buffer space so a slow
    /// reader slows this connection down instead of losing messages.
    ///
    /// A message that cannot be queued within the send timeout, or after the
    /// transport is gone, marks the connection stalled; the next
    /// [`handle`](Self::handle) then returns [`Flow::Close`].
    pub async fn send(&self, message: ServerMessage) -> bool {
        match self.outbound.send_timeout(message, self.send_timeout).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    session_id = ?self.session_id(),
                    "client is not draining session messages, closing: {}",
                    e
                );
                self.stalled.store(true, Ordering::Relaxed);
                false
            }
        }
    }

    fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::Relaxed)
    }

    /// `CONNECTING → AUTHENTICATED`. On failure no session is ever created.
    pub fn authenticate(&mut self, token: &str) -> Result<(), AuthError> {
        if self.state != SessionState::Connecting {
            return Ok(());
        }
        let user_id = self.manager.inner.tokens.verify_token(token)?;
        self.user_id = Some(user_id);
        self.transition(SessionState::Authenticated);
        Ok(())
    }

    /// Parses and handles one raw text frame.
    pub async fn handle_frame(&mut self, raw: &str) -> Flow {
        match serde_json::from_str::<ClientMessage>(raw) {
            Ok(message) => self.handle(message).await,
            Err(e) => {
                if self.send(ServerMessage::error(format!("invalid message: {}", e))).await {
                    Flow::Continue
                } else {
                    Flow::Close
                }
            }
        }
    }

    pub async fn handle(&mut self, message: ClientMessage) -> Flow {
        let flow = self.dispatch(message).await;
        if self.is_stalled() {
            Flow::Close
        } else {
            flow
        }
    }

    async fn dispatch(&mut self, message: ClientMessage) -> Flow {
        match (self.state, message) {
            (SessionState::Connecting, _) => {
                self.send(ServerMessage::error("not authenticated")).await;
                Flow::Close
            }
            (SessionState::Authenticated, ClientMessage::Start { conversation_id }) => {
                self.start(conversation_id).await
            }
            (SessionState::Authenticated, _) => {
                self.send(ServerMessage::error("no active session, send start first")).await;
                Flow::Continue
            }
            (SessionState::Active, ClientMessage::Start { .. }) => {
                self.send(ServerMessage::error("session already started")).await;
                Flow::Continue
            }
            (SessionState::Active, ClientMessage::Chunk { audio }) => {
                self.chunk(&audio).await;
                Flow::Continue
            }
            (SessionState::Active, ClientMessage::Text { content }) => {
                self.text(content).await;
                Flow::Continue
            }
            (SessionState::Active, ClientMessage::End) => {
                if let Some(ended) = self.finish(EndReason::Client).await {
                    self.send(ended).await;
                }
                Flow::Close
            }
            (SessionState::Ended, _) => {
                self.send(ServerMessage::error("session ended")).await;
                Flow::Close
            }
        }
    }

    async fn start(&mut self, conversation_id: String) -> Flow {
        let Some(user_id) = self.user_id.clone() else {
            return Flow::Close;
        };
        let manager = self.manager.clone();

        let decision = manager
            .inner
            .rate_limiter
            .check(RateLimitCategory::Voice, &format!("user:{}", user_id))
            .await;
        if !decision.allowed {
            self.send(ServerMessage::rate_limited(&decision)).await;
            return Flow::Continue;
        }

        let owner_check = {
            let (conversation_id, user_id) = (conversation_id.clone(), user_id.clone());
            manager
                .inner
                .ctx
                .db(move |conn| conversations::is_owner(conn, &conversation_id, &user_id))
                .await
        };
        match owner_check {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(
                    user_id = %user_id,
                    conversation_id = %conversation_id,
                    "session start refused, caller does not own conversation"
                );
                self.send(ServerMessage::error("not authorized for this conversation")).await;
                return Flow::Close;
            }
            Err(e) => {
                tracing::error!(conversation_id = %conversation_id, "ownership check failed: {}", e);
                self.send(ServerMessage::error("internal error, please retry")).await;
                return Flow::Continue;
            }
        }

        let session = ActiveSession {
            id: Uuid::new_v4(),
            conversation_id: conversation_id.clone(),
            started_at: Utc::now(),
            started: Instant::now(),
            chunks: Vec::new(),
            buffered_bytes: 0,
            turn_lock: Arc::new(Mutex::new(())),
        };
        manager
            .register(
                session.id,
                LiveSession {
                    user_id: user_id.clone(),
                    conversation_id: conversation_id.clone(),
                    started_at: session.started_at,
                },
            )
            .await;
        tracing::info!(
            session_id = %session.id,
            user_id = %user_id,
            conversation_id = %conversation_id,
            "session started"
        );

        let session_id = session.id.to_string();
        self.session = Some(session);
        self.transition(SessionState::Active);
        self.send(ServerMessage::SessionStarted { session_id }).await;
        Flow::Continue
    }

    async fn chunk(&mut self, encoded: &str) {
        let audio = match base64::engine::general_purpose::STANDARD.decode(encoded.trim()) {
            Ok(audio) if !audio.is_empty() => audio,
            Ok(_) => {
                self.send(ServerMessage::error("empty audio chunk")).await;
                return;
            }
            Err(_) => {
                self.send(ServerMessage::error("audio chunk is not valid base64")).await;
                return;
            }
        };
        if audio.len() > MAX_CHUNK_BYTES {
            self.send(ServerMessage::error(format!(
                "audio chunk exceeds maximum size of {} bytes",
                MAX_CHUNK_BYTES
            ))).await;
            return;
        }
        let buffered = self.session.as_ref().map_or(0, |s| s.buffered_bytes);
        if buffered + audio.len() > solace_voice::audio::MAX_AUDIO_BYTES {
            self.send(ServerMessage::error("session audio buffer is full")).await;
            return;
        }

        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.buffered_bytes += audio.len();
        session.chunks.push(audio);
        let index = (session.chunks.len() - 1) as u32;
        self.send(ServerMessage::ChunkReceived { index }).await;
    }

    async fn text(&mut self, content: String) {
        let content = content.trim().to_string();
        if content.is_empty() {
            self.send(ServerMessage::error("text must not be empty")).await;
            return;
        }
        if content.len() > MAX_TEXT_BYTES {
            self.send(ServerMessage::error(format!(
                "text exceeds maximum length of {} bytes",
                MAX_TEXT_BYTES
            ))).await;
            return;
        }
        let (Some(session), Some(user_id)) = (self.session.as_ref(), self.user_id.clone()) else {
            return;
        };

        let Ok(guard) = session.turn_lock.clone().try_lock_owned() else {
            self.send(ServerMessage::error("busy: a reply is still being prepared")).await;
            return;
        };

        let decision = self
            .manager
            .inner
            .rate_limiter
            .check(RateLimitCategory::Message, &format!("user:{}", user_id))
            .await;
        if !decision.allowed {
            self.send(ServerMessage::rate_limited(&decision)).await;
            return;
        }

        let turn = LiveTurn {
            manager: self.manager.clone(),
            outbound: self.outbound.clone(),
            session_id: session.id,
            conversation_id: session.conversation_id.clone(),
            user_id,
            content,
        };
        tokio::spawn(turn.run(guard));
    }

    /// `ACTIVE → ENDED`. Flushes buffered audio to the durable path, persists
    /// the terminal record and removes the session from the registry.
    ///
    /// Returns the `session_ended` message, or `None` if no session was
    /// active.
    pub async fn finish(&mut self, reason: EndReason) -> Option<ServerMessage> {
        if self.state != SessionState::Active {
            return None;
        }
        let session = self.session.take()?;
        let user_id = self.user_id.clone().unwrap_or_default();
        self.transition(SessionState::Ended);

        // Unregister first so in-flight turns stop issuing new calls.
        self.manager.unregister(session.id).await;

        let duration_ms = session.started.elapsed().as_millis() as u64;
        let chunks_processed = session.chunks.len() as u32;
        let ctx = &self.manager.inner.ctx;

        if !session.chunks.is_empty() {
            let audio = session.chunks.concat();
            if let Err(e) = submit_buffered_audio(ctx, &session, &user_id, audio).await {
                tracing::warn!(
                    session_id = %session.id,
                    "could not submit buffered audio for transcription: {}",
                    e
                );
            }
        }

        let record = SessionRecord {
            session_id: session.id.to_string(),
            user_id: user_id.clone(),
            conversation_id: session.conversation_id.clone(),
            state: SessionState::Ended,
            started_at: session
                .started_at
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            ended_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            duration_ms,
            chunks_processed,
            end_reason: reason.as_str().to_string(),
        };
        if let Err(e) = ctx
            .db(move |conn| conversations::record_session(conn, &record))
            .await
        {
            tracing::error!(session_id = %session.id, "failed to persist session record: {}", e);
        }

        tracing::info!(
            session_id = %session.id,
            user_id = %user_id,
            reason = reason.as_str(),
            duration_ms,
            chunks_processed,
            "session ended"
        );
        Some(ServerMessage::SessionEnded {
            duration_ms,
            chunks_processed,
        })
    }

    /// Connection lost. Performs the same cleanup as `end`, best-effort.
    pub async fn disconnect(&mut self) {
        self.finish(EndReason::Disconnect).await;
    }
}

async fn submit_buffered_audio(
    ctx: &PipelineContext,
    session: &ActiveSession,
    user_id: &str,
    audio: Vec<u8>,
) -> Result<(), String> {
    let audio_ref = ctx
        .adapters
        .audio
        .put(&audio, "bin")
        .await
        .map_err(|e| e.to_string())?;

    let message_id = Uuid::new_v4().to_string();
    let params = CreateMessageParams {
        audio_ref: Some(audio_ref.clone()),
        metadata: json!({ "sessionId": session.id.to_string() }),
        ..CreateMessageParams::user(&session.conversation_id, &message_id)
    };
    ctx.db(move |conn| conversations::create_message(conn, &params))
        .await
        .map_err(|e| e.to_string())?;

    let job = ctx
        .broker
        .enqueue(
            QueueName::Transcription,
            &TranscriptionPayload {
                message_id,
                audio_ref,
                conversation_id: session.conversation_id.clone(),
                user_id: user_id.to_string(),
            },
        )
        .await
        .map_err(|e| e.to_string())?;
    tracing::debug!(session_id = %session.id, job_id = job.id, "buffered audio queued for transcription");
    Ok(())
}

/// One in-flight live text turn.
struct LiveTurn {
    manager: SessionManager,
    outbound: mpsc::Sender<ServerMessage>,
    session_id: Uuid,
    conversation_id: String,
    user_id: String,
    content: String,
}

impl LiveTurn {
    async fn run(self, _guard: OwnedMutexGuard<()>) {
        let session_id = self.session_id;
        match self.execute().await {
            Ok(Some(reply)) => {
                if self.manager.is_live(session_id).await {
                    // The reply is already persisted; wait for room rather
                    // than drop it.
                    if self.outbound.send(reply).await.is_err() {
                        tracing::warn!(
                            session_id = %session_id,
                            "connection closed before reply was delivered"
                        );
                    }
                } else {
                    tracing::debug!(session_id = %session_id, "session ended, discarding reply");
                }
            }
            Ok(None) => {
                tracing::debug!(session_id = %session_id, "session ended mid-turn, turn abandoned");
            }
            Err(message) => {
                if self.manager.is_live(session_id).await
                    && self.outbound.send(ServerMessage::error(message)).await.is_err()
                {
                    tracing::debug!(
                        session_id = %session_id,
                        "connection closed before error was delivered"
                    );
                }
            }
        }
    }

    /// Returns `Ok(None)` when the session went away before the next call.
    async fn execute(&self) -> Result<Option<ServerMessage>, String> {
        let ctx = &self.manager.inner.ctx;
        let session_id = self.session_id;

        let message_id = Uuid::new_v4().to_string();
        let user_turn = CreateMessageParams {
            text: Some(self.content.clone()),
            metadata: json!({ "sessionId": session_id.to_string() }),
            ..CreateMessageParams::user(&self.conversation_id, &message_id)
        };
        let turns = ctx.settings.context_turns;
        let (conversation_id, answering) = (self.conversation_id.clone(), message_id.clone());
        let context = ctx
            .db(move |conn| {
                conversations::create_message(conn, &user_turn)?;
                conversations::recent_context(conn, &conversation_id, &answering, turns)
            })
            .await
            .map_err(|e| {
                tracing::error!(session_id = %session_id, "failed to persist live turn: {}", e);
                "internal error, please retry".to_string()
            })?;

        if !self.manager.is_live(session_id).await {
            return Ok(None);
        }
        let generation = ctx
            .adapters
            .generate(&GenerationRequest {
                conversation_id: self.conversation_id.clone(),
                user_text: self.content.clone(),
                context,
            })
            .await
            .map_err(|e| {
                tracing::warn!(session_id = %session_id, "live generation failed: {}", e);
                format!("reply generation failed: {}", e)
            })?;
        if generation.text.is_empty() {
            return Err("reply generation returned no text".to_string());
        }

        let reply_id = Uuid::new_v4().to_string();
        let rejected = ctx.adapters.safety.check(&generation.text).is_err();
        let reply_text = if rejected {
            FALLBACK_REPLY.to_string()
        } else {
            generation.text.clone()
        };
        let reply = CreateMessageParams {
            sender: Sender::System,
            text: Some(reply_text.clone()),
            tokens_in: generation.tokens_in,
            tokens_out: generation.tokens_out,
            metadata: json!({
                "sessionId": session_id.to_string(),
                "inReplyTo": message_id,
                "safetyRejected": rejected,
            }),
            ..CreateMessageParams::user(&self.conversation_id, &reply_id)
        };
        ctx.db(move |conn| conversations::create_message(conn, &reply))
            .await
            .map_err(|e| {
                tracing::error!(session_id = %session_id, "failed to persist live reply: {}", e);
                "internal error, please retry".to_string()
            })?;

        if rejected {
            return Ok(Some(ServerMessage::Reply {
                message_id: reply_id,
                text: reply_text,
                audio_ref: None,
                duration_estimate: None,
            }));
        }

        if !self.manager.is_live(session_id).await {
            return Ok(None);
        }
        let audio = ctx
            .adapters
            .synthesize(&reply_text, &VoiceProfile::default())
            .await
            .map_err(|e| {
                tracing::warn!(session_id = %session_id, "live synthesis failed: {}", e);
                format!("speech synthesis failed: {}", e)
            })?;

        let (id, audio_ref) = (reply_id.clone(), audio.audio_ref.clone());
        ctx.db(move |conn| conversations::attach_audio(conn, &id, &audio_ref))
            .await
            .map_err(|e| {
                tracing::error!(session_id = %session_id, "failed to attach reply audio: {}", e);
                "internal error, please retry".to_string()
            })?;

        Ok(Some(ServerMessage::Reply {
            message_id: reply_id,
            text: reply_text,
            audio_ref: Some(audio.audio_ref),
            duration_estimate: Some(audio.duration_estimate_ms),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_use_type_tags() {
        let start: ClientMessage =
            serde_json::from_str(r#"{"type":"start","conversationId":"c1"}"#).unwrap();
        assert_eq!(
            start,
            ClientMessage::Start {
                conversation_id: "c1".to_string()
            }
        );
        let end: ClientMessage = serde_json::from_str(r#"{"type":"end"}"#).unwrap();
        assert_eq!(end, ClientMessage::End);
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"dance"}"#).is_err());
    }

    #[test]
    fn server_messages_serialize_camel_case() {
        let json = serde_json::to_value(ServerMessage::SessionEnded {
            duration_ms: 1200,
            chunks_processed: 3,
        })
        .unwrap();
        assert_eq!(
            json,
            json!({"type": "session_ended", "durationMs": 1200, "chunksProcessed": 3})
        );

        let json = serde_json::to_value(ServerMessage::Reply {
            message_id: "r1".to_string(),
            text: "Olá".to_string(),
            audio_ref: Some("a.mp3".to_string()),
            duration_estimate: Some(800),
        })
        .unwrap();
        assert_eq!(json["type"], "reply");
        assert_eq!(json["audioRef"], "a.mp3");
        assert_eq!(json["durationEstimate"], 800);
    }
}
