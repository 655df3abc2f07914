//! Stage handlers for the durable path.
//!
//! Transcription → Generation → Synthesis, each a queue hop. A handler
//! returns the next stage's job instead of enqueueing it, so the broker can
//! commit the completion and the successor in one transaction.

use async_trait::async_trait;
use rusqlite::Connection;
use serde_json::json;
use solace_conversations::{self as conversations, ConversationError, CreateMessageParams};
use solace_db::DbPool;
use solace_queue::{Broker, Job, JobError, JobHandler, NextJob, StageOutcome};
use solace_types::{
    ContextTurn, GenerationPayload, NotificationKind, NotificationPayload, QueueName, Sender,
    SynthesisPayload, TranscriptionPayload, VoiceProfile,
};
use solace_voice::{
    with_timeout, AdapterError, AudioStore, Generation, GenerationRequest, Generator,
    SafetyPolicy, SynthesizedAudio, Synthesizer, Transcriber, Transcription, FALLBACK_REPLY,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::notify::Notifier;

/// The three external services plus the audio store they share.
#[derive(Clone)]
pub struct Adapters {
    pub transcriber: Arc<dyn Transcriber>,
    pub generator: Arc<dyn Generator>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub audio: AudioStore,
    pub safety: SafetyPolicy,
    /// Bound on every adapter call.
    pub timeout: Duration,
}

impl Adapters {
    pub async fn transcribe(&self, audio: &[u8]) -> Result<Transcription, AdapterError> {
        with_timeout(
            "transcription",
            self.timeout,
            self.transcriber.transcribe(audio),
        )
        .await
    }

    pub async fn generate(&self, request: &GenerationRequest) -> Result<Generation, AdapterError> {
        with_timeout("generation", self.timeout, self.generator.generate(request)).await
    }

    pub async fn synthesize(
        &self,
        text: &str,
        profile: &VoiceProfile,
    ) -> Result<SynthesizedAudio, AdapterError> {
        with_timeout(
            "synthesis",
            self.timeout,
            self.synthesizer.synthesize(text, profile),
        )
        .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineSettings {
    /// Transcriptions below this confidence end the turn.
    pub min_confidence: f32,
    pub context_turns: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            context_turns: 10,
        }
    }
}

/// Everything a stage (or a live turn) needs. Constructed once by the entry
/// point and cloned into each consumer.
#[derive(Clone)]
pub struct PipelineContext {
    pub pool: DbPool,
    pub broker: Broker,
    pub adapters: Adapters,
    pub settings: PipelineSettings,
}

/// Failure of a blocking conversation-store call.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error(transparent)]
    Conversation(#[from] ConversationError),
    #[error("blocking task failed: {0}")]
    Join(String),
}

impl From<StoreError> for JobError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conversation(ConversationError::NotFound(_))
            | StoreError::Conversation(ConversationError::Json(_)) => {
                JobError::Permanent(e.to_string())
            }
            _ => JobError::Transient(e.to_string()),
        }
    }
}

impl PipelineContext {
    /// Runs a conversation-store call on the blocking pool.
    pub async fn db<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, ConversationError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            Ok(op(&conn)?)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

/// Deterministic id of the reply to `message_id`, so a retried generation
/// converges on one stored reply.
pub fn reply_message_id(message_id: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("reply:{}", message_id).as_bytes()).to_string()
}

fn adapter_fault(e: AdapterError) -> JobError {
    if e.is_transient() {
        JobError::Transient(e.to_string())
    } else {
        JobError::Permanent(e.to_string())
    }
}

fn bad_payload(e: serde_json::Error) -> JobError {
    JobError::Permanent(format!("invalid payload: {}", e))
}

fn storage_fault(e: std::io::Error) -> JobError {
    match e.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::InvalidInput => {
            JobError::Permanent(format!("audio unavailable: {}", e))
        }
        _ => JobError::Transient(format!("audio storage error: {}", e)),
    }
}

/// Enqueues a best-effort push notification telling the user a turn could
/// not be completed.
async fn notify_dead_turn(ctx: &PipelineContext, job: &Job, error: &str) {
    if error == AdapterError::SafetyRejected.to_string() {
        // The user already received the fallback reply.
        return;
    }
    let Some(user_id) = job.payload.get("userId").and_then(|v| v.as_str()) else {
        return;
    };
    let notification = NotificationPayload {
        kind: NotificationKind::Push,
        recipient: user_id.to_string(),
        subject: Some("We couldn't finish your reply".to_string()),
        message: "Something went wrong while preparing a response. Please try again."
            .to_string(),
        data: Some(json!({
            "conversationId": job.payload.get("conversationId"),
            "messageId": job.payload.get("messageId"),
            "stage": job.queue.as_str(),
            "jobId": job.id,
        })),
    };
    if let Err(e) = ctx.broker.enqueue(QueueName::Notification, &notification).await {
        tracing::warn!(job_id = job.id, queue = %job.queue, "failed to enqueue failure notification: {}", e);
    }
}

/// Audio → text. Chains a generation job when the transcription is
/// confident enough.
pub struct TranscriptionStage {
    ctx: PipelineContext,
}

impl TranscriptionStage {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl JobHandler for TranscriptionStage {
    async fn handle(&self, job: &Job) -> Result<StageOutcome, JobError> {
        let payload: TranscriptionPayload = job.payload_as().map_err(bad_payload)?;
        let audio = self
            .ctx
            .adapters
            .audio
            .get(&payload.audio_ref)
            .await
            .map_err(storage_fault)?;

        let transcription = self
            .ctx
            .adapters
            .transcribe(&audio)
            .await
            .map_err(adapter_fault)?;

        let min_confidence = self.ctx.settings.min_confidence;
        if transcription.text.is_empty() || transcription.confidence < min_confidence {
            tracing::info!(
                job_id = job.id,
                message_id = %payload.message_id,
                confidence = transcription.confidence,
                min_confidence,
                "transcription empty or below confidence threshold, ending turn"
            );
            return Ok(StageOutcome::done());
        }

        let (message_id, text) = (payload.message_id.clone(), transcription.text.clone());
        self.ctx
            .db(move |conn| conversations::set_message_text(conn, &message_id, &text))
            .await?;

        let next = NextJob::new(
            QueueName::Generation,
            &GenerationPayload {
                conversation_id: payload.conversation_id,
                message_id: payload.message_id,
                user_text: transcription.text,
                user_id: payload.user_id,
                context: None,
            },
        )
        .map_err(bad_payload)?;
        Ok(StageOutcome::then(next))
    }

    async fn on_dead(&self, job: &Job, error: &str) {
        notify_dead_turn(&self.ctx, job, error).await;
    }
}

/// User text → reply text. Chains a synthesis job for the reply.
pub struct GenerationStage {
    ctx: PipelineContext,
}

impl GenerationStage {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl JobHandler for GenerationStage {
    async fn handle(&self, job: &Job) -> Result<StageOutcome, JobError> {
        let payload: GenerationPayload = job.payload_as().map_err(bad_payload)?;

        let context: Vec<ContextTurn> = match payload.context.clone() {
            Some(context) => context,
            None => {
                let (conversation_id, message_id) =
                    (payload.conversation_id.clone(), payload.message_id.clone());
                let turns = self.ctx.settings.context_turns;
                self.ctx
                    .db(move |conn| {
                        conversations::recent_context(conn, &conversation_id, &message_id, turns)
                    })
                    .await?
            }
        };

        let generation = self
            .ctx
            .adapters
            .generate(&GenerationRequest {
                conversation_id: payload.conversation_id.clone(),
                user_text: payload.user_text.clone(),
                context,
            })
            .await
            .map_err(adapter_fault)?;

        if generation.text.is_empty() {
            tracing::info!(
                job_id = job.id,
                message_id = %payload.message_id,
                "generator returned an empty reply, ending turn"
            );
            return Ok(StageOutcome::done());
        }

        let reply_id = reply_message_id(&payload.message_id);
        if let Err(rejected) = self.ctx.adapters.safety.check(&generation.text) {
            let params = CreateMessageParams {
                sender: Sender::System,
                text: Some(FALLBACK_REPLY.to_string()),
                metadata: json!({ "safetyRejected": true, "inReplyTo": payload.message_id }),
                ..CreateMessageParams::user(&payload.conversation_id, &reply_id)
            };
            self.ctx
                .db(move |conn| conversations::create_message_once(conn, &params))
                .await?;
            return Err(adapter_fault(rejected));
        }

        let params = CreateMessageParams {
            sender: Sender::System,
            text: Some(generation.text.clone()),
            tokens_in: generation.tokens_in,
            tokens_out: generation.tokens_out,
            metadata: json!({ "inReplyTo": payload.message_id }),
            ..CreateMessageParams::user(&payload.conversation_id, &reply_id)
        };
        let reply = self
            .ctx
            .db(move |conn| conversations::create_message_once(conn, &params))
            .await?;

        let next = NextJob::new(
            QueueName::Synthesis,
            &SynthesisPayload {
                message_id: reply.message_id,
                text: reply.text.unwrap_or(generation.text),
                conversation_id: payload.conversation_id,
                user_id: payload.user_id,
                voice_settings: None,
            },
        )
        .map_err(bad_payload)?;
        Ok(StageOutcome::then(next))
    }

    async fn on_dead(&self, job: &Job, error: &str) {
        notify_dead_turn(&self.ctx, job, error).await;
    }
}

/// Reply text → audio. Attaches the audio reference; the chain ends here.
pub struct SynthesisStage {
    ctx: PipelineContext,
}

impl SynthesisStage {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl JobHandler for SynthesisStage {
    async fn handle(&self, job: &Job) -> Result<StageOutcome, JobError> {
        let payload: SynthesisPayload = job.payload_as().map_err(bad_payload)?;
        let profile = VoiceProfile::resolve(payload.voice_settings.as_ref());

        let audio = self
            .ctx
            .adapters
            .synthesize(&payload.text, &profile)
            .await
            .map_err(adapter_fault)?;

        let (message_id, audio_ref) = (payload.message_id.clone(), audio.audio_ref.clone());
        self.ctx
            .db(move |conn| conversations::attach_audio(conn, &message_id, &audio_ref))
            .await?;

        tracing::debug!(
            job_id = job.id,
            message_id = %payload.message_id,
            audio_ref = %audio.audio_ref,
            duration_estimate_ms = audio.duration_estimate_ms,
            "reply audio attached"
        );
        Ok(StageOutcome::done())
    }

    async fn on_dead(&self, job: &Job, error: &str) {
        notify_dead_turn(&self.ctx, job, error).await;
    }
}

/// Drains the notification queue. Dead notifications are only logged.
pub struct NotificationStage {
    notifier: Arc<dyn Notifier>,
}

impl NotificationStage {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl JobHandler for NotificationStage {
    async fn handle(&self, job: &Job) -> Result<StageOutcome, JobError> {
        let payload: NotificationPayload = job.payload_as().map_err(bad_payload)?;
        self.notifier.deliver(&payload).await.map_err(|e| {
            if e.is_transient() {
                JobError::Transient(e.to_string())
            } else {
                JobError::Permanent(e.to_string())
            }
        })?;
        Ok(StageOutcome::done())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_ids_are_stable_per_message() {
        assert_eq!(reply_message_id("m1"), reply_message_id("m1"));
        assert_ne!(reply_message_id("m1"), reply_message_id("m2"));
    }

    #[test]
    fn adapter_faults_keep_their_class() {
        assert!(matches!(
            adapter_fault(AdapterError::Timeout {
                service: "generation",
                timeout: Duration::from_secs(30)
            }),
            JobError::Transient(_)
        ));
        assert!(matches!(
            adapter_fault(AdapterError::SafetyRejected),
            JobError::Permanent(_)
        ));
    }

    #[test]
    fn missing_audio_is_permanent() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(storage_fault(err), JobError::Permanent(_)));
        let err = std::io::Error::other("disk full");
        assert!(matches!(storage_fault(err), JobError::Transient(_)));
    }
}
