//! HTTP handlers for the durable path and queue operations.

use crate::auth::AuthUser;
use crate::pipeline::StoreError;
use crate::AppState;
use axum::{
    body::Bytes,
    extract::{Extension, Json, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use solace_conversations::{self as conversations, ConversationError, CreateMessageParams};
use solace_queue::{Job, QueueCounts, QueueError, QueueHealth};
use solace_types::{GenerationPayload, PipelineMessage, QueueName, TranscriptionPayload};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Request body for `POST /api/conversations/{id}/messages`.
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
}

/// Response for accepted turns. The reply arrives asynchronously.
#[derive(Debug, Serialize, Deserialize)]
pub struct AcceptedTurn {
    #[serde(rename = "messageId")]
    pub message_id: String,
    #[serde(rename = "jobId")]
    pub job_id: i64,
    pub queue: QueueName,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<u32>,
}

/// Per-queue counts for `GET /api/queues`.
#[derive(Debug, Serialize)]
pub struct QueueSummary {
    pub queue: QueueName,
    #[serde(flatten)]
    pub counts: QueueCounts,
}

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conversation(ConversationError::NotFound(msg)) => ApiError::NotFound(msg),
            other => ApiError::InternalServerError(other.to_string()),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        ApiError::InternalServerError(e.to_string())
    }
}

fn parse_queue(name: &str) -> Result<QueueName, ApiError> {
    QueueName::ALL
        .into_iter()
        .find(|q| q.as_str() == name)
        .ok_or_else(|| ApiError::NotFound(format!("unknown queue: {}", name)))
}

/// Fails with 403 unless `user_id` owns the conversation.
async fn require_owner(
    state: &AppState,
    conversation_id: &str,
    user_id: &str,
) -> Result<(), ApiError> {
    let (conversation, user) = (conversation_id.to_string(), user_id.to_string());
    let owns = state
        .pipeline
        .db(move |conn| conversations::is_owner(conn, &conversation, &user))
        .await?;
    if !owns {
        tracing::warn!(
            user_id = %user_id,
            conversation_id = %conversation_id,
            "conversation access denied"
        );
        return Err(ApiError::Forbidden(
            "not authorized for this conversation".to_string(),
        ));
    }
    Ok(())
}

/// Handler for `POST /api/conversations/{id}/messages`.
///
/// Persists the user turn and queues its reply.
pub async fn post_message_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(conversation_id): Path<String>,
    Json(body): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<AcceptedTurn>), ApiError> {
    let content = body.content.trim().to_string();
    if content.is_empty() {
        return Err(ApiError::BadRequest("content must not be empty".to_string()));
    }
    if content.len() > crate::session::MAX_TEXT_BYTES {
        return Err(ApiError::PayloadTooLarge(format!(
            "content exceeds maximum length of {} bytes",
            crate::session::MAX_TEXT_BYTES
        )));
    }
    require_owner(&state, &conversation_id, &user_id).await?;

    let message_id = Uuid::new_v4().to_string();
    let params = CreateMessageParams {
        text: Some(content.clone()),
        ..CreateMessageParams::user(&conversation_id, &message_id)
    };
    state
        .pipeline
        .db(move |conn| conversations::create_message(conn, &params))
        .await?;

    let job = state
        .pipeline
        .broker
        .enqueue(
            QueueName::Generation,
            &GenerationPayload {
                conversation_id: conversation_id.clone(),
                message_id: message_id.clone(),
                user_text: content,
                user_id,
                context: None,
            },
        )
        .await?;

    tracing::info!(
        conversation_id = %conversation_id,
        message_id = %message_id,
        job_id = job.id,
        "text turn queued"
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedTurn {
            message_id,
            job_id: job.id,
            queue: job.queue,
        }),
    ))
}

/// Handler for `POST /api/conversations/{id}/audio`.
///
/// The body is the raw recording. It is stored, attached to a new user
/// turn and queued for transcription.
pub async fn post_audio_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(conversation_id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<AcceptedTurn>), ApiError> {
    if body.is_empty() {
        return Err(ApiError::BadRequest("audio body must not be empty".to_string()));
    }
    if body.len() > solace_voice::audio::MAX_AUDIO_BYTES {
        return Err(ApiError::PayloadTooLarge(format!(
            "audio exceeds maximum size of {} bytes",
            solace_voice::audio::MAX_AUDIO_BYTES
        )));
    }
    require_owner(&state, &conversation_id, &user_id).await?;

    let audio_ref = state
        .pipeline
        .adapters
        .audio
        .put(&body, "bin")
        .await
        .map_err(|e| ApiError::InternalServerError(format!("failed to store audio: {}", e)))?;

    let message_id = Uuid::new_v4().to_string();
    let params = CreateMessageParams {
        audio_ref: Some(audio_ref.clone()),
        ..CreateMessageParams::user(&conversation_id, &message_id)
    };
    state
        .pipeline
        .db(move |conn| conversations::create_message(conn, &params))
        .await?;

    let job = state
        .pipeline
        .broker
        .enqueue(
            QueueName::Transcription,
            &TranscriptionPayload {
                message_id: message_id.clone(),
                audio_ref,
                conversation_id: conversation_id.clone(),
                user_id,
            },
        )
        .await?;

    tracing::info!(
        conversation_id = %conversation_id,
        message_id = %message_id,
        job_id = job.id,
        bytes = body.len(),
        "voice turn queued"
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedTurn {
            message_id,
            job_id: job.id,
            queue: job.queue,
        }),
    ))
}

/// Handler for `GET /api/conversations/{id}/messages`.
pub async fn list_messages_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(conversation_id): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<PipelineMessage>>, ApiError> {
    require_owner(&state, &conversation_id, &user_id).await?;
    let limit = params.limit.unwrap_or(50).clamp(1, 200);
    let messages = state
        .pipeline
        .db(move |conn| conversations::list_messages(conn, &conversation_id, limit))
        .await?;
    Ok(Json(messages))
}

/// Handler for `GET /api/queues`.
pub async fn list_queues_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Vec<QueueSummary>>, ApiError> {
    let mut summaries = Vec::with_capacity(QueueName::ALL.len());
    for queue in QueueName::ALL {
        let counts = state.pipeline.broker.counts(queue).await?;
        summaries.push(QueueSummary { queue, counts });
    }
    Ok(Json(summaries))
}

/// Handler for `GET /api/queues/{queue}/dead`.
pub async fn list_dead_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(queue): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let queue = parse_queue(&queue)?;
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    Ok(Json(state.pipeline.broker.dead_jobs(queue, limit).await?))
}

/// Handler for `POST /api/queues/{queue}/dead/{job_id}/retry`.
pub async fn retry_dead_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(AuthUser(operator)): Extension<AuthUser>,
    Path((queue, job_id)): Path<(String, i64)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let queue = parse_queue(&queue)?;
    if !state.pipeline.broker.revive(queue, job_id).await? {
        return Err(ApiError::NotFound(format!(
            "no dead job {} on queue {}",
            job_id, queue
        )));
    }
    tracing::info!(job_id, queue = %queue, operator = %operator, "dead job requeued");
    Ok(Json(json!({ "jobId": job_id, "queue": queue, "status": "waiting" })))
}

/// Response body for `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    #[serde(rename = "liveSessions")]
    pub live_sessions: usize,
    pub queues: Vec<QueueHealth>,
}

/// Handler for `GET /health`.
///
/// 200 when every queue is healthy, 503 when any queue has too many dead
/// jobs or the store is unreachable.
pub async fn health_handler(Extension(state): Extension<Arc<AppState>>) -> Response {
    let live_sessions = state.sessions.live_count().await;
    match state.pipeline.broker.health(state.failed_threshold).await {
        Ok(queues) => {
            let healthy = queues.iter().all(|q| q.healthy);
            let status = if healthy {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            let body = HealthResponse {
                status: if healthy { "ok" } else { "degraded" },
                version: env!("CARGO_PKG_VERSION"),
                live_sessions,
                queues,
            };
            (status, Json(body)).into_response()
        }
        Err(e) => {
            tracing::error!("health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable", "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
