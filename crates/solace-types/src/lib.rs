//! Shared types for the Solace turn-processing pipeline.
//!
//! This crate provides the domain types used across every Solace crate:
//! pipeline messages, queue names and job payloads, live-session states,
//! and voice profiles. It carries no I/O and depends only on `serde`,
//! `thiserror` and `uuid`, which keeps the dependency graph acyclic.

pub mod payload;
pub mod voice;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use payload::{
    GenerationPayload, NotificationKind, NotificationPayload, SynthesisPayload,
    TranscriptionPayload,
};
pub use voice::{VoiceProfile, VoiceSettings};

/// Error returned when a string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Author of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Sender {
    /// The human user.
    User,
    /// The assistant (generated replies and fallback notices).
    System,
}

impl Sender {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::System => "SYSTEM",
        }
    }
}

impl FromStr for Sender {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USER" => Ok(Self::User),
            "SYSTEM" => Ok(Self::System),
            other => Err(ParseEnumError {
                kind: "sender",
                value: other.to_string(),
            }),
        }
    }
}

/// One turn's artifact as it moves through the pipeline stages.
///
/// Stages only ever add to a message: transcription fills `text`,
/// generation creates a sibling `SYSTEM` message, synthesis fills
/// `audio_ref`. The pipeline never deletes messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineMessage {
    pub conversation_id: String,
    pub message_id: String,
    pub sender: Sender,
    pub text: Option<String>,
    pub audio_ref: Option<String>,
    pub tokens_in: Option<u32>,
    pub tokens_out: Option<u32>,
    pub metadata: serde_json::Value,
    pub created_at: String,
}

/// One earlier turn handed to the generator as context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextTurn {
    pub sender: Sender,
    pub text: String,
}

/// The named queues of the durable path, one per pipeline stage plus the
/// side-channel notification queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Transcription,
    Generation,
    Synthesis,
    Notification,
}

impl QueueName {
    pub const ALL: [QueueName; 4] = [
        QueueName::Transcription,
        QueueName::Generation,
        QueueName::Synthesis,
        QueueName::Notification,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transcription => "transcription",
            Self::Generation => "generation",
            Self::Synthesis => "synthesis",
            Self::Notification => "notification",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transcription" => Ok(Self::Transcription),
            "generation" => Ok(Self::Generation),
            "synthesis" => Ok(Self::Synthesis),
            "notification" => Ok(Self::Notification),
            other => Err(ParseEnumError {
                kind: "queue",
                value: other.to_string(),
            }),
        }
    }
}

/// Lifecycle of a queued job.
///
/// `Failed` is the dead state: a job lands there after exhausting its
/// attempts (or on a permanent fault) and stays until an operator revives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ParseEnumError {
                kind: "job status",
                value: other.to_string(),
            }),
        }
    }
}

/// Real-time session states.
///
/// The only legal path is `Connecting → Authenticated → Active → Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Connecting,
    Authenticated,
    Active,
    Ended,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "CONNECTING",
            Self::Authenticated => "AUTHENTICATED",
            Self::Active => "ACTIVE",
            Self::Ended => "ENDED",
        }
    }

    /// Returns `true` if `next` is the single state that may follow `self`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Authenticated)
                | (Self::Authenticated, Self::Active)
                | (Self::Active, Self::Ended)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names_round_trip_through_strings() {
        for queue in QueueName::ALL {
            assert_eq!(queue.as_str().parse::<QueueName>(), Ok(queue));
        }
        assert!("billing".parse::<QueueName>().is_err());
    }

    #[test]
    fn session_state_only_moves_forward_one_step() {
        use SessionState::*;
        assert!(Connecting.can_transition_to(Authenticated));
        assert!(Authenticated.can_transition_to(Active));
        assert!(Active.can_transition_to(Ended));

        assert!(!Connecting.can_transition_to(Active));
        assert!(!Authenticated.can_transition_to(Ended));
        assert!(!Ended.can_transition_to(Active));
        assert!(!Active.can_transition_to(Active));
    }

    #[test]
    fn sender_serializes_uppercase() {
        let json = serde_json::to_string(&Sender::System).unwrap();
        assert_eq!(json, "\"SYSTEM\"");
        assert_eq!("USER".parse::<Sender>(), Ok(Sender::User));
    }
}
