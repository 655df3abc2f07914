//! Job payload shapes, one per queue.
//!
//! Every conversational payload carries the conversation id, the
//! originating message id and the user id so a worker can process it
//! without re-querying transient state.

use crate::voice::VoiceSettings;
use crate::ContextTurn;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionPayload {
    pub message_id: String,
    pub audio_ref: String,
    pub conversation_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationPayload {
    pub conversation_id: String,
    pub message_id: String,
    pub user_text: String,
    pub user_id: String,
    /// Pre-assembled context turns. When absent the worker loads recent
    /// turns from the conversation store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Vec<ContextTurn>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisPayload {
    pub message_id: String,
    pub text: String,
    pub conversation_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_settings: Option<VoiceSettings>,
}

/// Delivery channel of a side-channel alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Email,
    Sms,
    Push,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Push => "push",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub recipient: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_payload_uses_camel_case_and_omits_empty_context() {
        let payload = GenerationPayload {
            conversation_id: "c1".to_string(),
            message_id: "m1".to_string(),
            user_text: "hello".to_string(),
            user_id: "u1".to_string(),
            context: None,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["conversationId"], "c1");
        assert_eq!(json["userText"], "hello");
        assert!(json.get("context").is_none());
    }

    #[test]
    fn notification_payload_tags_kind_as_type() {
        let json = serde_json::json!({
            "type": "push",
            "recipient": "u1",
            "message": "Your reply could not be delivered"
        });
        let payload: NotificationPayload = serde_json::from_value(json).unwrap();
        assert_eq!(payload.kind, NotificationKind::Push);
        assert!(payload.subject.is_none());
    }
}
