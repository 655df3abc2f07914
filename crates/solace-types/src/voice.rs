//! Voice profile definitions.
//!
//! A `VoiceProfile` is resolved once, at call time, from the optional
//! `VoiceSettings` a synthesis payload carries. Adapters receive the
//! resolved variant and never inspect ad hoc flags.

use serde::{Deserialize, Serialize};

/// Caller-supplied overrides attached to a synthesis request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceSettings {
    /// Provider voice identifier.
    #[serde(default)]
    pub voice_id: Option<String>,
    /// Speech speed multiplier (1.0 is normal).
    #[serde(default)]
    pub speed: Option<f32>,
    /// Request the slower, warmer therapeutic delivery.
    #[serde(default)]
    pub therapeutic: bool,
}

/// Resolved voice used by a synthesizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "profile", rename_all = "snake_case")]
pub enum VoiceProfile {
    Standard {
        voice_id: String,
        speed: f32,
    },
    /// Calmer delivery: slowed speech and a longer pause between sentences.
    Therapeutic {
        voice_id: String,
        speed: f32,
        sentence_pause_ms: u32,
    },
}

pub const DEFAULT_VOICE_ID: &str = "default";

const THERAPEUTIC_SPEED: f32 = 0.9;
const THERAPEUTIC_SENTENCE_PAUSE_MS: u32 = 400;
const MIN_SPEED: f32 = 0.5;
const MAX_SPEED: f32 = 2.0;

impl VoiceProfile {
    pub fn resolve(settings: Option<&VoiceSettings>) -> Self {
        let settings = settings.cloned().unwrap_or_default();
        let voice_id = settings
            .voice_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_VOICE_ID.to_string());

        if settings.therapeutic {
            Self::Therapeutic {
                voice_id,
                speed: settings
                    .speed
                    .unwrap_or(THERAPEUTIC_SPEED)
                    .clamp(MIN_SPEED, MAX_SPEED),
                sentence_pause_ms: THERAPEUTIC_SENTENCE_PAUSE_MS,
            }
        } else {
            Self::Standard {
                voice_id,
                speed: settings.speed.unwrap_or(1.0).clamp(MIN_SPEED, MAX_SPEED),
            }
        }
    }

    pub fn voice_id(&self) -> &str {
        match self {
            Self::Standard { voice_id, .. } | Self::Therapeutic { voice_id, .. } => voice_id,
        }
    }

    pub fn speed(&self) -> f32 {
        match self {
            Self::Standard { speed, .. } | Self::Therapeutic { speed, .. } => *speed,
        }
    }
}

impl Default for VoiceProfile {
    fn default() -> Self {
        Self::resolve(None)
    }
}
