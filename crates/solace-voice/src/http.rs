//! HTTP implementations of the adapter contracts.

use crate::adapter::{
    estimate_speech_ms, Generation, GenerationRequest, Generator, SynthesizedAudio, Synthesizer,
    Transcriber, Transcription,
};
use crate::audio::AudioStore;
use crate::error::AdapterError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use solace_types::{Sender, VoiceProfile};
use std::fmt;
use std::time::Duration;

/// Default bound on a single provider call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_SYSTEM_PROMPT: &str = "You are a calm, supportive listener. Reply briefly, \
in the user's language, and never give medical diagnoses.";

/// Provider endpoint and credentials.
#[derive(Clone)]
pub struct Endpoint {
    pub url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl Endpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: None,
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.timeout.min(Duration::from_secs(10)))
            .build()
            .unwrap_or_default()
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn send_error(service: &'static str, timeout: Duration, err: reqwest::Error) -> AdapterError {
    if err.is_timeout() {
        AdapterError::Timeout { service, timeout }
    } else if err.is_decode() {
        AdapterError::rejected(service, format!("malformed provider response: {}", err))
    } else {
        AdapterError::unavailable(service, err.to_string())
    }
}

async fn check_status(
    service: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, AdapterError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = format!("HTTP {}: {}", status.as_u16(), truncate(&body, 256));
    if status.is_server_error()
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
    {
        Err(AdapterError::unavailable(service, message))
    } else {
        Err(AdapterError::rejected(service, message))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Posts raw audio and expects `{"text": "...", "confidence": 0.93}`.
///
/// A response without `confidence` is treated as fully confident.
#[derive(Debug, Clone)]
pub struct HttpTranscriber {
    endpoint: Endpoint,
    client: reqwest::Client,
}

impl HttpTranscriber {
    pub fn new(endpoint: Endpoint) -> Self {
        let client = endpoint.client();
        Self { endpoint, client }
    }
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
    confidence: Option<f32>,
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, audio: &[u8]) -> Result<Transcription, AdapterError> {
        const SERVICE: &str = "transcription";
        if audio.is_empty() {
            return Err(AdapterError::rejected(SERVICE, "empty audio"));
        }
        let request = self
            .client
            .post(&self.endpoint.url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(audio.to_vec());
        let response = self
            .endpoint
            .authorize(request)
            .send()
            .await
            .map_err(|e| send_error(SERVICE, self.endpoint.timeout, e))?;
        let body: TranscriptionResponse = check_status(SERVICE, response)
            .await?
            .json()
            .await
            .map_err(|e| send_error(SERVICE, self.endpoint.timeout, e))?;

        Ok(Transcription {
            text: body.text.trim().to_string(),
            confidence: body.confidence.unwrap_or(1.0).clamp(0.0, 1.0),
        })
    }
}

/// Chat-completions style generator (`POST {url}/chat/completions`).
#[derive(Debug, Clone)]
pub struct HttpGenerator {
    endpoint: Endpoint,
    model: String,
    system_prompt: String,
    client: reqwest::Client,
}

impl HttpGenerator {
    pub fn new(endpoint: Endpoint, model: impl Into<String>) -> Self {
        let client = endpoint.client();
        Self {
            endpoint,
            model: model.into(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            client,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, AdapterError> {
        const SERVICE: &str = "generation";
        let mut messages = Vec::with_capacity(request.context.len() + 2);
        messages.push(ChatMessage {
            role: "system",
            content: &self.system_prompt,
        });
        for turn in &request.context {
            messages.push(ChatMessage {
                role: match turn.sender {
                    Sender::User => "user",
                    Sender::System => "assistant",
                },
                content: &turn.text,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.user_text,
        });

        let url = format!("{}/chat/completions", self.endpoint.url.trim_end_matches('/'));
        let body = ChatRequest {
            model: &self.model,
            messages,
        };
        let response = self
            .endpoint
            .authorize(self.client.post(url).json(&body))
            .send()
            .await
            .map_err(|e| send_error(SERVICE, self.endpoint.timeout, e))?;
        let reply: ChatResponse = check_status(SERVICE, response)
            .await?
            .json()
            .await
            .map_err(|e| send_error(SERVICE, self.endpoint.timeout, e))?;

        let text = reply
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        Ok(Generation {
            text: text.trim().to_string(),
            tokens_in: reply.usage.as_ref().and_then(|u| u.prompt_tokens),
            tokens_out: reply.usage.as_ref().and_then(|u| u.completion_tokens),
        })
    }
}

/// Posts `{text, voiceId, speed, sentencePauseMs?}` and stores the returned
/// audio body.
#[derive(Debug, Clone)]
pub struct HttpSynthesizer {
    endpoint: Endpoint,
    store: AudioStore,
    client: reqwest::Client,
}

impl HttpSynthesizer {
    pub fn new(endpoint: Endpoint, store: AudioStore) -> Self {
        let client = endpoint.client();
        Self {
            endpoint,
            store,
            client,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SynthesisRequest<'a> {
    text: &'a str,
    voice_id: &'a str,
    speed: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    sentence_pause_ms: Option<u32>,
}

fn extension_for(content_type: Option<&str>) -> &'static str {
    match content_type.map(|c| c.split(';').next().unwrap_or(c).trim()) {
        Some("audio/mpeg") | Some("audio/mp3") => "mp3",
        Some("audio/wav") | Some("audio/x-wav") | Some("audio/wave") => "wav",
        Some("audio/ogg") => "ogg",
        _ => "bin",
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        profile: &VoiceProfile,
    ) -> Result<SynthesizedAudio, AdapterError> {
        const SERVICE: &str = "synthesis";
        let sentence_pause_ms = match profile {
            VoiceProfile::Standard { .. } => None,
            VoiceProfile::Therapeutic {
                sentence_pause_ms, ..
            } => Some(*sentence_pause_ms),
        };
        let body = SynthesisRequest {
            text,
            voice_id: profile.voice_id(),
            speed: profile.speed(),
            sentence_pause_ms,
        };
        let response = self
            .endpoint
            .authorize(self.client.post(&self.endpoint.url).json(&body))
            .send()
            .await
            .map_err(|e| send_error(SERVICE, self.endpoint.timeout, e))?;
        let response = check_status(SERVICE, response).await?;

        let ext = extension_for(
            response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
        );
        let reported_ms = response
            .headers()
            .get("x-audio-duration-ms")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let audio = response
            .bytes()
            .await
            .map_err(|e| send_error(SERVICE, self.endpoint.timeout, e))?;
        if audio.is_empty() {
            return Err(AdapterError::unavailable(SERVICE, "provider returned no audio"));
        }

        let audio_ref = self.store.put(&audio, ext).await?;
        Ok(SynthesizedAudio {
            audio_ref,
            duration_estimate_ms: reported_ms
                .unwrap_or_else(|| estimate_speech_ms(text, profile.speed())),
        })
    }
}
