//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use solace_types::QueueName;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

use crate::ratelimit::{RateLimitCategory, RateLimitRule};

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub queues: QueuesConfig,

    #[serde(default)]
    pub adapters: AdaptersConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub auth: AuthConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "solace_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Rate limiter configuration.
///
/// Without `shared_store` every process counts on its own.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Path of the SQLite database holding the shared sliding-window log.
    #[serde(default)]
    pub shared_store: Option<String>,

    #[serde(default = "default_auth_rule")]
    pub auth: RateLimitRule,

    #[serde(default = "default_message_rule")]
    pub message: RateLimitRule,

    #[serde(default = "default_voice_rule")]
    pub voice: RateLimitRule,

    #[serde(default = "default_assessment_rule")]
    pub assessment: RateLimitRule,

    #[serde(default = "default_api_rule")]
    pub api: RateLimitRule,
}

impl RateLimitConfig {
    pub fn rule(&self, category: RateLimitCategory) -> RateLimitRule {
        match category {
            RateLimitCategory::Auth => self.auth,
            RateLimitCategory::Message => self.message,
            RateLimitCategory::Voice => self.voice,
            RateLimitCategory::Assessment => self.assessment,
            RateLimitCategory::Api => self.api,
        }
    }
}

/// Per-queue worker settings.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueuesConfig {
    #[serde(default = "default_transcription_queue")]
    pub transcription: QueueConfig,

    #[serde(default = "default_generation_queue")]
    pub generation: QueueConfig,

    #[serde(default = "default_synthesis_queue")]
    pub synthesis: QueueConfig,

    #[serde(default = "default_notification_queue")]
    pub notification: QueueConfig,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound on one stage handler invocation.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// A queue with more dead jobs than this reports itself unhealthy.
    #[serde(default = "default_failed_threshold")]
    pub failed_threshold: u64,

    /// Completed jobs older than this are pruned.
    #[serde(default = "default_completed_retention_secs")]
    pub completed_retention_secs: u64,
}

impl QueuesConfig {
    pub fn queue(&self, queue: QueueName) -> QueueConfig {
        match queue {
            QueueName::Transcription => self.transcription,
            QueueName::Generation => self.generation,
            QueueName::Synthesis => self.synthesis,
            QueueName::Notification => self.notification,
        }
    }

    fn queue_mut(&mut self, queue: QueueName) -> &mut QueueConfig {
        match queue {
            QueueName::Transcription => &mut self.transcription,
            QueueName::Generation => &mut self.generation,
            QueueName::Synthesis => &mut self.synthesis,
            QueueName::Notification => &mut self.notification,
        }
    }
}

/// External service endpoints and local audio settings.
#[derive(Clone, Deserialize)]
pub struct AdaptersConfig {
    #[serde(default)]
    pub transcription_url: Option<String>,

    #[serde(default)]
    pub transcription_api_key: Option<String>,

    /// Base URL of a chat-completions compatible API.
    #[serde(default)]
    pub generation_url: Option<String>,

    #[serde(default)]
    pub generation_api_key: Option<String>,

    #[serde(default = "default_generation_model")]
    pub generation_model: String,

    #[serde(default)]
    pub system_prompt: Option<String>,

    #[serde(default)]
    pub synthesis_url: Option<String>,

    #[serde(default)]
    pub synthesis_api_key: Option<String>,

    /// Local Piper binary; takes precedence over `synthesis_url`.
    #[serde(default)]
    pub piper_binary: Option<String>,

    #[serde(default = "default_voices_dir")]
    pub voices_dir: String,

    #[serde(default = "default_audio_dir")]
    pub audio_dir: String,

    /// Per-call timeout for every external adapter.
    #[serde(default = "default_adapter_timeout_secs")]
    pub timeout_secs: u64,

    /// Terms that cause a generated reply to be withheld.
    #[serde(default)]
    pub blocked_terms: Vec<String>,

    /// Webhook that receives notification jobs. Unset → notifications are
    /// only logged.
    #[serde(default)]
    pub notification_webhook_url: Option<String>,
}

impl AdaptersConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl fmt::Debug for AdaptersConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn redact(key: &Option<String>) -> Option<&'static str> {
            key.as_ref().map(|_| "[REDACTED]")
        }
        f.debug_struct("AdaptersConfig")
            .field("transcription_url", &self.transcription_url)
            .field("transcription_api_key", &redact(&self.transcription_api_key))
            .field("generation_url", &self.generation_url)
            .field("generation_api_key", &redact(&self.generation_api_key))
            .field("generation_model", &self.generation_model)
            .field("synthesis_url", &self.synthesis_url)
            .field("synthesis_api_key", &redact(&self.synthesis_api_key))
            .field("piper_binary", &self.piper_binary)
            .field("voices_dir", &self.voices_dir)
            .field("audio_dir", &self.audio_dir)
            .field("timeout_secs", &self.timeout_secs)
            .field("blocked_terms", &self.blocked_terms.len())
            .field("notification_webhook_url", &self.notification_webhook_url)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Transcriptions below this confidence end the turn without a reply.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,

    /// Earlier turns handed to the generator.
    #[serde(default = "default_context_turns")]
    pub context_turns: u32,
}

#[derive(Clone, Deserialize)]
pub struct AuthConfig {
    /// HMAC key for bearer tokens. Empty → an ephemeral key is generated at
    /// start-up.
    #[serde(default)]
    pub secret: String,

    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("secret", &"[REDACTED]")
            .field("token_ttl_secs", &self.token_ttl_secs)
            .finish()
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_db_path() -> String {
    "solace.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    16
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_auth_rule() -> RateLimitRule {
    RateLimitCategory::Auth.default_rule()
}

fn default_message_rule() -> RateLimitRule {
    RateLimitCategory::Message.default_rule()
}

fn default_voice_rule() -> RateLimitRule {
    RateLimitCategory::Voice.default_rule()
}

fn default_assessment_rule() -> RateLimitRule {
    RateLimitCategory::Assessment.default_rule()
}

fn default_api_rule() -> RateLimitRule {
    RateLimitCategory::Api.default_rule()
}

fn default_transcription_queue() -> QueueConfig {
    QueueConfig {
        concurrency: 3,
        max_attempts: 3,
    }
}

fn default_generation_queue() -> QueueConfig {
    QueueConfig {
        concurrency: 5,
        max_attempts: 3,
    }
}

fn default_synthesis_queue() -> QueueConfig {
    QueueConfig {
        concurrency: 2,
        max_attempts: 3,
    }
}

fn default_notification_queue() -> QueueConfig {
    QueueConfig {
        concurrency: 10,
        max_attempts: 2,
    }
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    60_000
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_job_timeout_secs() -> u64 {
    120
}

fn default_failed_threshold() -> u64 {
    5
}

fn default_completed_retention_secs() -> u64 {
    7 * 24 * 3600
}

fn default_generation_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_voices_dir() -> String {
    "assets/voices".to_string()
}

fn default_audio_dir() -> String {
    "data/audio".to_string()
}

fn default_adapter_timeout_secs() -> u64 {
    30
}

fn default_min_confidence() -> f32 {
    0.5
}

fn default_context_turns() -> u32 {
    10
}

fn default_token_ttl_secs() -> u64 {
    24 * 3600
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            shared_store: None,
            auth: default_auth_rule(),
            message: default_message_rule(),
            voice: default_voice_rule(),
            assessment: default_assessment_rule(),
            api: default_api_rule(),
        }
    }
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            transcription: default_transcription_queue(),
            generation: default_generation_queue(),
            synthesis: default_synthesis_queue(),
            notification: default_notification_queue(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            job_timeout_secs: default_job_timeout_secs(),
            failed_threshold: default_failed_threshold(),
            completed_retention_secs: default_completed_retention_secs(),
        }
    }
}

impl Default for AdaptersConfig {
    fn default() -> Self {
        Self {
            transcription_url: None,
            transcription_api_key: None,
            generation_url: None,
            generation_api_key: None,
            generation_model: default_generation_model(),
            system_prompt: None,
            synthesis_url: None,
            synthesis_api_key: None,
            piper_binary: None,
            voices_dir: default_voices_dir(),
            audio_dir: default_audio_dir(),
            timeout_secs: default_adapter_timeout_secs(),
            blocked_terms: Vec::new(),
            notification_webhook_url: None,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            context_turns: default_context_turns(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            token_ttl_secs: default_token_ttl_secs(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `SOLACE_HOST`, `SOLACE_PORT`, `SOLACE_DB_PATH`
/// - `SOLACE_LOG_LEVEL`, `SOLACE_LOG_JSON` (set to "true" to enable)
/// - `SOLACE_RATE_LIMIT_STORE` sets `rate_limit.shared_store`
/// - `SOLACE_AUTH_SECRET`
/// - `SOLACE_GENERATION_URL`, `SOLACE_GENERATION_API_KEY`,
///   `SOLACE_TRANSCRIPTION_URL`, `SOLACE_SYNTHESIS_URL`
/// - `SOLACE_CONCURRENCY_<QUEUE>` (e.g. `SOLACE_CONCURRENCY_SYNTHESIS=4`)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(host) = var("SOLACE_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = var("SOLACE_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(db_path) = var("SOLACE_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(level) = var("SOLACE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("SOLACE_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(store) = var("SOLACE_RATE_LIMIT_STORE") {
        config.rate_limit.shared_store = (!store.is_empty()).then_some(store);
    }
    if let Some(secret) = var("SOLACE_AUTH_SECRET") {
        config.auth.secret = secret;
    }
    if let Some(url) = var("SOLACE_GENERATION_URL") {
        config.adapters.generation_url = Some(url);
    }
    if let Some(key) = var("SOLACE_GENERATION_API_KEY") {
        config.adapters.generation_api_key = Some(key);
    }
    if let Some(url) = var("SOLACE_TRANSCRIPTION_URL") {
        config.adapters.transcription_url = Some(url);
    }
    if let Some(url) = var("SOLACE_SYNTHESIS_URL") {
        config.adapters.synthesis_url = Some(url);
    }
    for queue in QueueName::ALL {
        let key = format!("SOLACE_CONCURRENCY_{}", queue.as_str().to_uppercase());
        if let Some(value) = var(&key) {
            match value.parse::<usize>() {
                Ok(n) if n > 0 => config.queues.queue_mut(queue).concurrency = n,
                _ => tracing::warn!(variable = %key, value = %value, "ignoring invalid concurrency override"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_the_documented_policy() {
        let config = Config::default();
        assert_eq!(config.queues.transcription.concurrency, 3);
        assert_eq!(config.queues.generation.concurrency, 5);
        assert_eq!(config.queues.synthesis.concurrency, 2);
        assert_eq!(config.queues.notification.concurrency, 10);
        assert_eq!(config.queues.synthesis.max_attempts, 3);
        assert_eq!(config.pipeline.min_confidence, 0.5);
        assert_eq!(config.adapters.timeout(), Duration::from_secs(30));
        assert!(config.rate_limit.shared_store.is_none());
        assert_eq!(config.rate_limit.voice.limit, 10);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [rate_limit]
            shared_store = "limits.db"
            message = { limit = 5, window_secs = 10 }

            [queues.synthesis]
            concurrency = 4
            max_attempts = 6
            "#,
        )
        .unwrap();

        assert_eq!(config.rate_limit.shared_store.as_deref(), Some("limits.db"));
        assert_eq!(config.rate_limit.message.limit, 5);
        assert_eq!(config.rate_limit.auth.limit, 50);
        assert_eq!(config.queues.synthesis.concurrency, 4);
        assert_eq!(config.queues.generation.concurrency, 5);
    }

    #[test]
    fn env_overrides_win() {
        let vars: HashMap<&str, &str> = [
            ("SOLACE_PORT", "8081"),
            ("SOLACE_CONCURRENCY_GENERATION", "9"),
            ("SOLACE_CONCURRENCY_SYNTHESIS", "zero"),
            ("SOLACE_RATE_LIMIT_STORE", "/tmp/limits.db"),
            ("SOLACE_LOG_JSON", "1"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.server.port, 8081);
        assert_eq!(config.queues.generation.concurrency, 9);
        assert_eq!(config.queues.synthesis.concurrency, 2);
        assert_eq!(config.rate_limit.shared_store.as_deref(), Some("/tmp/limits.db"));
        assert!(config.logging.json);
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let mut config = Config::default();
        config.auth.secret = "hunter2".to_string();
        config.adapters.generation_api_key = Some("sk-live".to_string());
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("sk-live"));
    }
}
