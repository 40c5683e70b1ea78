//! Realtalk configuration.
//!
//! Sources are layered in this order, later ones winning:
//! 1. Built-in defaults (the `Default` impls below).
//! 2. Optional TOML file at `REALTALK_CONFIG` (default `config/realtalk.toml`); skipped when absent.
//! 3. Environment variables with the `REALTALK` prefix and `__` separator,
//!    e.g. `REALTALK__SESSION__INGRESS_CAPACITY=80` or `REALTALK__LLM__MODEL=gpt-4o-mini`.
//!
//! API keys additionally fall back to the conventional provider variables:
//!
//! | Env | Used for |
//! |-----|----------|
//! | OPENAI_API_KEY / OPENROUTER_API_KEY | `llm.api_key` when unset |
//! | STT_API_KEY | `recognizer.stt_api_key` when unset (then the LLM key) |
//! | TTS_API_KEY | `tts.api_key` when unset (then the LLM key) |

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Default location of the optional TOML file.
pub const DEFAULT_CONFIG_PATH: &str = "config/realtalk.toml";

const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly voice assistant. \
    Answer in short, natural spoken sentences. Do not use markdown, lists, or emoji.";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtalkConfig {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub session: SessionConfig,
    pub recognizer: RecognizerConfig,
    pub tts: TtsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for the WebSocket gateway.
    pub bind_addr: String,
    /// Allow any origin (browser clients served from another port).
    pub cors_permissive: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            cors_permissive: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// OpenAI-compatible base URL without trailing slash.
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub system_prompt: String,
    pub temperature: f32,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub stale_request_timeout_secs: u64,
    pub stale_sweep_interval_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            temperature: 0.7,
            max_attempts: 3,
            retry_base_delay_ms: 500,
            connect_timeout_secs: 10,
            read_timeout_secs: 60,
            stale_request_timeout_secs: 300,
            stale_sweep_interval_secs: 60,
        }
    }
}

impl LlmConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn stale_request_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_request_timeout_secs)
    }

    pub fn stale_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.stale_sweep_interval_secs)
    }
}

/// Per-connection turn-taking and dispatch tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bounded audio ingress capacity; newer frames are dropped when full.
    pub ingress_capacity: usize,
    /// Sleep between dispatcher polls while nothing is sendable.
    pub dispatcher_idle_ms: u64,
    /// Microphone mute auto-release after the turn-end timestamp.
    pub interruption_release_ms: u64,
    /// Microphone release after the first audio chunk of a turn is sent.
    pub chunk_release_ms: u64,
    /// Minimum characters before the quick answer may end at a sentence boundary.
    pub quick_answer_min_chars: usize,
    /// Word similarity below which a speculative generation is abandoned.
    pub abort_similarity_threshold: f64,
    /// Size of each `tts_chunk` payload in bytes of PCM.
    pub tts_chunk_bytes: usize,
    /// Maximum retained history entries; 0 keeps everything.
    pub history_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ingress_capacity: 50,
            dispatcher_idle_ms: 2,
            interruption_release_ms: 2000,
            chunk_release_ms: 1000,
            quick_answer_min_chars: 12,
            abort_similarity_threshold: 0.95,
            tts_chunk_bytes: 4800,
            history_limit: 0,
        }
    }
}

impl SessionConfig {
    pub fn dispatcher_idle(&self) -> Duration {
        Duration::from_millis(self.dispatcher_idle_ms)
    }

    pub fn interruption_release(&self) -> Duration {
        Duration::from_millis(self.interruption_release_ms)
    }

    pub fn chunk_release(&self) -> Duration {
        Duration::from_millis(self.chunk_release_ms)
    }
}

/// Energy-gated gap recognizer and its speech-to-text backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizerConfig {
    pub sample_rate: u32,
    /// RMS level (0.0-1.0 of full scale) above which a frame counts as speech.
    pub energy_threshold: f32,
    /// Silence after which a speculative transcription is attempted.
    pub potential_gap_ms: u64,
    /// Silence after which the turn is committed.
    pub gap_ms: u64,
    pub min_speech_ms: u64,
    pub max_turn_ms: u64,
    /// Turn gap at speed 100.
    pub fast_gap_ms: u64,
    /// Turn gap at speed 0.
    pub slow_gap_ms: u64,
    pub stt_api_url: String,
    pub stt_api_key: Option<String>,
    pub stt_model: String,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            energy_threshold: 0.02,
            potential_gap_ms: 300,
            gap_ms: 800,
            min_speech_ms: 200,
            max_turn_ms: 30_000,
            fast_gap_ms: 400,
            slow_gap_ms: 1600,
            stt_api_url: "https://api.openai.com/v1".to_string(),
            stt_api_key: None,
            stt_model: "whisper-1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub voice: String,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "tts-1".to_string(),
            voice: "nova".to_string(),
        }
    }
}

impl RealtalkConfig {
    /// Load from `REALTALK_CONFIG` (or the default path) plus environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("REALTALK_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    /// Load with an explicit file path. A missing file is not an error.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let builder = config::Config::builder()
            .set_default("server.bind_addr", ServerConfig::default().bind_addr)?
            .set_default("server.cors_permissive", true)?;

        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("REALTALK").separator("__"))
            .build()?;

        let mut cfg: Self = built.try_deserialize()?;
        cfg.apply_key_fallbacks();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Fill unset API keys from the conventional provider variables.
    pub fn apply_key_fallbacks(&mut self) {
        self.llm.api_key = non_empty(self.llm.api_key.take())
            .or_else(|| env_opt_string("OPENAI_API_KEY"))
            .or_else(|| env_opt_string("OPENROUTER_API_KEY"));
        self.recognizer.stt_api_key = non_empty(self.recognizer.stt_api_key.take())
            .or_else(|| env_opt_string("STT_API_KEY"))
            .or_else(|| self.llm.api_key.clone());
        self.tts.api_key = non_empty(self.tts.api_key.take())
            .or_else(|| env_opt_string("TTS_API_KEY"))
            .or_else(|| self.llm.api_key.clone());
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind_addr.parse::<SocketAddr>().is_err() {
            return Err(invalid("server.bind_addr", format!("'{}' is not a socket address", self.server.bind_addr)));
        }
        if self.llm.max_attempts == 0 {
            return Err(invalid("llm.max_attempts", "must be at least 1"));
        }
        if self.llm.read_timeout_secs == 0 {
            return Err(invalid("llm.read_timeout_secs", "must be positive"));
        }
        if self.session.ingress_capacity == 0 {
            return Err(invalid("session.ingress_capacity", "must be positive"));
        }
        let threshold = self.session.abort_similarity_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(invalid("session.abort_similarity_threshold", format!("{threshold} is outside (0, 1]")));
        }
        if self.session.tts_chunk_bytes == 0 || self.session.tts_chunk_bytes % 2 != 0 {
            return Err(invalid("session.tts_chunk_bytes", "must be a positive even number of bytes"));
        }
        if self.recognizer.sample_rate == 0 {
            return Err(invalid("recognizer.sample_rate", "must be positive"));
        }
        if self.recognizer.fast_gap_ms > self.recognizer.slow_gap_ms {
            return Err(invalid("recognizer.fast_gap_ms", "must not exceed slow_gap_ms"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Read an env var; unset or blank => None.
pub fn env_opt_string(name: &str) -> Option<String> {
    non_empty(std::env::var(name).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = RealtalkConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.session.ingress_capacity, 50);
        assert_eq!(cfg.llm.max_attempts, 3);
        assert_eq!(cfg.llm.retry_base_delay(), Duration::from_millis(500));
    }

    #[test]
    fn rejects_zero_capacity() {
        let mut cfg = RealtalkConfig::default();
        cfg.session.ingress_capacity = 0;
        match cfg.validate() {
            Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, "session.ingress_capacity"),
            other => panic!("expected invalid capacity, got {other:?}"),
        }
    }

    #[test]
    fn rejects_odd_chunk_size_and_bad_threshold() {
        let mut cfg = RealtalkConfig::default();
        cfg.session.tts_chunk_bytes = 4801;
        assert!(cfg.validate().is_err());

        let mut cfg = RealtalkConfig::default();
        cfg.session.abort_similarity_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn blank_keys_are_treated_as_unset() {
        assert_eq!(non_empty(Some("   ".to_string())), None);
        assert_eq!(non_empty(Some(" sk-1 ".to_string())), Some("sk-1".to_string()));
    }
}
