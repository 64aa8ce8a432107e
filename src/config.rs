use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::services::synthesis::engine::Engine;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Runtime configuration for the narration engine.
///
/// Every field has a default, so a partial JSON file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NarratorConfig {
    pub backend_url: String,
    pub engine: Engine,
    pub voice: Option<String>,
    pub model_id: Option<String>,
    pub prefer_phonemes: bool,
    pub reading_profile: Option<String>,

    pub request_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub max_poll_backoff_ms: u64,
    /// Consecutive poll failures before the UI is told the backend is unreachable.
    pub poll_failure_notice_after: u32,

    pub settle_delay_ms: u64,
    pub safety_margin_ms: u64,
    pub preload_ahead: usize,
    pub default_speed: f32,
    pub default_volume: f32,
    pub max_audio_failures: u32,
    pub progress_interval_ms: u64,
    pub auto_advance: bool,
    pub output_sample_rate: Option<u32>,
}

impl Default for NarratorConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:8001".to_string(),
            engine: Engine::EdgeTts,
            voice: None,
            model_id: None,
            prefer_phonemes: false,
            reading_profile: None,
            request_timeout_ms: 10_000,
            poll_interval_ms: 500,
            max_poll_backoff_ms: 8_000,
            poll_failure_notice_after: 5,
            settle_delay_ms: 50,
            safety_margin_ms: 20,
            preload_ahead: 3,
            default_speed: 1.0,
            default_volume: 1.0,
            max_audio_failures: 3,
            progress_interval_ms: 250,
            auto_advance: false,
            output_sample_rate: None,
        }
    }
}

impl NarratorConfig {
    /// Load from a JSON file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: NarratorConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `NARRATOR_*` environment overrides.
    ///
    /// - NARRATOR_BACKEND_URL → backend_url
    /// - NARRATOR_ENGINE → engine (pronouncex, edge-tts, espeak, bark)
    /// - NARRATOR_VOICE → voice
    /// - NARRATOR_SPEED → default_speed
    /// - NARRATOR_AUTO_ADVANCE → auto_advance
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Some(url) = env_value("NARRATOR_BACKEND_URL") {
            self.backend_url = url;
        }
        if let Some(engine) = env_value("NARRATOR_ENGINE") {
            self.engine = engine.parse().map_err(|message| ConfigError::InvalidValue {
                key: "engine".to_string(),
                message,
            })?;
        }
        if let Some(voice) = env_value("NARRATOR_VOICE") {
            self.voice = Some(voice);
        }
        if let Some(speed) = env_value("NARRATOR_SPEED") {
            self.default_speed = speed.parse().map_err(|_| ConfigError::InvalidValue {
                key: "default_speed".to_string(),
                message: format!("'{}' is not a number", speed),
            })?;
        }
        if let Some(flag) = env_value("NARRATOR_AUTO_ADVANCE") {
            self.auto_advance = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend_url.trim().is_empty() {
            return Err(invalid("backend_url", "must not be empty"));
        }
        if self.poll_interval_ms == 0 {
            return Err(invalid("poll_interval_ms", "must be positive"));
        }
        if self.max_poll_backoff_ms < self.poll_interval_ms {
            return Err(invalid("max_poll_backoff_ms", "must be >= poll_interval_ms"));
        }
        if !(0.5..=3.0).contains(&self.default_speed) {
            return Err(invalid("default_speed", "must be within 0.5..=3.0"));
        }
        if !(0.0..=1.0).contains(&self.default_volume) {
            return Err(invalid("default_volume", "must be within 0.0..=1.0"));
        }
        if self.max_audio_failures == 0 {
            return Err(invalid("max_audio_failures", "must be at least 1"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_poll_backoff(&self) -> Duration {
        Duration::from_millis(self.max_poll_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(10))
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
