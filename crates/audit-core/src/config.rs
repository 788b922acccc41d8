//! Runtime configuration for the audit engine.
//!
//! Precedence: built-in defaults < TOML file (`AUDIT_CONFIG` path, else `config/audit.toml`)
//! < environment (`AUDIT__WEBHOOK_URL`, `AUDIT__LIVE__MODEL`, ...).

use crate::error::AuditResult;
use crate::normalize::{DisabledMapper, OpenAiCompatMapper, SemanticMapper};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config/audit.toml";

/// Streaming session (live model) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveSettings {
    pub url: String,
    pub model: String,
    /// Falls back to `GEMINI_API_KEY`.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
}

/// One-shot semantic mapping endpoint (OpenAI-compatible).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingSettings {
    pub api_url: String,
    pub model: String,
    /// Falls back to `OPENROUTER_API_KEY`, then `GEMINI_API_KEY`.
    #[serde(default)]
    pub api_key: Option<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    pub capture_sample_rate: u32,
    pub frame_samples: usize,
    pub playback_sample_rate: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Directory of the sled database holding sessions.
    pub storage_path: String,
    /// Question catalogue file; the built-in catalogue is used when it does not exist.
    pub catalogue_path: String,
    /// Constant `source` tag attached to every payload.
    pub source_tag: String,
    /// Delivery endpoint. Without it, submission reports a network error.
    #[serde(default)]
    pub webhook_url: Option<String>,
    pub submission_deadline_ms: u64,
    pub archive_grace_ms: u64,
    pub silence_window_ms: u64,
    /// Answer keys used to derive the respondent name.
    pub name_field: String,
    pub email_field: String,
    pub live: LiveSettings,
    pub mapping: MappingSettings,
    pub audio: AudioSettings,
}

impl AuditConfig {
    /// Load from file and environment. `.env` is expected to be loaded by the caller.
    pub fn load() -> AuditResult<Self> {
        let config_path = std::env::var("AUDIT_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&config_path))
    }

    pub fn load_from(path: &Path) -> AuditResult<Self> {
        let builder = Self::defaults()?;
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };
        let built = builder
            .add_source(config::Environment::with_prefix("AUDIT").separator("__"))
            .build()?;
        let mut cfg: AuditConfig = built.try_deserialize()?;
        cfg.apply_key_fallbacks();
        Ok(cfg)
    }

    fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
        config::Config::builder()
            .set_default("storage_path", "./data/audit")?
            .set_default("catalogue_path", "config/catalogue.toml")?
            .set_default("source_tag", "voice-audit")?
            .set_default("submission_deadline_ms", 20_000_i64)?
            .set_default("archive_grace_ms", 5_000_i64)?
            .set_default("silence_window_ms", 10_000_i64)?
            .set_default("name_field", "respondent_name")?
            .set_default("email_field", "email")?
            .set_default(
                "live.url",
                "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent",
            )?
            .set_default("live.model", "models/gemini-2.0-flash-live-001")?
            .set_default("mapping.api_url", "https://openrouter.ai/api/v1")?
            .set_default("mapping.model", "google/gemini-2.0-flash-001")?
            .set_default("mapping.timeout_ms", 12_000_i64)?
            .set_default("audio.capture_sample_rate", 16_000_i64)?
            .set_default("audio.frame_samples", 1024_i64)?
            .set_default("audio.playback_sample_rate", 24_000_i64)
    }

    fn apply_key_fallbacks(&mut self) {
        let env_key = |name: &str| std::env::var(name).ok().filter(|k| !k.trim().is_empty());
        if self.live.api_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
            self.live.api_key = env_key("GEMINI_API_KEY");
        }
        if self.mapping.api_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
            self.mapping.api_key = env_key("OPENROUTER_API_KEY").or_else(|| env_key("GEMINI_API_KEY"));
        }
    }

    pub fn submission_deadline(&self) -> Duration {
        Duration::from_millis(self.submission_deadline_ms)
    }

    pub fn mapping_timeout(&self) -> Duration {
        Duration::from_millis(self.mapping.timeout_ms)
    }

    pub fn archive_grace(&self) -> Duration {
        Duration::from_millis(self.archive_grace_ms)
    }

    pub fn silence_window(&self) -> Duration {
        Duration::from_millis(self.silence_window_ms)
    }

    /// Semantic mapper for Stage A; disabled when no key is configured.
    pub fn semantic_mapper(&self) -> Arc<dyn SemanticMapper> {
        match self.mapping.api_key.as_deref() {
            Some(key) => Arc::new(OpenAiCompatMapper::new(
                self.mapping.api_url.clone(),
                key,
                self.mapping.model.clone(),
            )),
            None => {
                tracing::warn!("no mapping API key configured; semantic mapping disabled");
                Arc::new(DisabledMapper)
            }
        }
    }
}
