//! Application Configuration
//!
//! Handles loading and saving application configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::asr::{
    SessionConfig, Task, DEFAULT_CHUNK_SIZE, DEFAULT_ENDPOINT, DEFAULT_LANGUAGE, DEFAULT_MODEL,
    DEFAULT_PACING_MS, DEFAULT_UID_PREFIX,
};

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub transfer: TransferConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: AppConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from file or create default
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            Self::load(path)
        } else {
            let config = AppConfig::default();
            config.save(path)?;
            tracing::info!("Wrote default config to {}", path.display());
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Build the handshake configuration, stamping the uid with the current time
    pub fn session_config(&self) -> SessionConfig {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        SessionConfig::new(
            format!("{}-{}", self.session.uid_prefix, secs),
            self.session.model.clone(),
            self.session.language.clone(),
        )
        .with_task(self.session.task)
        .with_vad(self.session.use_vad)
    }
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
        }
    }
}

/// Handshake settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_uid_prefix")]
    pub uid_prefix: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub task: Task,
    #[serde(default)]
    pub use_vad: bool,
}

fn default_uid_prefix() -> String {
    DEFAULT_UID_PREFIX.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            uid_prefix: default_uid_prefix(),
            model: default_model(),
            language: default_language(),
            task: Task::Transcribe,
            use_vad: false,
        }
    }
}

/// Audio transfer pacing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_pacing_ms() -> u64 {
    DEFAULT_PACING_MS
}

impl TransferConfig {
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            pacing_ms: default_pacing_ms(),
        }
    }
}
