//! Configuration system
//!
//! Handles loading configuration from multiple sources:
//! - Global config (~/.config/quantchat/config.toml)
//! - Environment variables (QUANTCHAT_*)

use anyhow::Result;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Chat backend settings
    #[serde(default)]
    pub backend: BackendConfig,

    /// Session settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Display redaction settings
    #[serde(default)]
    pub redaction: RedactionSettings,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Streaming chat endpoint
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Bearer credential (can also be set via QUANTCHAT_API_KEY)
    pub api_key: Option<String>,

    /// End-user identifier sent with every request
    #[serde(default = "default_user")]
    pub user: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: None,
            user: default_user(),
        }
    }
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "<REDACTED>"))
            .field("user", &self.user)
            .finish()
    }
}

fn default_endpoint() -> String {
    "https://api.dify.ai/v1/chat-messages".to_string()
}

fn default_user() -> String {
    "quantchat-user".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Enable session persistence
    #[serde(default = "default_true")]
    pub persist: bool,

    /// Override the session cache location
    #[serde(default)]
    pub storage_path: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            persist: true,
            storage_path: None,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RedactionSettings {
    /// Override the placeholder substituted for internal tool identifiers
    #[serde(default)]
    pub placeholder: Option<String>,
}

impl Config {
    /// Load configuration from the global file and apply env overrides
    pub async fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = Self::global_config_path() {
            if path.exists() {
                let content = fs::read_to_string(&path).await?;
                config = toml::from_str(&content)?;
            }
        }

        config.apply_env();
        Ok(config)
    }

    /// Get the global config file path
    pub fn global_config_path() -> Option<PathBuf> {
        ProjectDirs::from("ai", "quantchat", "quantchat-agent")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get the data directory path
    pub fn data_dir() -> Option<PathBuf> {
        ProjectDirs::from("ai", "quantchat", "quantchat-agent")
            .map(|dirs| dirs.data_dir().to_path_buf())
    }

    /// Initialize a default configuration file
    pub async fn init_default() -> Result<()> {
        if let Some(path) = Self::global_config_path() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let content = toml::to_string_pretty(&Self::default())?;
            fs::write(&path, content).await?;
            tracing::info!("Created config at {:?}", path);
        }
        Ok(())
    }

    /// Apply environment variable overrides
    fn apply_env(&mut self) {
        if let Ok(val) = std::env::var("QUANTCHAT_API_KEY") {
            self.backend.api_key = Some(val);
        }
        if let Ok(val) = std::env::var("QUANTCHAT_ENDPOINT") {
            self.backend.endpoint = val;
        }
        if let Ok(val) = std::env::var("QUANTCHAT_USER") {
            self.backend.user = val;
        }
    }
}
