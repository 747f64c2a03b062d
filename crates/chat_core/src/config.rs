use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paths;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid json config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid toml config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    /// `0` leaves the port out of the base URL
    pub port: u16,
    pub model: Option<String>,
    pub auto_answer_model: Option<String>,
    pub database_path: Option<PathBuf>,
    pub commit_window_ms: u64,
    pub auto_answer_delay_ms: u64,
}

const CONFIG_FILE_PATH: &str = "config.toml";

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 11434;

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            model: None,
            auto_answer_model: None,
            database_path: None,
            commit_window_ms: 300,
            auto_answer_delay_ms: 500,
        }
    }
}

impl Config {
    /// Resolve configuration from config.json, then ./config.toml, then the environment.
    ///
    /// Unreadable or malformed files are skipped with a warning.
    pub fn new() -> Self {
        let mut config = Config::default();

        let mut loaded = false;
        let json_path = paths::config_json_path();
        if json_path.exists() {
            match Self::from_json_file(&json_path) {
                Ok(file_config) => {
                    config = file_config;
                    loaded = true;
                }
                Err(e) => log::warn!("Ignoring {}: {}", json_path.display(), e),
            }
        }

        if !loaded && Path::new(CONFIG_FILE_PATH).exists() {
            match Self::from_toml_file(Path::new(CONFIG_FILE_PATH)) {
                Ok(file_config) => config = file_config,
                Err(e) => log::warn!("Ignoring {}: {}", CONFIG_FILE_PATH, e),
            }
        }

        if let Err(e) = config.apply_env(|key| std::env::var(key).ok()) {
            log::warn!("Ignoring environment override: {}", e);
        }
        config
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Apply `OLLAMA_*` overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("OLLAMA_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("OLLAMA_PORT") {
            self.port = port.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: "OLLAMA_PORT",
                value: port.clone(),
            })?;
        }
        if let Some(model) = lookup("OLLAMA_MODEL") {
            self.model = non_empty(model);
        }
        if let Some(model) = lookup("OLLAMA_AUTO_ANSWER_MODEL") {
            self.auto_answer_model = non_empty(model);
        }
        if let Some(path) = lookup("OLLAMA_CHAT_DB") {
            self.database_path = non_empty(path).map(PathBuf::from);
        }
        Ok(())
    }

    /// API root, e.g. `http://localhost:11434/api`
    pub fn base_url(&self) -> String {
        let host = if self.host.starts_with("http://") || self.host.starts_with("https://") {
            self.host.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", self.host.trim_end_matches('/'))
        };

        if self.port != 0 {
            format!("{}:{}/api", host, self.port)
        } else {
            format!("{}/api", host)
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(paths::default_database_path)
    }

    pub fn commit_window(&self) -> Duration {
        Duration::from_millis(self.commit_window_ms)
    }

    pub fn auto_answer_delay(&self) -> Duration {
        Duration::from_millis(self.auto_answer_delay_ms)
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
