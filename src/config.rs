use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Environment variable that overrides `base_url`.
pub const BASE_URL_ENV: &str = "RESVIZ_API_BASE_URL";

/// Client configuration.
///
/// Resolution order: defaults, then the TOML file, then [`BASE_URL_ENV`],
/// then command-line flags (applied by the binary).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend root, e.g. `http://127.0.0.1:8008`.
    pub base_url: String,
    /// Timeout for plain REST calls. Streams are never timed out.
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Agent addressed by `send` when none is given.
    pub agent_name: String,
    pub default_title: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            base_url: "http://127.0.0.1:8008".to_string(),
            request_timeout_secs: 30,
            connect_timeout_secs: 5,
            agent_name: "auto_research_agent".to_string(),
            default_title: "User message".to_string(),
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    SyncError::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                Self::from_toml_str(&text)?
            }
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup(BASE_URL_ENV).filter(|u| !u.trim().is_empty()) {
            self.base_url = url.trim().to_string();
        }
        self.validate()
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Result<Self> {
        self.base_url = url.into();
        self.validate()?;
        Ok(self)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(SyncError::Config(format!(
                "base_url must be an http(s) URL, got {:?}",
                self.base_url
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(SyncError::Config("request_timeout_secs must be > 0".into()));
        }
        Ok(())
    }
}
