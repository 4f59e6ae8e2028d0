//! Configuration file support

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tether_session::ControllerConfig;

/// Configuration for tether
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the generation backend
    pub base_url: Option<String>,
    /// Bearer token (alternative to TETHER_API_TOKEN)
    pub api_token: Option<String>,
    /// Directory for resume state
    pub store_dir: Option<String>,
    pub retry: RetrySettings,
    pub health: HealthSettings,
    /// Seconds before another client's stream lease is considered stale
    pub lease_ttl_secs: Option<u64>,
}

/// Retry overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub startup_max_attempts: Option<u32>,
    pub startup_delay_ms: Option<u64>,
    pub network_max_attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

/// Health monitor overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub poll_interval_secs: Option<u64>,
    pub unhealthy_after_secs: Option<u64>,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tether")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("TETHER_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from file
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => Self::parse(&content).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {}", path.display(), e);
                Self::default()
            }),
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Write the example config if no file exists yet
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&path, example_config())?;
        Ok(path)
    }

    /// API token from config, falling back to the environment
    pub fn api_token(&self) -> Option<String> {
        self.api_token
            .clone()
            .or_else(|| std::env::var("TETHER_API_TOKEN").ok())
    }

    /// Controller settings with file overrides applied over the defaults
    pub fn controller_config(&self) -> ControllerConfig {
        let mut config = ControllerConfig::default();

        let retry = &mut config.retry;
        if let Some(n) = self.retry.startup_max_attempts {
            retry.startup_max_attempts = n;
        }
        if let Some(ms) = self.retry.startup_delay_ms {
            retry.startup_delay = Duration::from_millis(ms);
        }
        if let Some(n) = self.retry.network_max_attempts {
            retry.network_max_attempts = n;
        }
        if let Some(ms) = self.retry.initial_delay_ms {
            retry.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.retry.max_delay_ms {
            retry.max_delay = Duration::from_millis(ms);
        }

        if let Some(secs) = self.health.poll_interval_secs {
            config.health.poll_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = self.health.unhealthy_after_secs {
            config.health.unhealthy_after = Duration::from_secs(secs);
        }
        if let Some(secs) = self.lease_ttl_secs {
            config.lease_ttl = Duration::from_secs(secs);
        }
        config
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# tether configuration file
# Place at ~/.config/tether/config.toml (Linux/Mac) or %APPDATA%\tether\config.toml (Windows)

# Generation backend
base_url = "http://localhost:8080"

# Bearer token (optional - TETHER_API_TOKEN also works)
# api_token = "..."

# Where resume state is kept (defaults to the platform data directory)
# store_dir = "~/.local/share/tether/resume"

# Seconds before a stream lease held by another client goes stale
lease_ttl_secs = 60

[retry]
startup_max_attempts = 15
startup_delay_ms = 500
network_max_attempts = 5
initial_delay_ms = 1000
max_delay_ms = 8000

[health]
poll_interval_secs = 5
unhealthy_after_secs = 45
"#
}
