//! Configuration management for term-relay.
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. Environment variables
//! 2. Configuration file (JSON)
//! 3. Default values

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Subsystem configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Session lifecycle configuration.
    pub session: SessionSection,
    /// Logging configuration.
    pub logging: LoggingSection,
}

/// Session lifecycle configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Inactivity window in minutes before a session expires.
    pub timeout_minutes: u64,
    /// Maximum concurrent live sessions per owner.
    pub max_sessions_per_owner: usize,
    /// Interval in seconds between expiry sweeps.
    pub sweep_interval_secs: u64,
    /// Root directory below which script paths are resolved.
    pub script_base_dir: PathBuf,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            timeout_minutes: 60,
            max_sessions_per_owner: 3,
            sweep_interval_secs: 300,
            script_base_dir: PathBuf::from("scripts"),
        }
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level (error, warn, info, debug, trace).
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        serde_json::from_str(&content).map_err(ConfigError::Json)
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) {
        if let Ok(minutes) = std::env::var("TERM_RELAY_SESSION_TIMEOUT_MINUTES") {
            if let Ok(minutes) = minutes.parse() {
                self.session.timeout_minutes = minutes;
            }
        }

        if let Ok(max) = std::env::var("TERM_RELAY_MAX_SESSIONS_PER_OWNER") {
            if let Ok(max) = max.parse() {
                self.session.max_sessions_per_owner = max;
            }
        }

        if let Ok(secs) = std::env::var("TERM_RELAY_SWEEP_INTERVAL_SECS") {
            if let Ok(secs) = secs.parse() {
                self.session.sweep_interval_secs = secs;
            }
        }

        if let Ok(dir) = std::env::var("TERM_RELAY_SCRIPT_BASE_DIR") {
            if !dir.is_empty() {
                self.session.script_base_dir = PathBuf::from(dir);
            }
        }

        if let Ok(level) = std::env::var("TERM_RELAY_LOG_LEVEL") {
            self.logging.level = level;
        } else if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
    }

    /// Load configuration with the full priority chain.
    ///
    /// Priority: env vars > config file > defaults
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match config_file {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        config.apply_env();
        Ok(config)
    }

    /// Inactivity window before a session expires.
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session.timeout_minutes * 60)
    }

    /// Interval between expiry sweeps.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session.sweep_interval_secs)
    }

    /// Get the log level filter string.
    pub fn log_filter(&self) -> &str {
        &self.logging.level
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    Io(std::io::Error),
    /// JSON parsing error.
    Json(serde_json::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "failed to read config file: {}", e),
            Self::Json(e) => write!(f, "failed to parse config file: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.session.timeout_minutes, 60);
        assert_eq!(config.session.max_sessions_per_owner, 3);
        assert_eq!(config.session.sweep_interval_secs, 300);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "session": {
                "timeout_minutes": 15,
                "max_sessions_per_owner": 5,
                "script_base_dir": "/srv/release/scripts"
            }
        }"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.session.timeout_minutes, 15);
        assert_eq!(config.session.max_sessions_per_owner, 5);
        assert_eq!(
            config.session.script_base_dir,
            PathBuf::from("/srv/release/scripts")
        );
        // Untouched section keeps its default
        assert_eq!(config.session.sweep_interval_secs, 300);
    }

    #[test]
    fn test_config_partial_json() {
        let json = r#"{
            "logging": {
                "level": "debug"
            }
        }"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.session.timeout_minutes, 60); // Default
    }

    #[test]
    fn test_duration_helpers() {
        let config = Config::default();
        assert_eq!(config.session_timeout(), Duration::from_secs(3600));
        assert_eq!(config.sweep_interval(), Duration::from_secs(300));
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        assert!(json.contains("\"timeout_minutes\""));
        assert!(json.contains("\"max_sessions_per_owner\""));
    }
}
