use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::capture::Quality;

/// Server configuration, loadable from a TOML file and overridable per-field
/// by CLI flags. Field names match the config file keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network bind address.
    pub bind_host: String,
    pub bind_port: u16,

    /// Root of persistent state: session store, recording scratch, emergency
    /// recordings.
    pub state_dir: PathBuf,

    /// Per-session cap across all connection kinds.
    pub max_connections_per_session: usize,
    /// Sliding-window rate limit per (session, source address).
    pub max_connections_per_minute: usize,
    pub rate_limit_window_seconds: u64,

    /// Soft memory cap driving idle-service cleanup.
    pub max_memory_mb: u64,
    pub memory_check_interval_secs: u64,

    /// Capture services with no clients are evicted after this long.
    pub service_idle_timeout_secs: u64,
    /// Period of the dead-connection reaper.
    pub connection_cleanup_interval_secs: u64,

    /// Initial capture preset for new streams.
    pub default_quality: Quality,
    pub default_fps: u32,

    /// Number of rotated session-store backups kept on disk.
    pub backup_retention_count: usize,

    /// Emergency recordings older than this are removed by cleanup.
    pub emergency_recording_max_age_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            bind_port: 8000,
            state_dir: PathBuf::from("state"),
            max_connections_per_session: 10,
            max_connections_per_minute: 20,
            rate_limit_window_seconds: 60,
            max_memory_mb: 2048,
            memory_check_interval_secs: 30,
            service_idle_timeout_secs: 300,
            connection_cleanup_interval_secs: 30,
            default_quality: Quality::High,
            default_fps: 60,
            backup_retention_count: 5,
            emergency_recording_max_age_secs: 7 * 24 * 3600,
        }
    }
}

impl Config {
    /// Load config from a TOML file path. Returns None if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    /// Validate option ranges. Violations are fatal at startup (exit code 2).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_port == 0 {
            return Err(ConfigError::Invalid("bind_port must be nonzero".into()));
        }
        if self.max_connections_per_session == 0 {
            return Err(ConfigError::Invalid(
                "max_connections_per_session must be at least 1".into(),
            ));
        }
        if self.max_connections_per_minute == 0 {
            return Err(ConfigError::Invalid(
                "max_connections_per_minute must be at least 1".into(),
            ));
        }
        if self.rate_limit_window_seconds == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit_window_seconds must be at least 1".into(),
            ));
        }
        if self.default_fps == 0 || self.default_fps > 120 {
            return Err(ConfigError::Invalid(
                "default_fps must be between 1 and 120".into(),
            ));
        }
        if self.backup_retention_count == 0 {
            return Err(ConfigError::Invalid(
                "backup_retention_count must be at least 1".into(),
            ));
        }
        self.bind_addr()?;
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_host, self.bind_port)
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(format!(
                    "invalid bind address {}:{}",
                    self.bind_host, self.bind_port
                ))
            })
    }

    pub fn sessions_file(&self) -> PathBuf {
        self.state_dir.join("sessions.json")
    }

    pub fn recordings_dir(&self) -> PathBuf {
        self.state_dir.join("recordings")
    }

    pub fn emergency_recordings_dir(&self) -> PathBuf {
        self.recordings_dir().join("_emergency")
    }
}

/// Errors that can occur when loading or validating config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.max_connections_per_session, 10);
        assert_eq!(config.max_connections_per_minute, 20);
        assert_eq!(config.rate_limit_window_seconds, 60);
        assert_eq!(config.max_memory_mb, 2048);
        assert_eq!(config.memory_check_interval_secs, 30);
        assert_eq!(config.service_idle_timeout_secs, 300);
        assert_eq!(config.connection_cleanup_interval_secs, 30);
        assert_eq!(config.backup_retention_count, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_partial_toml() {
        let toml = r#"
            bind_port = 9100
            max_connections_per_session = 4
            default_quality = "ultra"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.bind_port, 9100);
        assert_eq!(config.max_connections_per_session, 4);
        assert_eq!(config.default_quality, Quality::Ultra);
        // Unspecified fields keep their defaults
        assert_eq!(config.max_connections_per_minute, 20);
    }

    #[test]
    fn zero_caps_rejected() {
        let mut config = Config::default();
        config.max_connections_per_session = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.max_connections_per_minute = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.default_fps = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_bind_host_rejected() {
        let mut config = Config::default();
        config.bind_host = "not a host".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn state_paths_derive_from_state_dir() {
        let mut config = Config::default();
        config.state_dir = PathBuf::from("/var/lib/simbridge");
        assert_eq!(
            config.sessions_file(),
            PathBuf::from("/var/lib/simbridge/sessions.json")
        );
        assert_eq!(
            config.emergency_recordings_dir(),
            PathBuf::from("/var/lib/simbridge/recordings/_emergency")
        );
    }

    #[test]
    fn load_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(&dir.path().join("missing.toml")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("simbridge.toml");
        let mut config = Config::default();
        config.bind_port = 9999;
        std::fs::write(&path, toml::to_string_pretty(&config).unwrap()).unwrap();
        let loaded = Config::load(&path).unwrap().unwrap();
        assert_eq!(loaded.bind_port, 9999);
    }
}
