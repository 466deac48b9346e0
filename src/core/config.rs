//! Configuration management for browsectl
//!
//! Supports environment variables, config files, and runtime overrides.
//!
//! Config file location: ~/.config/browsectl/config.toml

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::core::error::{BrowseError, Result};

/// Main configuration for browsectl
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Session defaults
    #[serde(default)]
    pub session: SessionConfig,
    /// Daemon lifecycle and addressing
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// Automation engine selection
    #[serde(default)]
    pub engine: EngineConfig,
    /// Host-bridge settings
    #[serde(default)]
    pub bridge: BridgeConfig,
}

/// Session defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session used when none is given on the command line
    pub default_name: String,
}

/// How session endpoints are addressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Unix sockets where available, TCP loopback elsewhere
    Auto,
    /// Always TCP loopback
    Tcp,
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Seconds without clients or commands before the daemon exits
    pub idle_timeout_secs: u64,
    /// Directory for sockets and pid files
    pub socket_dir: Option<PathBuf>,
    /// Endpoint addressing mode
    pub transport: Transport,
    /// First port of the loopback range
    pub port_base: u16,
    /// Number of ports in the loopback range
    pub port_span: u16,
    /// How long a client waits for a freshly spawned daemon, in ms
    pub spawn_timeout_ms: u64,
}

/// Which automation engine the daemon drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Engine calls go over the host bridge to an attached peer
    Bridge,
    /// Fixture-backed in-process engine
    Memory,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine implementation
    pub kind: EngineKind,
    /// JSON fixture file for the memory engine
    pub fixtures: Option<PathBuf>,
}

/// Host-bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Ceiling for every awaited bridge reply, in seconds
    pub request_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_name: env::var("BROWSECTL_SESSION").unwrap_or_else(|_| "default".to_string()),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: env::var("BROWSECTL_IDLE_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(600),
            socket_dir: env::var("BROWSECTL_SOCKET_DIR").ok().map(PathBuf::from),
            transport: match env::var("BROWSECTL_TRANSPORT").as_deref() {
                Ok("tcp") => Transport::Tcp,
                _ => Transport::Auto,
            },
            port_base: 49152,
            port_span: 16384,
            spawn_timeout_ms: 5000,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: match env::var("BROWSECTL_ENGINE").as_deref() {
                Ok("memory") => EngineKind::Memory,
                _ => EngineKind::Bridge,
            },
            fixtures: env::var("BROWSECTL_FIXTURES").ok().map(PathBuf::from),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("browsectl")
    }

    /// Get the config file path
    pub fn config_file() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load configuration from file, environment, and defaults
    /// Priority: CLI args > config file > env vars > defaults
    pub fn load() -> Self {
        let _ = dotenvy::dotenv();

        match Self::load_from_file() {
            Ok(config) => config,
            Err(e) => {
                if Self::config_exists() {
                    tracing::warn!("Ignoring config file: {}", e);
                }
                Self::default()
            }
        }
    }

    /// Load configuration from file only
    pub fn load_from_file() -> Result<Self> {
        let config_path = Self::config_file();

        if !config_path.exists() {
            return Err(BrowseError::config("Config file not found"));
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|e| BrowseError::config(format!("Failed to read config: {}", e)))?;

        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| BrowseError::config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file and return the path
    pub fn save(&self) -> Result<PathBuf> {
        let config_dir = Self::config_dir();
        let config_path = Self::config_file();

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .map_err(|e| BrowseError::config(format!("Failed to create config dir: {}", e)))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| BrowseError::config(format!("Failed to serialize config: {}", e)))?;

        fs::write(&config_path, content)
            .map_err(|e| BrowseError::config(format!("Failed to write config: {}", e)))?;

        Ok(config_path)
    }

    /// Check if a config file exists
    pub fn config_exists() -> bool {
        Self::config_file().exists()
    }

    /// Directory holding session sockets and pid files
    pub fn socket_dir(&self) -> PathBuf {
        if let Some(dir) = &self.daemon.socket_dir {
            return dir.clone();
        }
        dirs::runtime_dir()
            .map(|d| d.join("browsectl"))
            .or_else(|| dirs::home_dir().map(|h| h.join(".browsectl")))
            .unwrap_or_else(|| env::temp_dir().join("browsectl"))
    }

    /// Idle period after which a daemon reaps itself
    pub fn idle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.daemon.idle_timeout_secs)
    }

    /// Ceiling for awaited bridge replies
    pub fn bridge_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.bridge.request_timeout_secs)
    }

    /// Generate a default config file content for display
    pub fn default_config_toml() -> String {
        toml::to_string_pretty(&Config::default())
            .unwrap_or_else(|_| String::from("# Error generating config"))
    }
}

/// Check a session name is usable as an endpoint key
pub fn validate_session_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(BrowseError::config(format!(
            "Session name must be 1-64 characters, got {}",
            name.len()
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(BrowseError::config(format!(
            "Session name '{}' may only contain letters, digits, '-' and '_'",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.bridge.request_timeout_secs, 30);
        assert_eq!(config.daemon.port_base, 49152);
        assert_eq!(config.daemon.port_span, 16384);
    }

    #[test]
    fn test_config_from_toml() {
        let config = Config::from_toml(
            r#"
            [daemon]
            idle_timeout_secs = 5
            transport = "tcp"
            port_base = 40000
            port_span = 1000
            spawn_timeout_ms = 200

            [engine]
            kind = "memory"
            "#,
        )
        .unwrap();
        assert_eq!(config.daemon.idle_timeout_secs, 5);
        assert_eq!(config.daemon.transport, Transport::Tcp);
        assert_eq!(config.engine.kind, EngineKind::Memory);
        assert_eq!(config.bridge.request_timeout_secs, 30);
    }

    #[test]
    fn test_config_serialization() {
        let toml_str = Config::default_config_toml();
        assert!(toml_str.contains("idle_timeout_secs"));
        assert!(toml_str.contains("request_timeout_secs"));
    }

    #[test]
    fn test_config_dir() {
        let dir = Config::config_dir();
        assert!(dir.to_string_lossy().contains("browsectl"));
    }

    #[test]
    fn test_validate_session_name() {
        assert!(validate_session_name("default").is_ok());
        assert!(validate_session_name("agent_2-b").is_ok());
        assert!(validate_session_name("").is_err());
        assert!(validate_session_name("../etc").is_err());
        assert!(validate_session_name(&"x".repeat(65)).is_err());
    }
}
