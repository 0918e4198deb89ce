use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::rendezvous::SessionConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub nostr: NostrConfig,
    #[serde(default)]
    pub webrtc: WebRtcConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NostrConfig {
    #[serde(default = "default_relays")]
    pub relays: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcConfig {
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
}

fn default_relays() -> Vec<String> {
    SessionConfig::default().relays
}

fn default_stun_servers() -> Vec<String> {
    SessionConfig::default().stun_servers
}

impl Default for NostrConfig {
    fn default() -> Self {
        Self {
            relays: default_relays(),
        }
    }
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: default_stun_servers(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nostr: NostrConfig::default(),
            webrtc: WebRtcConfig::default(),
        }
    }
}

impl Config {
    /// Load config from file, or create default if doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = get_config_path();

        if config_path.exists() {
            let content =
                fs::read_to_string(&config_path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        let config_path = get_config_path();

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&config_path, content)?;

        Ok(())
    }

    /// Runtime session configuration derived from the file contents
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            relays: self.nostr.relays.clone(),
            stun_servers: self.webrtc.stun_servers.clone(),
            ..SessionConfig::default()
        }
    }
}

/// Get the peerdoc directory (~/.peerdoc)
pub fn get_peerdoc_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".peerdoc")
}

/// Get the config file path (~/.peerdoc/config.toml)
pub fn get_config_path() -> PathBuf {
    get_peerdoc_dir().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(!config.nostr.relays.is_empty());
        assert!(!config.webrtc.stun_servers.is_empty());
        assert!(config.nostr.relays[0].starts_with("wss://"));
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.nostr.relays, config.nostr.relays);
        assert_eq!(parsed.webrtc.stun_servers, config.webrtc.stun_servers);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let parsed: Config = toml::from_str("[nostr]\nrelays = [\"wss://example.com\"]\n").unwrap();
        assert_eq!(parsed.nostr.relays, vec!["wss://example.com".to_string()]);
        assert!(!parsed.webrtc.stun_servers.is_empty());
    }

    #[test]
    fn test_session_config_carries_file_values() {
        let mut config = Config::default();
        config.nostr.relays = vec!["wss://relay.test".to_string()];
        let session = config.session_config();
        assert_eq!(session.relays, vec!["wss://relay.test".to_string()]);
        assert_eq!(session.connection_timeout_ms, 15_000);
    }
}
