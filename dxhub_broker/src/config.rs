//! Broker startup configuration: an optional TOML file with every field
//! defaulted, overridable by CLI flags (§6 "Broker startup configuration").

use anyhow::Context;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub bind_endpoint: String,
    pub heartbeat_timeout_ms: u64,
    pub poll_timeout_ms: i64,
    pub curve_public_key_path: Option<String>,
    pub curve_secret_key_path: Option<String>,
    pub log_level: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_endpoint: "tcp://0.0.0.0:5570".to_string(),
            heartbeat_timeout_ms: 5000,
            poll_timeout_ms: 100,
            curve_public_key_path: None,
            curve_secret_key_path: None,
            log_level: "info".to_string(),
        }
    }
}

impl BrokerConfig {
    /// Load from `path` if given, else fall back to all-default config.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let text = std::fs::read_to_string(p)
                    .with_context(|| format!("reading broker config file {}", p.display()))?;
                toml::from_str(&text).with_context(|| format!("parsing broker config file {}", p.display()))
            }
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.bind_endpoint, "tcp://0.0.0.0:5570");
        assert_eq!(config.heartbeat_timeout_ms, 5000);
        assert_eq!(config.poll_timeout_ms, 100);
        assert!(config.curve_secret_key_path.is_none());
    }

    #[test]
    fn missing_config_path_falls_back_to_defaults() {
        let config = BrokerConfig::load(None).expect("default config");
        assert_eq!(config.bind_endpoint, BrokerConfig::default().bind_endpoint);
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("dxhub_broker_test_config_{}.toml", std::process::id()));
        std::fs::write(&path, "heartbeat_timeout_ms = 9000\n").expect("write config");

        let config = BrokerConfig::load(Some(&path)).expect("load config");
        assert_eq!(config.heartbeat_timeout_ms, 9000);
        assert_eq!(config.bind_endpoint, BrokerConfig::default().bind_endpoint);

        let _ = std::fs::remove_file(&path);
    }
}
