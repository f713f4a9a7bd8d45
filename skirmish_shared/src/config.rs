//! Configuration system.
//!
//! Loads configuration from JSON strings or files. Every field except the
//! server address and tick rate has a default, so a minimal file is enough.

use std::{collections::BTreeMap, path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Root configuration shared by client/server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Server listen address, e.g. `127.0.0.1:40000`.
    pub server_addr: String,
    /// Server loop rate.
    pub tick_hz: u32,
    /// Player name (client only).
    #[serde(default = "default_player_name")]
    pub player_name: String,
    /// How long a client waits for a reply before reporting a timeout.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Attempts for idempotent calls such as `FETCH_RESOURCES`.
    #[serde(default = "default_fetch_retry_attempts")]
    pub fetch_retry_attempts: u32,
    /// Resources every new session starts with (server only).
    #[serde(default = "default_starting_resources")]
    pub starting_resources: BTreeMap<String, u64>,
    /// Targetable entities spawned at startup (server only).
    #[serde(default = "default_target_count")]
    pub target_count: u32,
    /// Jumps allowed before landing (client only).
    #[serde(default = "default_max_air_jumps")]
    pub max_air_jumps: u32,
}

fn default_player_name() -> String {
    "Player".to_string()
}

fn default_request_timeout_ms() -> u64 {
    2000
}

fn default_fetch_retry_attempts() -> u32 {
    3
}

fn default_starting_resources() -> BTreeMap<String, u64> {
    BTreeMap::from([("gold".to_string(), 100), ("wood".to_string(), 50)])
}

fn default_target_count() -> u32 {
    4
}

fn default_max_air_jumps() -> u32 {
    2
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:40000".to_string(),
            tick_hz: 64,
            player_name: default_player_name(),
            request_timeout_ms: default_request_timeout_ms(),
            fetch_retry_attempts: default_fetch_retry_attempts(),
            starting_resources: default_starting_resources(),
            target_count: default_target_count(),
            max_air_jumps: default_max_air_jumps(),
        }
    }
}

impl EngineConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Reads and parses a JSON config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Duration of one server loop iteration.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.tick_hz.max(1) as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_json_fills_defaults() {
        let cfg =
            EngineConfig::from_json_str(r#"{"server_addr":"0.0.0.0:4000","tick_hz":30}"#).unwrap();
        assert_eq!(cfg.server_addr, "0.0.0.0:4000");
        assert_eq!(cfg.request_timeout(), Duration::from_millis(2000));
        assert_eq!(cfg.starting_resources.get("gold"), Some(&100));
        assert_eq!(cfg.max_air_jumps, 2);
    }

    #[test]
    fn missing_required_field_is_an_error() {
        assert!(EngineConfig::from_json_str(r#"{"tick_hz":30}"#).is_err());
    }
}
