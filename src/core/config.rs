//! Gateway configuration
//!
//! The JSON config file is read once at startup; environment tuning lives in
//! [`RuntimeEnv`]. Both are read-only afterwards.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{Error, Result};
use super::types::BroadcastFlags;
use super::{DEFAULT_HTTP_PORT, DEFAULT_Z21_PORT, MAX_PROGRAMMING_TIMEOUT, MAX_TURNOUT_PULSE};

/// Top-level gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Port of the client WebSocket listener
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Command station link
    pub z21: Z21Config,
    /// Reaction to disappearing clients
    #[serde(default)]
    pub safety: SafetyConfig,
    /// CV programming settings
    #[serde(default)]
    pub programming: ProgrammingConfig,
    /// Turnout actuation settings
    #[serde(default)]
    pub switching: SwitchingConfig,
    /// Development-only settings, kept opaque
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev: Option<serde_json::Value>,
}

/// Command station link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Z21Config {
    /// Host name or IP of the central
    pub host: String,
    /// UDP port of the central
    #[serde(default = "default_z21_port")]
    pub udp_port: u16,
    /// Fixed local UDP port; ephemeral when absent
    #[serde(default)]
    pub listen_port: Option<u16>,
    /// Log every raw datagram at info level
    #[serde(default)]
    pub debug: bool,
    /// Broadcast subscription sent at startup
    #[serde(default, rename = "broadcastflags")]
    pub broadcast_flags: Option<u32>,
}

impl Z21Config {
    /// Broadcast flags to subscribe with, falling back to the gateway default
    pub fn broadcast_flags(&self) -> BroadcastFlags {
        self.broadcast_flags.map(BroadcastFlags).unwrap_or_default()
    }
}

/// Which disconnects trigger the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SafetyTrigger {
    /// Only when no live session remains
    #[default]
    LastSession,
    /// Whenever a live session goes away
    AnySession,
}

/// What the supervisor sends to the central
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SafetyAction {
    #[default]
    EmergencyStop,
    TrackPowerOff,
    Both,
}

/// Safety supervisor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyConfig {
    #[serde(default)]
    pub stop_all_on_client_disconnect: bool,
    #[serde(default)]
    pub trigger: SafetyTrigger,
    #[serde(default)]
    pub action: SafetyAction,
}

/// CV programming configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProgrammingConfig {
    /// How long a request may wait for a result or NACK
    #[serde(serialize_with = "super::serde::serialize_millis")]
    #[serde(deserialize_with = "super::serde::deserialize_millis")]
    pub timeout_ms: Duration,
}

impl Default for ProgrammingConfig {
    fn default() -> Self {
        ProgrammingConfig {
            timeout_ms: Duration::from_secs(30),
        }
    }
}

/// Turnout actuation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SwitchingConfig {
    /// Pulse length used when a set command omits `pulseMs`
    #[serde(serialize_with = "super::serde::serialize_millis")]
    #[serde(deserialize_with = "super::serde::deserialize_millis")]
    pub default_pulse_ms: Duration,
}

impl Default for SwitchingConfig {
    fn default() -> Self {
        SwitchingConfig {
            default_pulse_ms: Duration::from_millis(200),
        }
    }
}

fn default_http_port() -> u16 {
    DEFAULT_HTTP_PORT
}

fn default_z21_port() -> u16 {
    DEFAULT_Z21_PORT
}

impl Config {
    /// Loads and validates a JSON configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    /// Parses and validates configuration text
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(text)
            .map_err(|e| Error::config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.z21.host.trim().is_empty() {
            return Err(Error::config("z21.host must not be empty"));
        }
        if self.z21.udp_port == 0 {
            return Err(Error::config("z21.udpPort must not be 0"));
        }
        let timeout = self.programming.timeout_ms;
        if timeout.is_zero() || timeout > MAX_PROGRAMMING_TIMEOUT {
            return Err(Error::config(format!(
                "programming.timeoutMs must be within 1..={}",
                MAX_PROGRAMMING_TIMEOUT.as_millis()
            )));
        }
        if self.switching.default_pulse_ms > MAX_TURNOUT_PULSE {
            return Err(Error::config(format!(
                "switching.defaultPulseMs must not exceed {}",
                MAX_TURNOUT_PULSE.as_millis()
            )));
        }
        Ok(())
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Runtime tuning read from the environment once at startup
#[derive(Debug, Clone)]
pub struct RuntimeEnv {
    /// `LOG_LEVEL`, an env-filter directive
    pub log_level: String,
    /// `LOG_FORMAT`, `text` or `json`
    pub log_format: LogFormat,
    /// `HEARTBEAT_INTERVAL_MS`
    pub heartbeat_interval: Duration,
    /// `GATEWAY_CONFIG`
    pub config_path: Option<String>,
}

impl Default for RuntimeEnv {
    fn default() -> Self {
        RuntimeEnv {
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            heartbeat_interval: Duration::from_secs(10),
            config_path: None,
        }
    }
}

impl RuntimeEnv {
    /// Reads the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the runtime settings from any key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut env = RuntimeEnv::default();

        if let Some(level) = lookup("LOG_LEVEL").filter(|v| !v.is_empty()) {
            env.log_level = level;
        }

        if let Some(format) = lookup("LOG_FORMAT") {
            env.log_format = match format.to_ascii_lowercase().as_str() {
                "" | "text" | "pretty" => LogFormat::Text,
                "json" => LogFormat::Json,
                other => return Err(Error::config(format!("Unknown LOG_FORMAT {:?}", other))),
            };
        }

        if let Some(interval) = lookup("HEARTBEAT_INTERVAL_MS") {
            let millis: u64 = interval
                .parse()
                .map_err(|_| Error::config(format!("Invalid HEARTBEAT_INTERVAL_MS {:?}", interval)))?;
            if millis == 0 {
                return Err(Error::config("HEARTBEAT_INTERVAL_MS must be positive"));
            }
            env.heartbeat_interval = Duration::from_millis(millis);
        }

        env.config_path = lookup("GATEWAY_CONFIG").filter(|v| !v.is_empty());
        Ok(env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"{
        "httpPort": 8042,
        "z21": { "host": "192.168.0.111", "udpPort": 21105, "debug": true, "broadcastflags": 257 },
        "safety": { "stopAllOnClientDisconnect": true, "trigger": "anySession", "action": "both" },
        "programming": { "timeoutMs": 5000 },
        "dev": { "mockCentral": true }
    }"#;

    #[test]
    fn test_parse_config() {
        let config = Config::from_json(SAMPLE).unwrap();
        assert_eq!(config.http_port, 8042);
        assert_eq!(config.z21.host, "192.168.0.111");
        assert!(config.z21.debug);
        assert_eq!(config.z21.listen_port, None);
        assert_eq!(config.z21.broadcast_flags(), BroadcastFlags(0x101));
        assert!(config.safety.stop_all_on_client_disconnect);
        assert_eq!(config.safety.trigger, SafetyTrigger::AnySession);
        assert_eq!(config.safety.action, SafetyAction::Both);
        assert_eq!(config.programming.timeout_ms, Duration::from_secs(5));
        assert_eq!(config.switching.default_pulse_ms, Duration::from_millis(200));
        assert!(config.dev.is_some());
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_json(r#"{ "z21": { "host": "z21.local" } }"#).unwrap();
        assert_eq!(config.http_port, DEFAULT_HTTP_PORT);
        assert_eq!(config.z21.udp_port, DEFAULT_Z21_PORT);
        assert!(!config.safety.stop_all_on_client_disconnect);
        assert_eq!(config.safety.trigger, SafetyTrigger::LastSession);
        assert_eq!(config.z21.broadcast_flags(), BroadcastFlags::default());
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(Config::from_json("{}"), Err(Error::Config(_))));
        assert!(Config::from_json(r#"{ "z21": { "host": " " } }"#).is_err());
        assert!(Config::from_json(r#"{ "z21": { "host": "a", "udpPort": 0 } }"#).is_err());
        assert!(Config::from_json(r#"{ "z21": { "host": "a" }, "programming": { "timeoutMs": 0 } }"#).is_err());
    }

    #[test]
    fn test_timer_lengths_are_bounded() {
        let oversized = Config::from_json(r#"{ "z21": { "host": "a" }, "programming": { "timeoutMs": 18446744073709551615 } }"#);
        assert!(matches!(oversized, Err(Error::Config(_))));
        assert!(Config::from_json(r#"{ "z21": { "host": "a" }, "programming": { "timeoutMs": 300000 } }"#).is_ok());
        assert!(Config::from_json(r#"{ "z21": { "host": "a" }, "switching": { "defaultPulseMs": 10001 } }"#).is_err());
        assert!(Config::from_json(r#"{ "z21": { "host": "a" }, "switching": { "defaultPulseMs": 10000 } }"#).is_ok());
    }

    #[test]
    fn test_runtime_env() {
        let vars: HashMap<&str, &str> = [
            ("LOG_LEVEL", "debug"),
            ("LOG_FORMAT", "JSON"),
            ("HEARTBEAT_INTERVAL_MS", "2500"),
        ]
        .into_iter()
        .collect();

        let env = RuntimeEnv::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(env.log_level, "debug");
        assert_eq!(env.log_format, LogFormat::Json);
        assert_eq!(env.heartbeat_interval, Duration::from_millis(2500));
        assert!(env.config_path.is_none());

        assert!(RuntimeEnv::from_lookup(|key| (key == "HEARTBEAT_INTERVAL_MS").then(|| "soon".to_string())).is_err());
        assert!(RuntimeEnv::from_lookup(|key| (key == "LOG_FORMAT").then(|| "xml".to_string())).is_err());
    }
}
