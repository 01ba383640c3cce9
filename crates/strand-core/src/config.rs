//! Configuration system for Strand.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $STRAND_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/strand/config.toml
//!   3. ~/.config/strand/config.toml

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StrandConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub link: LinkConfig,
    pub migration: MigrationConfig,
    /// Link strategy per network name, e.g. `[strategies.tcp]`.
    pub strategies: BTreeMap<String, StrategyConfig>,
    /// Static endpoint seeds.
    pub endpoints: Vec<EndpointSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Hex-encoded X25519 private key. Generated on first run.
    pub keypair_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP listen address for inbound links.
    pub listen: String,
    /// Port for the local admin API (bound to 127.0.0.1). 0 disables it.
    pub api_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Concurrent dial workers per link attempt.
    pub worker_count: usize,
    /// Upper bound for one link attempt.
    pub link_timeout_secs: u64,
    /// How long a ping waits for its pong.
    pub ping_timeout_secs: u64,
    /// Background pings scheduled after outbound traffic.
    pub auto_check_pings: u32,
    /// Per-session read buffer in bytes.
    pub session_buffer: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Total deadline for one migration.
    pub timeout_secs: u64,
    /// How often the responder checks whether the marker has arrived.
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Basic,
    Persistent,
    Tor,
    /// Hole punching through a rendezvous coordinator. Only usable when the
    /// embedding program supplies the coordinator client.
    Nat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub kind: StrategyKind,
    /// Immediate retries, no delay.
    pub quick_retries: u32,
    /// Retries with delay (fixed for persistent, backoff for tor).
    pub retries: u32,
    pub retry_delay_ms: u64,
    /// Foreground window before the caller is released.
    pub signal_timeout_ms: u64,
    /// How long the background phase keeps trying.
    pub background_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSeed {
    /// Hex identity of the node.
    pub identity: String,
    pub network: String,
    pub address: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            keypair_path: config_dir().join("keypair"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:1791".to_string(),
            api_port: 9091,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            worker_count: 8,
            link_timeout_secs: 60,
            ping_timeout_secs: 30,
            auto_check_pings: 2,
            session_buffer: 4 * 1024 * 1024,
        }
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            poll_interval_ms: 50,
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            kind: StrategyKind::Basic,
            quick_retries: 2,
            retries: 5,
            retry_delay_ms: 2_000,
            signal_timeout_ms: 15_000,
            background_timeout_ms: 120_000,
        }
    }
}

impl LinkConfig {
    pub fn link_timeout(&self) -> Duration {
        Duration::from_secs(self.link_timeout_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }
}

impl MigrationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl StrategyConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn signal_timeout(&self) -> Duration {
        Duration::from_millis(self.signal_timeout_ms)
    }

    pub fn background_timeout(&self) -> Duration {
        Duration::from_millis(self.background_timeout_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("strand")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl StrandConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            StrandConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("STRAND_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&StrandConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply STRAND_* overrides read through `lookup`.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("STRAND_IDENTITY__KEYPAIR_PATH") {
            self.identity.keypair_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("STRAND_NETWORK__LISTEN") {
            self.network.listen = v;
        }
        if let Some(p) = lookup("STRAND_NETWORK__API_PORT").and_then(|v| v.parse().ok()) {
            self.network.api_port = p;
        }
        if let Some(n) = lookup("STRAND_LINK__WORKER_COUNT").and_then(|v| v.parse().ok()) {
            self.link.worker_count = n;
        }
        if let Some(n) = lookup("STRAND_LINK__LINK_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.link.link_timeout_secs = n;
        }
        if let Some(n) = lookup("STRAND_LINK__PING_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.link.ping_timeout_secs = n;
        }
        if let Some(n) = lookup("STRAND_LINK__AUTO_CHECK_PINGS").and_then(|v| v.parse().ok()) {
            self.link.auto_check_pings = n;
        }
        if let Some(n) = lookup("STRAND_LINK__SESSION_BUFFER").and_then(|v| v.parse().ok()) {
            self.link.session_buffer = n;
        }
        if let Some(n) = lookup("STRAND_MIGRATION__TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.migration.timeout_secs = n;
        }
        if let Some(n) = lookup("STRAND_MIGRATION__POLL_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.migration.poll_interval_ms = n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_protocol_constants() {
        let config = StrandConfig::default();
        assert_eq!(config.link.worker_count, 8);
        assert_eq!(config.link.ping_timeout(), Duration::from_secs(30));
        assert_eq!(config.link.link_timeout(), Duration::from_secs(60));
        assert_eq!(config.link.session_buffer, 4 * 1024 * 1024);
        assert_eq!(config.migration.timeout(), Duration::from_secs(10));
        assert_eq!(config.migration.poll_interval(), Duration::from_millis(50));
    }

    #[test]
    fn env_overrides_take_precedence() {
        let mut config = StrandConfig::default();
        config.apply_env_overrides(|key| match key {
            "STRAND_NETWORK__LISTEN" => Some("127.0.0.1:4000".into()),
            "STRAND_LINK__WORKER_COUNT" => Some("3".into()),
            "STRAND_NETWORK__API_PORT" => Some("not-a-port".into()),
            _ => None,
        });
        assert_eq!(config.network.listen, "127.0.0.1:4000");
        assert_eq!(config.link.worker_count, 3);
        assert_eq!(config.network.api_port, 9091, "unparsable values are ignored");
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let text = r#"
            [network]
            listen = "[::]:1800"

            [strategies.tor]
            kind = "tor"
            quick_retries = 1

            [strategies.punch]
            kind = "nat"

            [[endpoints]]
            identity = "00"
            network = "tcp"
            address = "10.0.0.2:1791"
        "#;
        let config: StrandConfig = toml::from_str(text).unwrap();
        assert_eq!(config.network.listen, "[::]:1800");
        assert_eq!(config.network.api_port, 9091);
        let tor = &config.strategies["tor"];
        assert_eq!(tor.kind, StrategyKind::Tor);
        assert_eq!(tor.quick_retries, 1);
        assert_eq!(tor.retries, StrategyConfig::default().retries);
        assert_eq!(config.strategies["punch"].kind, StrategyKind::Nat);
        assert_eq!(config.endpoints.len(), 1);
    }

    #[test]
    fn write_default_if_missing_creates_file() {
        let tmp = std::env::temp_dir().join(format!("strand-config-test-{}", std::process::id()));
        let config_path = tmp.join("config.toml");
        std::fs::create_dir_all(&tmp).unwrap();

        unsafe {
            std::env::set_var("STRAND_CONFIG", config_path.to_str().unwrap());
        }

        let path = StrandConfig::write_default_if_missing().expect("write_default_if_missing failed");
        assert!(path.exists());
        let config = StrandConfig::from_file(&path).expect("load should succeed");
        assert_eq!(config.link.worker_count, 8);

        unsafe {
            std::env::remove_var("STRAND_CONFIG");
        }
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
