//! TOML configuration for a meshbench peer.
//!
//! Layered model: an explicit file from `MESHBENCH_CONFIG`, then the system
//! location, then compiled-in defaults. Every section is optional.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "MESHBENCH_CONFIG";

/// System-wide config location.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/meshbench/meshbench.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for a peer process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub saturation: SaturationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PeerConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded peer configuration");
        Ok(config)
    }

    /// Try `MESHBENCH_CONFIG`, then [`SYSTEM_CONFIG_PATH`], then defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "MESHBENCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Defaults with the control listener on an ephemeral loopback port.
    pub fn loopback() -> Self {
        let mut config = Self::default();
        config.network.listen_address = "127.0.0.1:0".to_string();
        config
    }
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the control listener binds to.
    pub listen_address: String,
    /// Host announced to peers in the hello exchange. Defaults to the bound
    /// IP; peers replace an unspecified one with the address they observe.
    pub advertise_host: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:4000".to_string(),
            advertise_host: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Timeouts
// ---------------------------------------------------------------------------

/// Bounds on every blocking wait a protocol performs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Control connection establishment, including the hello exchange.
    pub connect_ms: u64,
    /// Default bound for small RPCs (group operations, acks).
    pub rpc_sec: u64,
    /// Bandwidth and saturation handshakes.
    pub handshake_sec: u64,
    /// Measurement accept and each transfer round.
    pub transfer_sec: u64,
    /// Controller waiting on an orchestrated bandwidth test.
    pub bw_request_sec: u64,
    /// Per-receive bound on the saturation target; expiry means the flood ended.
    pub saturation_idle_ms: u64,
    /// Default bound for `saturate_stop`.
    pub stop_sec: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 5_000,
            rpc_sec: 60,
            handshake_sec: 60,
            transfer_sec: 120,
            bw_request_sec: 240,
            saturation_idle_ms: 1_000,
            stop_sec: 120,
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn rpc(&self) -> Duration {
        Duration::from_secs(self.rpc_sec)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_sec)
    }

    pub fn transfer(&self) -> Duration {
        Duration::from_secs(self.transfer_sec)
    }

    pub fn bw_request(&self) -> Duration {
        Duration::from_secs(self.bw_request_sec)
    }

    pub fn saturation_idle(&self) -> Duration {
        Duration::from_millis(self.saturation_idle_ms)
    }

    pub fn stop(&self) -> Duration {
        Duration::from_secs(self.stop_sec)
    }
}

// ---------------------------------------------------------------------------
// Saturation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SaturationConfig {
    /// Message size of the probe used to auto-tune the flood chunk.
    pub probe_message_size: u64,
    /// Minimum duration of that probe.
    pub probe_min_duration_ms: u64,
    /// Upper bound for flood chunks and grown bandwidth messages.
    pub max_message_size: u64,
}

impl Default for SaturationConfig {
    fn default() -> Self {
        Self {
            probe_message_size: 512 * 1024,
            probe_min_duration_ms: 1_000,
            max_message_size: 64 * 1024 * 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}
