//! Provisioning configuration.
//!
//! Every field has a default, so a config file only needs the values it
//! changes:
//!
//! ```json
//! { "reassembly": "framed", "timings": { "test_timeout_ms": 30000 } }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use stripalerts_proto::ReassemblyMode;
use stripalerts_proto::ble::DEVICE_NAME_PREFIX;

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "STRIPALERTS_CONFIG";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Advertised name prefix used by discovery.
    pub name_prefix: String,
    /// How long discovery scans before picking a device.
    pub scan_secs: u64,
    /// Shape of the networks channel, must match the peripheral firmware.
    pub reassembly: ReassemblyMode,
    pub timings: Timings,
    pub reconnect: ReconnectConfig,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            name_prefix: DEVICE_NAME_PREFIX.to_string(),
            scan_secs: 5,
            reassembly: ReassemblyMode::default(),
            timings: Timings::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ProvisioningConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_secs)
    }

    /// `<config_dir>/stripalerts/provision.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("stripalerts").join("provision.json"))
    }

    /// Load from `explicit`, else `$STRIPALERTS_CONFIG`, else the default path
    /// if that file exists, else built-in defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }
}

/// Delays and timeouts of the provisioning sequence, in milliseconds.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Timings {
    /// Pause after a field write; must exceed the peripheral's 500 ms debounce.
    pub settle_ms: u64,
    /// Pause between entering the Wifi step and the automatic rescan.
    pub rescan_settle_ms: u64,
    /// How long to wait for a "Ready" notification before polling.
    pub ready_wait_ms: u64,
    pub ready_poll_attempts: u32,
    pub ready_poll_interval_ms: u64,
    pub test_timeout_ms: u64,
    pub save_timeout_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            settle_ms: 600,
            rescan_settle_ms: 300,
            ready_wait_ms: 3_000,
            ready_poll_attempts: 10,
            ready_poll_interval_ms: 500,
            test_timeout_ms: 20_000,
            save_timeout_ms: 10_000,
        }
    }
}

impl Timings {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn rescan_settle(&self) -> Duration {
        Duration::from_millis(self.rescan_settle_ms)
    }

    pub fn ready_wait(&self) -> Duration {
        Duration::from_millis(self.ready_wait_ms)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_millis(self.test_timeout_ms)
    }

    pub fn save_timeout(&self) -> Duration {
        Duration::from_millis(self.save_timeout_ms)
    }
}

/// Automatic recovery after an unsolicited disconnect.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Reconnect attempts per disconnect before asking the user to retry.
    pub max_attempts: u32,
    /// Delay before the second attempt, doubled for each further one.
    pub backoff_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 500,
        }
    }
}
