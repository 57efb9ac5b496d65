//! Mirror configuration
//!
//! Loaded from a TOML file. Every field has a default so an absent file or a
//! partial file both produce a usable configuration.
//!
//! ```toml
//! [polling]
//! list_interval_ms = 2000
//! summary_interval_ms = 5000
//!
//! [[users]]
//! id = "alice"
//! endpoint = "http://127.0.0.1:5000/RPC2"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MirrorError, Result};
use crate::rollup::EraSpec;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MirrorConfig {
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub serializer: SerializerConfig,
    #[serde(default)]
    pub rollup: RollupConfig,
    #[serde(default)]
    pub users: Vec<UserEndpoint>,
}

/// Poll intervals for the list and summary pollers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_list_interval_ms")]
    pub list_interval_ms: u64,
    #[serde(default = "default_summary_interval_ms")]
    pub summary_interval_ms: u64,
    /// rTorrent view queried by the list poll
    #[serde(default = "default_view")]
    pub view: String,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            list_interval_ms: default_list_interval_ms(),
            summary_interval_ms: default_summary_interval_ms(),
            view: default_view(),
        }
    }
}

impl PollingConfig {
    pub fn list_interval(&self) -> Duration {
        Duration::from_millis(self.list_interval_ms)
    }

    pub fn summary_interval(&self) -> Duration {
        Duration::from_millis(self.summary_interval_ms)
    }
}

/// Linear capped backoff shared by the gateway retry timer and the pollers
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub cap_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_backoff_base_ms(),
            cap_ms: default_backoff_cap_ms(),
        }
    }
}

impl BackoffConfig {
    /// `min(base * consecutive_errors, cap)`
    pub fn delay(&self, consecutive_errors: u32) -> Duration {
        let scaled = self.base_ms.saturating_mul(u64::from(consecutive_errors.max(1)));
        Duration::from_millis(scaled.min(self.cap_ms))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SerializerConfig {
    /// Minimum gap between one response and the next request
    #[serde(default = "default_min_spacing_ms")]
    pub min_spacing_ms: u64,
    /// Callers waiting behind the in-flight request before `call` rejects
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
}

impl Default for SerializerConfig {
    fn default() -> Self {
        Self {
            min_spacing_ms: default_min_spacing_ms(),
            max_queue_depth: default_max_queue_depth(),
        }
    }
}

impl SerializerConfig {
    pub fn min_spacing(&self) -> Duration {
        Duration::from_millis(self.min_spacing_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollupConfig {
    /// Promote evicted samples into the next era instead of dropping them
    #[serde(default = "default_true")]
    pub cascading: bool,
    /// Era table, finest first. Empty means the built-in table.
    #[serde(default)]
    pub eras: Vec<EraSpec>,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            cascading: true,
            eras: Vec::new(),
        }
    }
}

impl RollupConfig {
    pub fn era_table(&self) -> Vec<EraSpec> {
        if self.eras.is_empty() {
            EraSpec::default_table()
        } else {
            self.eras.clone()
        }
    }
}

/// Where a user's daemon lives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEndpoint {
    pub id: String,
    pub endpoint: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_list_interval_ms() -> u64 {
    2000
}

fn default_summary_interval_ms() -> u64 {
    5000
}

fn default_view() -> String {
    "main".to_string()
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_min_spacing_ms() -> u64 {
    250
}

fn default_max_queue_depth() -> usize {
    64
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

impl MirrorConfig {
    /// Default config file location (`<config dir>/torrent-mirror/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("torrent-mirror").join("config.toml"))
    }

    /// Load configuration from a specific path, defaults if the file is absent
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| MirrorError::ConfigError {
            message: format!("Failed to parse {}: {}", path.display(), e),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.polling.list_interval_ms == 0 || self.polling.summary_interval_ms == 0 {
            return Err(MirrorError::ConfigError {
                message: "poll intervals must be non-zero".to_string(),
            });
        }
        if self.backoff.cap_ms < self.backoff.base_ms {
            return Err(MirrorError::ConfigError {
                message: "backoff cap must not be below base".to_string(),
            });
        }
        for era in &self.rollup.eras {
            if era.interval_ms == 0 || era.retention_ms < era.interval_ms {
                return Err(MirrorError::ConfigError {
                    message: format!("era '{}' has an invalid interval/retention", era.name),
                });
            }
        }
        Ok(())
    }

    pub fn user(&self, id: &str) -> Option<&UserEndpoint> {
        self.users.iter().find(|u| u.id == id)
    }
}
