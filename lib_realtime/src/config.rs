//! # Engine Configuration
//!
//! All tunables in one serializable struct. Every field has a default, so a
//! partial JSON file (or none at all) yields a working engine; the file only
//! has to name the values it overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Cache capacity before batch LRU eviction kicks in.
    pub max_cache_entries: usize,
    /// Default entry TTL, seconds. Per-write TTLs override it.
    pub default_ttl_secs: u64,
    /// How often the background sweep removes expired cache entries.
    pub sweep_interval_secs: u64,
    /// How often a metrics window is collected and logged.
    pub metrics_interval_secs: u64,
    /// Scheduler tick granularity, milliseconds.
    pub scheduler_tick_ms: u64,
    /// Upper bound on a single source fetch.
    pub fetch_timeout_secs: u64,
    /// Event broadcast channel capacity.
    pub event_capacity: usize,
    /// Compress cached payloads by default.
    pub compress_by_default: bool,
    /// Encrypt cached payloads by default. Requires `encryption_key_hex`.
    pub encrypt_by_default: bool,
    /// Hex-encoded 256-bit AES key; unset disables the encryption codec.
    pub encryption_key_hex: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_cache_entries: 1000,
            default_ttl_secs: 300,
            sweep_interval_secs: 60,
            metrics_interval_secs: 60,
            scheduler_tick_ms: 200,
            fetch_timeout_secs: 10,
            event_capacity: 1024,
            compress_by_default: false,
            encrypt_by_default: false,
            encryption_key_hex: None,
        }
    }
}

impl EngineConfig {
    /// Loads a JSON config file. Missing fields fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}
