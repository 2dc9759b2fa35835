//! Asset connection simulator entry point.
//!
//! ```text
//! main()
//!  └─ SimConfig::load()        -- [core], [connection], [types], [outputs]
//!  └─ Simulation::start()      -- embedded server + OpcUaAssetConnection::init
//!       ├─ read_all()          -- one read per value provider
//!       ├─ watch_all()         -- logs every subscription sample
//!       └─ invoke()            -- each [[invocations]] entry
//!  └─ wait for Ctrl-C or --watch-secs
//!  └─ Simulation::shutdown()   -- close()
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use assetlink_sim::{SimConfig, Simulation};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Runs an asset connection against an in-process OPC UA server.
#[derive(Debug, Parser)]
#[command(name = "assetlink-sim", version)]
struct Cli {
    /// Simulator configuration file.
    #[arg(long, env = "ASSETLINK_CONFIG", default_value = "sim.toml")]
    config: PathBuf,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long, env = "ASSETLINK_WATCH_SECS")]
    watch_secs: Option<u64>,

    /// Log level used when `RUST_LOG` is not set.
    #[arg(long, default_value = "info", env = "ASSETLINK_LOG_LEVEL")]
    log_level: String,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // `RUST_LOG` wins over --log-level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = SimConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let simulation = Simulation::start(&config).await?;

    simulation.read_all().await;
    simulation.watch_all();
    for invocation in &config.invocations {
        if let Err(e) = simulation.invoke(invocation).await {
            error!("{e:#}");
        }
    }

    match cli.watch_secs {
        Some(secs) => {
            info!("watching for {secs}s");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
            }
        }
        None => {
            info!("watching; press Ctrl-C to exit");
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
            info!("shutdown signal received");
        }
    }

    simulation.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["assetlink-sim"]);
        assert_eq!(cli.config, PathBuf::from("sim.toml"));
        assert_eq!(cli.watch_secs, None);
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from([
            "assetlink-sim",
            "--config",
            "other.toml",
            "--watch-secs",
            "3",
            "--log-level",
            "debug",
        ]);
        assert_eq!(cli.config, PathBuf::from("other.toml"));
        assert_eq!(cli.watch_secs, Some(3));
        assert_eq!(cli.log_level, "debug");
    }
}
