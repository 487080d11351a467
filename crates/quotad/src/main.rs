//! Shared cache manager helper binary.
//!
//! Exec'd by clients that want one quota manager process serving several
//! mounts of the same cache. Takes the workspace and quota parameters on
//! the command line, acquires the exclusive database lock, serves the
//! command FIFO until terminated, and prints `ready` on stdout once the
//! server is accepting commands.

use anyhow::{Context, Result};
use cairn_core::{CacheConfig, QuotaConfig};
use cairn_quota::QuotaError;
use cairn_quota::manager::{EXIT_CODE_LOCKED, QuotaManager};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::Deserialize;
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Cairn shared cache quota manager.
#[derive(Parser, Debug)]
#[command(name = "cairn-quotad")]
#[command(version, about, long_about = None)]
struct Args {
    /// Workspace directory for the index database, lock, and pipes.
    #[arg(long)]
    workspace: PathBuf,

    /// Cache directory holding the object files (defaults to workspace).
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Cache size limit in bytes.
    #[arg(long)]
    limit: u64,

    /// Cleanup target in bytes (defaults to half the limit).
    #[arg(long)]
    cleanup_threshold: Option<u64>,

    /// Stay attached to the terminal.
    #[arg(long)]
    foreground: bool,

    /// Rebuild the index from the cache directory before serving.
    #[arg(long)]
    rebuild: bool,

    /// Optional configuration file for the remaining quota settings.
    #[arg(long, env = "CAIRN_QUOTAD_CONFIG")]
    config: Option<PathBuf>,
}

/// File/env settings not covered by the command line.
#[derive(Debug, Default, Deserialize)]
struct QuotadConfig {
    #[serde(default)]
    async_delete: bool,
    #[serde(default)]
    pinned_fraction_pct: Option<u8>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut figment = Figment::new();
    if let Some(config_path) = &args.config {
        figment = figment.merge(Toml::file(config_path));
    }
    let file_config: QuotadConfig = figment
        .merge(Env::prefixed("CAIRN_QUOTAD_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    let cache = CacheConfig {
        cache_dir: args.cache_dir.clone().unwrap_or_else(|| args.workspace.clone()),
        workspace_dir: Some(args.workspace.clone()),
    };
    let mut quota = QuotaConfig::new(args.limit);
    quota.cleanup_threshold = args.cleanup_threshold;
    quota.async_delete = file_config.async_delete;
    if let Some(pct) = file_config.pinned_fraction_pct {
        quota.pinned_fraction_pct = pct;
    }

    tracing::info!(
        workspace = %args.workspace.display(),
        limit = quota.limit,
        threshold = quota.threshold(),
        "cairn-quotad v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let mut manager = match QuotaManager::create(cache, quota, args.rebuild).await {
        Ok(manager) => manager,
        Err(QuotaError::Locked) => {
            tracing::error!("cache database already locked, is another manager running?");
            std::process::exit(EXIT_CODE_LOCKED);
        }
        Err(e) => return Err(e).context("failed to open cache index"),
    };
    manager.spawn().context("failed to start command server")?;

    // Ready handshake for the client that exec'd us.
    println!("ready");
    std::io::stdout().flush().ok();

    wait_for_termination().await;
    tracing::info!("shutting down");
    manager
        .shutdown()
        .await
        .context("failed to shut down cleanly")?;
    Ok(())
}

async fn wait_for_termination() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::error!(error = %e, "cannot install SIGTERM handler");
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "cannot wait for ctrl-c");
            }
        }
    }
}
