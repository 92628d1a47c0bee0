//! scid-agent - incremental ingestion of Sierra Chart `.scid` tick files.
//!
//! Tails every configured source file, upserts decoded records into the configured
//! sink and checkpoints progress after each confirmed batch.

use anyhow::{Context, Result};
use scid_agent::config::Config;
use scid_agent::{metrics, runner};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const CONFIG_ENV: &str = "SCID_AGENT_CONFIG";

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {config_path}"))?;

    let cancel_token = CancellationToken::new();
    tokio::spawn({
        let cancel_token = cancel_token.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("shutdown signal received");
                    cancel_token.cancel();
                }
                Err(err) => error!(error = %err, "failed while waiting for shutdown signal"),
            }
        }
    });

    if let Some(addr) = config.metrics_addr() {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind metrics server to {addr}"))?;
        tokio::spawn(metrics::serve(listener, cancel_token.clone()));
    }

    let summary = runner::run(&config, cancel_token.clone()).await?;
    cancel_token.cancel();

    for (path, err) in &summary.failed {
        error!(path = %path.display(), kind = err.kind(), error = %err, "source halted");
    }
    for path in &summary.aborted {
        warn!(path = %path.display(), "source loop aborted during shutdown");
    }
    if !summary.failed.is_empty() {
        anyhow::bail!("{} source(s) halted with errors", summary.failed.len());
    }
    Ok(())
}

fn init_tracing() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
