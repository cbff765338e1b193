//! Thin runtime harness around the library's `load` / `start` / `stop`
//! surface: read the config path from the command line, bring the
//! listeners up, wait for SIGINT, drain. Daemonization and process
//! supervision live outside this binary.

use anyhow::{bail, Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .context("usage: portico <config.json>")?;

    let config = portico::load_file(&config_path)
        .with_context(|| format!("failed to load {config_path}"))?;

    info!(
        version = portico::VERSION,
        config = %config_path,
        ports = ?config.table.ports(),
        "starting portico"
    );

    let listeners = portico::start(config).await;
    for skipped in &listeners.skipped {
        error!(port = skipped.port, reason = %skipped.reason, "port did not come up");
    }
    if listeners.is_empty() {
        bail!("no listener could be started");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;

    portico::stop(listeners).await;
    Ok(())
}
