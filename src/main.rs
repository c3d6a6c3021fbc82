use std::{env, path::Path};

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use plantwall::{config, Config, HardwareManager};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = if Path::new(&config_path).exists() {
        config::load(&config_path)?
    } else {
        info!(path = %config_path, "no config file, using defaults");
        Config::default()
    };

    // Mock mode defaults to on unless the binary was built with real
    // hardware support; MOCK_HARDWARE overrides either way.
    let mock = env::var("MOCK_HARDWARE")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(!cfg!(feature = "hardware"));

    // ── Hardware ────────────────────────────────────────────────────
    let manager = HardwareManager::new(config, mock);
    manager
        .initialize()
        .await
        .context("hardware initialization failed")?;

    manager.display().start_auto_rotate().await;

    info!(mock, "plantwall running; Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    info!("shutting down");
    if let Err(e) = manager.cleanup().await {
        error!("cleanup: {e}");
    }
    Ok(())
}
