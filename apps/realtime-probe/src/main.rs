//! Realtime probe entry point.
//!
//! Usage: `realtime-probe [config.json]`. The config path may also come
//! from `SATCHEL_REALTIME_CONFIG`; without either the defaults are used.

mod session;

use std::path::PathBuf;

use satchel_realtime::RealtimeConfig;
use tracing_subscriber::EnvFilter;

const CONFIG_ENV: &str = "SATCHEL_REALTIME_CONFIG";

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,satchel=debug")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting realtime probe");

    let config = match config_path() {
        Some(path) => {
            let config = RealtimeConfig::load(&path)?;
            tracing::info!(path = %path.display(), retries = config.max_retries(), "configuration loaded");
            config
        }
        None => RealtimeConfig::default(),
    };

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(session::run(config))?;

    tracing::info!(
        events = report.events,
        payloads = report.payloads,
        reconnects = report.reconnects,
        "probe finished"
    );
    Ok(())
}

fn config_path() -> Option<PathBuf> {
    std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os(CONFIG_ENV))
        .map(PathBuf::from)
}
