//! Logger initialization.
//!
//! Log lines go to stderr by default. When a log file is configured, lines
//! go to the file (without ANSI escapes) and additionally to stderr in
//! verbose mode.

use anyhow::{Context, Result};
use grv_core::config::LoggingConfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber once.
pub fn init(cfg: &LoggingConfig, level_override: Option<&str>) -> Result<()> {
    let level = level_override.unwrap_or(&cfg.level);
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    match &cfg.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(file)
                .with_ansi(false);
            if cfg.verbose {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(file_layer)
                    .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(file_layer)
                    .init();
            }
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
    Ok(())
}
