//! grv - automated AI code review for Gerrit.
//!
//! Two modes: `review` performs a single one-shot review of a patchset;
//! `serve` runs the long-lived daemon that listens to Gerrit stream-events
//! and reviews new patchsets automatically.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use grv_core::Config;
use tracing::error;

mod commands;
mod logging;
mod preflight;

/// grv - automated AI code review for Gerrit
#[derive(Parser, Debug)]
#[command(name = "grv")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the config file (default: ./grv.toml, then
    /// ~/.config/grv/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Review a single patchset and exit
    Review {
        /// Project name
        #[arg(long)]
        project: String,

        /// Change number
        #[arg(long)]
        change_number: u64,

        /// Patchset number
        #[arg(long)]
        revision_number: u32,

        /// Bypass permission/sandbox checks in the selected review CLI
        /// (unsafe)
        #[arg(long)]
        dangerously_skip_permissions: bool,

        /// AI CLI backend: claude or codex
        #[arg(long)]
        review_cli: Option<String>,
    },

    /// Listen to Gerrit events and review new patchsets automatically
    Serve,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            // Logging may not be initialized when config loading fails, so
            // report on stderr as well.
            error!(error = %format!("{err:#}"), "fatal");
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut cfg = Config::load(cli.config.as_deref()).context("failed to load config")?;
    logging::init(&cfg.logging, cli.log_level.as_deref()).context("failed to set up logging")?;

    match cli.command {
        Commands::Review {
            project,
            change_number,
            revision_number,
            dangerously_skip_permissions,
            review_cli,
        } => {
            if dangerously_skip_permissions {
                cfg.review.skip_permissions = true;
            }
            if let Some(selector) = review_cli {
                cfg.review.cli = selector;
                cfg.review_cli().context("invalid --review-cli value")?;
            }
            commands::review::run(cfg, &project, change_number, revision_number).await
        }
        Commands::Serve => commands::serve::run(cfg).await,
    }
}
