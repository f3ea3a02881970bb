//! Start-up checks for serve mode.
//!
//! Any failure here aborts the daemon before it connects to the event
//! stream: a missing tool would otherwise only surface on the first task.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use grv_core::Config;
use serde::Deserialize;
use tokio::process::Command;
use tracing::info;

/// Name of the companion query tool the assistant uses.
const QUERY_TOOL: &str = grv_core::review::QUERY_TOOL;

/// Deadline applied to each probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct CliProbeResponse {
    #[serde(default)]
    success: bool,
}

/// Runs all preflight checks, failing fast on the first problem.
pub async fn run(cfg: &Config) -> Result<()> {
    info!("running preflight checks");

    let tool = lookup_path(QUERY_TOOL)
        .with_context(|| format!("{QUERY_TOOL} not found in PATH"))?;
    info!(path = %tool.display(), "{QUERY_TOOL} found");

    probe_query_tool(cfg)
        .await
        .context("query tool connectivity test failed")?;
    info!("{QUERY_TOOL} connectivity test passed");

    probe_ssh(cfg).await.with_context(|| {
        format!(
            "SSH connection test failed; ensure alias '{}' is configured in ~/.ssh/config",
            cfg.gerrit.ssh_alias
        )
    })?;
    info!("SSH connection test passed");

    let backend = cfg.review_cli().context("invalid review backend")?;
    probe_backend(backend.binary())
        .await
        .with_context(|| format!("{} CLI not usable", backend.binary()))?;
    info!(backend = backend.binary(), "review backend found");

    info!("all preflight checks passed");
    Ok(())
}

/// Resolves an executable through `PATH`.
fn lookup_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Runs a cheap authenticated query through the companion tool.
async fn probe_query_tool(cfg: &Config) -> Result<()> {
    let mut cmd = Command::new(QUERY_TOOL);
    cmd.args(["change", "list", "status:open", "--limit", "1"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in cfg.child_env() {
        cmd.env(key, value);
    }

    let out = tokio::time::timeout(PROBE_TIMEOUT, cmd.output())
        .await
        .context("probe timed out")??;
    if !out.status.success() {
        bail!(
            "{QUERY_TOOL} exited with {}: {}",
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    let response: CliProbeResponse = serde_json::from_slice(&out.stdout)
        .context("failed to parse query tool output")?;
    if !response.success {
        bail!("{QUERY_TOOL} returned success=false");
    }
    Ok(())
}

/// Checks the SSH alias by asking the server for its version.
async fn probe_ssh(cfg: &Config) -> Result<()> {
    let out = tokio::time::timeout(
        PROBE_TIMEOUT,
        Command::new("ssh")
            .args([cfg.gerrit.ssh_alias.as_str(), "gerrit", "version"])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .context("probe timed out")??;
    if !out.status.success() {
        bail!(
            "ssh exited with {}: {}",
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(())
}

/// Checks that the backend binary answers `--version`.
async fn probe_backend(binary: &str) -> Result<()> {
    let out = tokio::time::timeout(
        PROBE_TIMEOUT,
        Command::new(binary)
            .arg("--version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .context("probe timed out")??;
    if !out.status.success() {
        bail!("{binary} --version exited with {}", out.status);
    }
    info!(
        version = %String::from_utf8_lossy(&out.stdout).trim(),
        "backend version"
    );
    Ok(())
}
