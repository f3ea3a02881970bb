//! One-shot review of a single patchset.

use std::sync::Arc;

use anyhow::{Context, Result};
use grv_core::gerrit::GerritClient;
use grv_core::repo::GitRepoManager;
use grv_core::review::{backend_for, ReviewRequest, ReviewRunner};
use grv_core::Config;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Reviews one patchset and returns once it is done.
pub async fn run(
    cfg: Config,
    project: &str,
    change_number: u64,
    revision_number: u32,
) -> Result<()> {
    let backend = backend_for(cfg.review_cli()?, &cfg);
    let repo = Arc::new(GitRepoManager::new(
        &cfg.workspace.base_path,
        &cfg.gerrit.ssh_alias,
    ));
    let server = Arc::new(
        GerritClient::new(
            &cfg.gerrit.http_url,
            &cfg.gerrit.http_user,
            cfg.http_password(),
        )
        .context("failed to build Gerrit client")?,
    );
    let runner = ReviewRunner::new(cfg, repo, backend, server);

    let req = ReviewRequest {
        project: project.to_string(),
        change_number,
        revision_number,
    };
    info!(project, change_number, revision_number, "starting one-shot review");

    // One-shot mode has no signal-driven shutdown; the token only feeds the
    // pipeline's cancellation plumbing.
    let cancel = CancellationToken::new();
    runner
        .run(&req, &cancel)
        .await
        .context("review failed")?;
    Ok(())
}
