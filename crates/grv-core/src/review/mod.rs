//! Per-task review pipeline.
//!
//! For one patchset the pipeline prepares the project workspace, invokes
//! the configured AI backend with the review prompt, and cleans the
//! workspace up again. The assistant posts its own feedback through the
//! companion query tool; the only review the pipeline posts itself is the
//! score-0 notice on a backend rate limit.

mod backend;
mod prompt;

pub use backend::{backend_for, AssistantBackend, BackendError};
pub use prompt::{build_prompt, QUERY_TOOL, SKILL};

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::gerrit::{ReviewResult, ReviewServer};
use crate::repo::{patchset_ref, RepoError, RepoManager};

/// Maximum length of the cause string embedded in a failure notice.
const MAX_NOTICE_CAUSE_LEN: usize = 220;

/// One review request, by patchset identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewRequest {
    /// Project the change belongs to.
    pub project: String,
    /// Stable change number.
    pub change_number: u64,
    /// Patchset number.
    pub revision_number: u32,
}

/// How a successful pipeline run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewOutcome {
    /// The assistant ran to completion.
    Completed,
    /// The patchset changed no files; the review was skipped.
    NoChanges,
}

/// Errors from the review pipeline.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReviewError {
    /// A workspace operation failed.
    #[error("workspace error: {0}")]
    Repo(#[from] RepoError),

    /// The backend invocation failed.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Drives the review pipeline for individual tasks.
///
/// Single-use per task: there is no retry inside the pipeline. A later
/// event for the same change produces a fresh task instead.
pub struct ReviewRunner {
    cfg: Config,
    repo: Arc<dyn RepoManager>,
    backend: Arc<dyn AssistantBackend>,
    server: Arc<dyn ReviewServer>,
}

impl ReviewRunner {
    /// Wires a runner from its capability interfaces.
    #[must_use]
    pub fn new(
        cfg: Config,
        repo: Arc<dyn RepoManager>,
        backend: Arc<dyn AssistantBackend>,
        server: Arc<dyn ReviewServer>,
    ) -> Self {
        Self {
            cfg,
            repo,
            backend,
            server,
        }
    }

    /// Runs the full pipeline for one patchset.
    ///
    /// # Errors
    ///
    /// Returns [`ReviewError`] on any workspace or backend failure. Only
    /// the rate-limit failure posts anything to the server.
    pub async fn run(
        &self,
        req: &ReviewRequest,
        cancel: &CancellationToken,
    ) -> Result<ReviewOutcome, ReviewError> {
        let started = Instant::now();
        let project = req.project.as_str();

        debug!(project, "ensuring repository");
        self.repo.ensure_repo(project).await?;

        let refname = patchset_ref(req.change_number, req.revision_number);
        debug!(%refname, "fetching patchset");
        self.repo.fetch_ref(project, &refname).await?;

        let branch = self
            .repo
            .checkout(project, req.change_number, req.revision_number)
            .await?;

        let outcome = self.review_checkout(req, cancel).await;

        // Cleanup is best effort and never fails the task.
        if let Err(err) = self.repo.cleanup(project, &branch).await {
            warn!(error = %err, project, branch, "workspace cleanup failed");
        }

        if outcome.is_ok() {
            info!(
                project,
                change = req.change_number,
                patchset = req.revision_number,
                elapsed_secs = started.elapsed().as_secs(),
                "review finished"
            );
        }
        outcome
    }

    /// Runs the steps that assume the review branch is checked out.
    async fn review_checkout(
        &self,
        req: &ReviewRequest,
        cancel: &CancellationToken,
    ) -> Result<ReviewOutcome, ReviewError> {
        let project = req.project.as_str();

        let changed = self.repo.changed_file_count(project).await?;
        if changed == 0 {
            info!(project, change = req.change_number, "no changes, skipping review");
            return Ok(ReviewOutcome::NoChanges);
        }
        debug!(changed, "changed files");

        let prompt = build_prompt(project, req.change_number, req.revision_number);
        debug!(chars = prompt.len(), "built review prompt");

        let timeout = self.cfg.review_timeout();
        info!(
            backend = self.backend.name(),
            timeout_secs = timeout.as_secs(),
            "executing review backend"
        );
        let workdir = self.cfg.repo_path(project);
        match self.backend.execute(&prompt, &workdir, timeout, cancel).await {
            Ok(output) => {
                debug!(chars = output.len(), "backend output captured");
                Ok(ReviewOutcome::Completed)
            }
            Err(BackendError::RateLimited { cause }) => {
                self.post_rate_limit_notice(req, &cause).await;
                Err(BackendError::RateLimited { cause }.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Posts the score-0 notice for a rate-limited backend run.
    ///
    /// This is the only path on which the daemon itself writes a review.
    async fn post_rate_limit_notice(&self, req: &ReviewRequest, cause: &str) {
        let result = ReviewResult {
            summary: rate_limit_summary(self.backend.name(), cause),
            vote: 0,
            comments: vec![],
        };
        match self
            .server
            .post_review(req.change_number, req.revision_number, &result)
            .await
        {
            Ok(()) => info!(
                project = %req.project,
                change = req.change_number,
                patchset = req.revision_number,
                "posted rate-limit failure notice"
            ),
            Err(err) => warn!(
                error = %err,
                change = req.change_number,
                patchset = req.revision_number,
                "failed to post rate-limit failure notice"
            ),
        }
    }
}

/// Builds the summary text of a rate-limit failure notice.
#[must_use]
pub fn rate_limit_summary(backend: &str, cause: &str) -> String {
    let cause = if cause.trim().is_empty() {
        "rate limit".to_string()
    } else {
        truncate_for_notice(cause, MAX_NOTICE_CAUSE_LEN)
    };
    format!(
        "Automated review started but could not finish because the AI backend \
         hit a rate limit.\n\n\
         Backend: {backend}\n\
         Result: no review comments were produced.\n\
         Error: {cause}\n\n\
         Please retry this patchset later."
    )
}

/// Trims whitespace and caps the text at `max_len` characters, appending a
/// truncation marker when anything was cut.
fn truncate_for_notice(text: &str, max_len: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_len {
        return text.to_string();
    }
    let head: String = text.chars().take(max_len).collect();
    format!("{head}...(truncated)")
}
