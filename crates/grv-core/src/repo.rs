//! Local git workspaces for review checkouts.
//!
//! Each project gets one workspace under the configured base path. A review
//! checkout lives on a throwaway branch (`review-<change>-<patchset>`) that
//! is force-recreated per task and deleted again during cleanup. All git
//! operations shell out to the `git` binary with explicit arguments and
//! prompts disabled.

use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Builds the Gerrit ref for a patchset.
///
/// Format: `refs/changes/<NN>/<C>/<P>` where `NN` is the change number
/// modulo 100, zero-padded to two digits.
#[must_use]
pub fn patchset_ref(change_number: u64, revision_number: u32) -> String {
    format!(
        "refs/changes/{:02}/{}/{}",
        change_number % 100,
        change_number,
        revision_number
    )
}

/// Name of the throwaway branch used for one review checkout.
#[must_use]
pub fn review_branch(change_number: u64, revision_number: u32) -> String {
    format!("review-{change_number}-{revision_number}")
}

/// Errors from workspace operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RepoError {
    /// Spawning `git` itself failed.
    #[error("failed to run git {op}: {source}")]
    Io {
        /// The git operation being attempted.
        op: &'static str,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A git command exited unsuccessfully.
    #[error("git {op} failed ({status}): {output}")]
    Command {
        /// The git operation being attempted.
        op: &'static str,
        /// Exit status description.
        status: String,
        /// Combined stdout/stderr of the command.
        output: String,
    },
}

/// Capability interface for preparing and cleaning review checkouts.
///
/// The daemon owns each project workspace exclusively; with the default
/// single worker this is trivially serial.
#[async_trait]
pub trait RepoManager: Send + Sync {
    /// Clones the project if its workspace does not exist yet, otherwise
    /// fetches the latest refs.
    async fn ensure_repo(&self, project: &str) -> Result<(), RepoError>;

    /// Fetches a specific ref (e.g. a patchset ref) from origin.
    async fn fetch_ref(&self, project: &str, refname: &str) -> Result<(), RepoError>;

    /// Force-creates the review branch at `FETCH_HEAD` and checks it out.
    /// Returns the branch name.
    async fn checkout(
        &self,
        project: &str,
        change_number: u64,
        revision_number: u32,
    ) -> Result<String, RepoError>;

    /// Number of files changed by the checked-out commit relative to its
    /// parent.
    async fn changed_file_count(&self, project: &str) -> Result<usize, RepoError>;

    /// Switches back to the default branch and deletes the review branch.
    async fn cleanup(&self, project: &str, branch: &str) -> Result<(), RepoError>;
}

/// Git-backed [`RepoManager`] rooted at a workspace base path.
pub struct GitRepoManager {
    base_path: PathBuf,
    ssh_alias: String,
}

impl GitRepoManager {
    /// Creates a manager cloning from `<ssh_alias>:<project>` into
    /// `<base_path>/<project basename>`.
    #[must_use]
    pub fn new(base_path: &Path, ssh_alias: &str) -> Self {
        Self {
            base_path: base_path.to_path_buf(),
            ssh_alias: ssh_alias.to_string(),
        }
    }

    fn repo_path(&self, project: &str) -> PathBuf {
        let safe = Path::new(project)
            .file_name()
            .map_or_else(|| project.to_string(), |n| n.to_string_lossy().into_owned());
        self.base_path.join(safe)
    }

    fn git_url(&self, project: &str) -> String {
        // An empty alias means the project name is already a usable URL or
        // local path (test fixtures use this).
        if self.ssh_alias.is_empty() {
            project.to_string()
        } else {
            format!("{}:{}", self.ssh_alias, project)
        }
    }

    async fn git(
        &self,
        dir: Option<&Path>,
        op: &'static str,
        args: &[&str],
    ) -> Result<Output, RepoError> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }
        debug!(op, ?args, "running git");
        let out = cmd.output().await.map_err(|source| RepoError::Io { op, source })?;
        if out.status.success() {
            Ok(out)
        } else {
            Err(RepoError::Command {
                op,
                status: out.status.to_string(),
                output: combined_output(&out),
            })
        }
    }
}

fn combined_output(out: &Output) -> String {
    let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&out.stderr);
    if !stderr.is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&stderr);
    }
    text.trim().to_string()
}

#[async_trait]
impl RepoManager for GitRepoManager {
    async fn ensure_repo(&self, project: &str) -> Result<(), RepoError> {
        let path = self.repo_path(project);
        if path.join(".git").exists() {
            self.git(Some(&path), "fetch", &["fetch", "origin"]).await?;
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| RepoError::Io { op: "clone", source })?;
        }
        let url = self.git_url(project);
        self.git(
            None,
            "clone",
            &["clone", url.as_str(), &path.to_string_lossy()],
        )
        .await?;
        Ok(())
    }

    async fn fetch_ref(&self, project: &str, refname: &str) -> Result<(), RepoError> {
        let path = self.repo_path(project);
        self.git(Some(&path), "fetch ref", &["fetch", "origin", refname])
            .await?;
        Ok(())
    }

    async fn checkout(
        &self,
        project: &str,
        change_number: u64,
        revision_number: u32,
    ) -> Result<String, RepoError> {
        let path = self.repo_path(project);
        let branch = review_branch(change_number, revision_number);
        // A leftover branch from an earlier run is recreated from scratch.
        let _ = self
            .git(Some(&path), "branch -D", &["branch", "-D", &branch])
            .await;
        self.git(
            Some(&path),
            "checkout",
            &["checkout", "-b", &branch, "FETCH_HEAD"],
        )
        .await?;
        Ok(branch)
    }

    async fn changed_file_count(&self, project: &str) -> Result<usize, RepoError> {
        let path = self.repo_path(project);
        let out = self
            .git(Some(&path), "diff", &["diff", "--name-only", "HEAD^"])
            .await?;
        let listing = String::from_utf8_lossy(&out.stdout);
        Ok(listing.lines().filter(|l| !l.trim().is_empty()).count())
    }

    async fn cleanup(&self, project: &str, branch: &str) -> Result<(), RepoError> {
        let path = self.repo_path(project);
        // The default branch name varies; take the first that works.
        for default in ["main", "master"] {
            if self
                .git(Some(&path), "checkout", &["checkout", default])
                .await
                .is_ok()
            {
                break;
            }
        }
        self.git(Some(&path), "branch -D", &["branch", "-D", branch])
            .await?;
        Ok(())
    }
}
