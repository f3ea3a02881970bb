//! Serve mode: the long-running review daemon.
//!
//! Wiring: event stream -> filter -> task queue <- worker pool -> review
//! pipeline. The supervisor owns the root cancellation token; termination
//! signals cancel it, and shutdown waits on the pool within a grace window.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use grv_core::events::{EventFilter, EventStream};
use grv_core::gerrit::GerritClient;
use grv_core::pool::WorkerPool;
use grv_core::queue::{PushError, Task, TaskQueue};
use grv_core::repo::GitRepoManager;
use grv_core::review::{backend_for, ReviewRunner};
use grv_core::Config;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long shutdown waits for in-flight reviews.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Maximum subject length echoed into the log.
const SUBJECT_LOG_LEN: usize = 60;

/// Runs the daemon until a termination signal or stream exhaustion.
pub async fn run(cfg: Config) -> Result<()> {
    info!(
        ssh_alias = %cfg.gerrit.ssh_alias,
        workers = cfg.serve.workers,
        queue_size = cfg.serve.queue_size,
        lazy_mode = cfg.serve.lazy_mode,
        allow = ?cfg.serve.filter.allow,
        deny = ?cfg.serve.filter.deny,
        "starting serve mode"
    );

    crate::preflight::run(&cfg)
        .await
        .context("preflight checks failed")?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone())?;

    let queue = Arc::new(TaskQueue::new(cfg.serve.queue_size, cfg.serve.lazy_mode));
    let filter = EventFilter::new(cfg.serve.filter.clone());

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
    let runner = Arc::new(ReviewRunner::new(cfg.clone(), repo, backend, server));

    // The pool starts before the stream so admitted tasks always have a
    // consumer.
    let pool = WorkerPool::start(
        cfg.serve.workers,
        Arc::clone(&queue),
        runner,
        cancel.child_token(),
    );
    let mut events = EventStream::new(&cfg.gerrit.ssh_alias).open(cancel.child_token());

    info!("listening for patchset-created events");
    loop {
        tokio::select! {
            maybe_event = events.recv() => {
                let Some(event) = maybe_event else {
                    warn!("event stream closed");
                    break;
                };
                if !filter.accepts(&event) {
                    debug!(kind = %event.event_type, "event filtered out");
                    continue;
                }
                // The filter guarantees both sections are present.
                let (Some(change), Some(patch_set)) = (event.change, event.patch_set) else {
                    warn!("event missing required fields, skipping");
                    continue;
                };

                let task = Task::new(
                    &change.project,
                    change.number,
                    patch_set.number,
                    &change.subject,
                );
                match queue.push(task) {
                    Ok(()) => info!(
                        project = %change.project,
                        change = change.number,
                        patchset = patch_set.number,
                        subject = %truncate_subject(&change.subject),
                        "queued review task"
                    ),
                    Err(err @ PushError::Full { .. }) => warn!(error = %err, "task dropped"),
                    Err(err) => debug!(error = %err, "task not admitted"),
                }
            }
            () = cancel.cancelled() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    cancel.cancel();
    pool.stop(SHUTDOWN_GRACE).await;
    Ok(())
}

/// Cancels the root token on SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("received SIGINT, shutting down"),
        }
        cancel.cancel();
    });
    Ok(())
}

fn truncate_subject(subject: &str) -> String {
    if subject.chars().count() <= SUBJECT_LOG_LEN {
        return subject.to_string();
    }
    let head: String = subject.chars().take(SUBJECT_LOG_LEN).collect();
    format!("{head}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_subjects_are_truncated_for_logging() {
        let long = "s".repeat(80);
        let truncated = truncate_subject(&long);
        assert_eq!(truncated.chars().count(), SUBJECT_LOG_LEN + 3);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncate_subject("short"), "short");
    }
}
