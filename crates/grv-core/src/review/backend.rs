//! AI CLI backends.
//!
//! Each backend drives one external assistant process with a review prompt
//! and captures its textual output for logging. The daemon never parses
//! review feedback out of that output; the assistant posts its own review
//! through the companion `gerrit-cli` tool.
//!
//! Rate-limit rejections are surfaced as a distinct error variant so the
//! pipeline can report them back to Gerrit.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, ReviewCli};

/// Environment variable that marks a nested Claude Code session; stripped
/// before spawning so the child starts a fresh session.
const NESTED_SESSION_VAR: &str = "CLAUDECODE";

/// Substrings that identify a provider quota rejection in backend output.
const RATE_LIMIT_MARKERS: &[&str] = &["rate limit", "rate-limit", "usage limit", "quota", "429"];

/// Errors from a backend invocation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendError {
    /// The provider rejected the request for quota reasons.
    #[error("backend rate limited: {cause}")]
    RateLimited {
        /// The line of output that identified the rejection.
        cause: String,
    },

    /// The invocation exceeded its wall-clock deadline.
    #[error("backend timed out after {}s", limit.as_secs())]
    Timeout {
        /// The deadline that was exceeded.
        limit: Duration,
    },

    /// The task was cancelled while the backend was running.
    #[error("backend cancelled")]
    Cancelled,

    /// The backend binary could not be started.
    #[error("failed to start {binary}: {source}")]
    Spawn {
        /// Binary name that failed to spawn.
        binary: &'static str,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The backend exited unsuccessfully for a non-quota reason.
    #[error("backend failed ({status}): {stderr}")]
    Failed {
        /// Exit status description.
        status: String,
        /// Captured stderr.
        stderr: String,
    },

    /// Reading the backend's output failed.
    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability interface over the AI CLI subprocess.
#[async_trait]
pub trait AssistantBackend: Send + Sync {
    /// Short backend name used in logs and failure notices.
    fn name(&self) -> &'static str;

    /// Name of the executable on `PATH`, for preflight checks.
    fn binary(&self) -> &'static str;

    /// Runs the assistant with the given prompt in `workdir` and returns
    /// its textual output.
    ///
    /// The invocation is bounded by `timeout`; cancelling `cancel`
    /// terminates the subprocess promptly.
    async fn execute(
        &self,
        prompt: &str,
        workdir: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, BackendError>;
}

/// Selects the backend implementation for the configured CLI.
#[must_use]
pub fn backend_for(cli: ReviewCli, cfg: &Config) -> std::sync::Arc<dyn AssistantBackend> {
    let env = cfg.child_env();
    let skip_permissions = cfg.review.skip_permissions;
    match cli {
        ReviewCli::Claude => std::sync::Arc::new(ClaudeBackend {
            extra_env: env,
            skip_permissions,
        }),
        ReviewCli::Codex => std::sync::Arc::new(CodexBackend {
            extra_env: env,
            skip_permissions,
        }),
    }
}

/// Checks whether a failed invocation looks like a provider quota
/// rejection, returning the matching line as the cause.
fn rate_limit_cause(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let lower = line.to_ascii_lowercase();
        RATE_LIMIT_MARKERS
            .iter()
            .any(|m| lower.contains(m))
            .then(|| line.trim().to_string())
    })
}

/// Waits for the child until `deadline` or cancellation.
///
/// On timeout or cancellation the child is killed before the error is
/// returned, so an abandoned assistant never outlives its task.
async fn wait_bounded(
    child: &mut Child,
    deadline: tokio::time::Instant,
    limit: Duration,
    cancel: &CancellationToken,
) -> Result<std::process::ExitStatus, BackendError> {
    tokio::select! {
        status = child.wait() => Ok(status?),
        () = tokio::time::sleep_until(deadline) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(BackendError::Timeout { limit })
        }
        () = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(BackendError::Cancelled)
        }
    }
}

// =============================================================================
// Claude
// =============================================================================

/// Claude Code backend (`claude -p ... --output-format stream-json`).
pub struct ClaudeBackend {
    extra_env: Vec<(&'static str, String)>,
    skip_permissions: bool,
}

/// One line of `--output-format stream-json` output.
#[derive(Debug, Deserialize)]
struct StreamLine {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    event: Option<serde_json::Value>,
}

/// The inner streaming event.
#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    delta: Option<serde_json::Value>,
    #[serde(default)]
    content_block: Option<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    id: String,
}

impl ClaudeBackend {
    /// Builds the argument vector for one invocation.
    fn build_args(&self, prompt: &str) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            prompt.to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--include-partial-messages".to_string(),
            "--verbose".to_string(),
        ];
        if self.skip_permissions {
            warn!("permission checks are disabled via --dangerously-skip-permissions");
            args.push("--dangerously-skip-permissions".to_string());
        }
        args
    }

    /// Consumes one stream-json line, appending assistant text to `text`.
    fn consume_line(line: &str, text: &mut String, tool_calls: &mut u32) {
        let Ok(parsed) = serde_json::from_str::<StreamLine>(line) else {
            // Non-JSON chatter on stdout is ignored.
            return;
        };
        if parsed.kind != "stream_event" {
            return;
        }
        let Some(event) = parsed
            .event
            .and_then(|e| serde_json::from_value::<StreamEvent>(e).ok())
        else {
            return;
        };
        match event.kind.as_str() {
            "content_block_start" => {
                if let Some(block) = event.content_block {
                    if block.kind == "tool_use" {
                        *tool_calls += 1;
                        debug!(tool = %block.name, id = %block.id, n = *tool_calls, "tool call");
                    }
                }
            }
            "content_block_delta" => {
                if let Some(delta) = event.delta {
                    if delta.get("type").and_then(|t| t.as_str()) == Some("text_delta") {
                        if let Some(chunk) = delta.get("text").and_then(|t| t.as_str()) {
                            text.push_str(chunk);
                        }
                    }
                }
            }
            "message_stop" => debug!("assistant message completed"),
            _ => {}
        }
    }

    fn stream_log_path() -> PathBuf {
        let stamp = chrono::Utc::now().timestamp();
        std::env::temp_dir().join(format!("claude-review-{stamp}-stream.jsonl"))
    }
}

#[async_trait]
impl AssistantBackend for ClaudeBackend {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn binary(&self) -> &'static str {
        "claude"
    }

    async fn execute(
        &self,
        prompt: &str,
        workdir: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, BackendError> {
        let mut cmd = Command::new(self.binary());
        cmd.args(self.build_args(prompt))
            .current_dir(workdir)
            .env_remove(NESTED_SESSION_VAR)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.extra_env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|source| BackendError::Spawn {
            binary: self.binary(),
            source,
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Io(std::io::Error::other("missing stdout pipe")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BackendError::Io(std::io::Error::other("missing stderr pipe")))?;

        // Mirror the raw stream to a log file for postmortems.
        let log_path = Self::stream_log_path();
        let mut stream_log = tokio::fs::File::create(&log_path).await.ok();
        info!(path = %log_path.display(), "assistant stream log");

        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut captured = String::new();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(line = %line, "assistant stderr");
                captured.push_str(&line);
                captured.push('\n');
            }
            captured
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut text = String::new();
        let mut tool_calls = 0u32;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let next = tokio::select! {
                next = lines.next_line() => next?,
                () = tokio::time::sleep_until(deadline) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    stderr_task.abort();
                    return Err(BackendError::Timeout { limit: timeout });
                }
                () = cancel.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    stderr_task.abort();
                    return Err(BackendError::Cancelled);
                }
            };
            let Some(line) = next else { break };
            if let Some(log) = stream_log.as_mut() {
                let _ = log.write_all(line.as_bytes()).await;
                let _ = log.write_all(b"\n").await;
            }
            Self::consume_line(&line, &mut text, &mut tool_calls);
        }

        let status = wait_bounded(&mut child, deadline, timeout, cancel).await?;
        let stderr_text = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let combined = format!("{stderr_text}\n{text}");
            if let Some(cause) = rate_limit_cause(&combined) {
                return Err(BackendError::RateLimited { cause });
            }
            return Err(BackendError::Failed {
                status: status.to_string(),
                stderr: stderr_text.trim().to_string(),
            });
        }

        info!(tool_calls, chars = text.len(), "assistant run completed");
        Ok(text)
    }
}

// =============================================================================
// Codex
// =============================================================================

/// Codex CLI backend (`codex exec`).
pub struct CodexBackend {
    extra_env: Vec<(&'static str, String)>,
    skip_permissions: bool,
}

impl CodexBackend {
    fn build_args(&self, prompt: &str) -> Vec<String> {
        let mut args = vec!["exec".to_string(), "--skip-git-repo-check".to_string()];
        if self.skip_permissions {
            warn!("sandbox checks are disabled for the codex backend");
            args.push("--dangerously-bypass-approvals-and-sandbox".to_string());
        }
        args.push(prompt.to_string());
        args
    }
}

#[async_trait]
impl AssistantBackend for CodexBackend {
    fn name(&self) -> &'static str {
        "codex"
    }

    fn binary(&self) -> &'static str {
        "codex"
    }

    async fn execute(
        &self,
        prompt: &str,
        workdir: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, BackendError> {
        let mut cmd = Command::new(self.binary());
        cmd.args(self.build_args(prompt))
            .current_dir(workdir)
            .env_remove(NESTED_SESSION_VAR)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.extra_env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|source| BackendError::Spawn {
            binary: self.binary(),
            source,
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Io(std::io::Error::other("missing stdout pipe")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BackendError::Io(std::io::Error::other("missing stderr pipe")))?;

        let stdout_task = tokio::spawn(async move {
            let mut out = String::new();
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                out.push_str(&line);
                out.push('\n');
            }
            out
        });
        let stderr_task = tokio::spawn(async move {
            let mut out = String::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(line = %line, "assistant stderr");
                out.push_str(&line);
                out.push('\n');
            }
            out
        });

        let deadline = tokio::time::Instant::now() + timeout;
        let status = match wait_bounded(&mut child, deadline, timeout, cancel).await {
            Ok(status) => status,
            Err(err) => {
                stdout_task.abort();
                stderr_task.abort();
                return Err(err);
            }
        };
        let stdout_text = stdout_task.await.unwrap_or_default();
        let stderr_text = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let combined = format!("{stderr_text}\n{stdout_text}");
            if let Some(cause) = rate_limit_cause(&combined) {
                return Err(BackendError::RateLimited { cause });
            }
            return Err(BackendError::Failed {
                status: status.to_string(),
                stderr: stderr_text.trim().to_string(),
            });
        }

        info!(chars = stdout_text.len(), "assistant run completed");
        Ok(stdout_text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claude(skip: bool) -> ClaudeBackend {
        ClaudeBackend {
            extra_env: vec![],
            skip_permissions: skip,
        }
    }

    #[test]
    fn claude_args_default_secure_mode() {
        let args = claude(false).build_args("test prompt");
        assert!(!args.iter().any(|a| a == "--dangerously-skip-permissions"));
        assert_eq!(args[0], "-p");
        assert_eq!(args[1], "test prompt");
        assert!(args.contains(&"stream-json".to_string()));
    }

    #[test]
    fn claude_args_with_skip_permissions() {
        let args = claude(true).build_args("test prompt");
        assert!(args.iter().any(|a| a == "--dangerously-skip-permissions"));
    }

    #[test]
    fn codex_args_put_the_prompt_last() {
        let backend = CodexBackend {
            extra_env: vec![],
            skip_permissions: false,
        };
        let args = backend.build_args("do the review");
        assert_eq!(args.first().map(String::as_str), Some("exec"));
        assert_eq!(args.last().map(String::as_str), Some("do the review"));
        assert!(!args
            .iter()
            .any(|a| a == "--dangerously-bypass-approvals-and-sandbox"));
    }

    #[test]
    fn rate_limit_cause_matches_known_markers() {
        assert_eq!(
            rate_limit_cause("error: Rate limit exceeded, retry later"),
            Some("error: Rate limit exceeded, retry later".to_string())
        );
        assert_eq!(
            rate_limit_cause("API quota exhausted for today").as_deref(),
            Some("API quota exhausted for today")
        );
        assert_eq!(
            rate_limit_cause("server returned 429").as_deref(),
            Some("server returned 429")
        );
        assert_eq!(rate_limit_cause("segmentation fault"), None);
    }

    #[test]
    fn stream_text_deltas_are_accumulated() {
        let mut text = String::new();
        let mut tools = 0;
        let lines = [
            r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hello "}}}"#,
            r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"world"}}}"#,
            r#"{"type":"stream_event","event":{"type":"content_block_start","content_block":{"type":"tool_use","name":"Bash","id":"t1"}}}"#,
            "not json at all",
            r#"{"type":"other"}"#,
        ];
        for line in lines {
            ClaudeBackend::consume_line(line, &mut text, &mut tools);
        }
        assert_eq!(text, "Hello world");
        assert_eq!(tools, 1);
    }

    #[tokio::test]
    async fn execute_kills_the_child_on_cancellation() {
        // Stand in an arbitrary binary for claude by exercising the shared
        // bounded-wait helper directly.
        let mut child = Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        let err = wait_bounded(&mut child, deadline, Duration::from_secs(30), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Cancelled));
    }

    #[tokio::test]
    async fn execute_times_out_long_running_children() {
        let mut child = Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let cancel = CancellationToken::new();
        let started = std::time::Instant::now();
        let limit = Duration::from_millis(50);
        let deadline = tokio::time::Instant::now() + limit;
        let err = wait_bounded(&mut child, deadline, limit, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
