//! Resilient consumer of Gerrit `stream-events` over SSH.
//!
//! The stream runs the `ssh` client as a child process and reads
//! newline-delimited JSON events from its stdout. Transport loss is handled
//! by reconnecting with backoff; malformed frames are skipped. The stream
//! ends only on cancellation, when the consumer goes away, or after the
//! retry cap is exhausted.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::GerritEvent;

/// Capacity of the channel handed to the consumer.
const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Reconnect pacing and retry cap for the event stream.
#[derive(Debug, Clone, Copy)]
pub struct StreamTuning {
    /// Backoff applied to the first few consecutive failures.
    pub initial_backoff: Duration,
    /// Backoff applied once failures persist.
    pub steady_backoff: Duration,
    /// Number of consecutive failures that still use the initial backoff.
    pub fast_attempts: u32,
    /// Consecutive failed attempts after which the stream gives up.
    pub max_attempts: u32,
}

impl Default for StreamTuning {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(5),
            steady_backoff: Duration::from_secs(30),
            fast_attempts: 5,
            max_attempts: 100,
        }
    }
}

impl StreamTuning {
    /// Wait time before the given (1-based) reconnect attempt.
    #[must_use]
    pub const fn backoff(&self, attempt: u32) -> Duration {
        if attempt <= self.fast_attempts {
            self.initial_backoff
        } else {
            self.steady_backoff
        }
    }
}

/// How one transport session ended.
enum SessionEnd {
    /// The cancellation token fired.
    Cancelled,
    /// The event receiver was dropped.
    ConsumerGone,
    /// The transport exited cleanly. Resets the retry counter to zero.
    Clean,
    /// The transport failed to start, errored, or exited unsuccessfully.
    Failed,
}

/// Factory for the long-lived event stream.
///
/// Each call to [`EventStream::open`] constructs a fresh stream; the
/// returned receiver is the single consumer.
#[derive(Debug, Clone)]
pub struct EventStream {
    program: String,
    args: Vec<String>,
    tuning: StreamTuning,
}

impl EventStream {
    /// Creates a stream that connects through the given SSH alias and asks
    /// the server to pre-filter to `patchset-created` events.
    #[must_use]
    pub fn new(ssh_alias: &str) -> Self {
        let args = vec![
            ssh_alias.to_string(),
            "-o".to_string(),
            "ServerAliveInterval=30".to_string(),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
            "gerrit".to_string(),
            "stream-events".to_string(),
            "-s".to_string(),
            "patchset-created".to_string(),
        ];
        Self {
            program: "ssh".to_string(),
            args,
            tuning: StreamTuning::default(),
        }
    }

    /// Creates a stream over an arbitrary command, mainly so tests can
    /// substitute a local stub for the SSH transport.
    #[must_use]
    pub fn with_command<I, S>(program: &str, args: I, tuning: StreamTuning) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            tuning,
        }
    }

    /// Opens the stream and returns the event receiver.
    ///
    /// The receiver yields parsed events until cancellation or until the
    /// reconnect cap is exhausted, at which point the channel closes.
    #[must_use]
    pub fn open(self, cancel: CancellationToken) -> mpsc::Receiver<GerritEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            self.run(tx, cancel).await;
        });
        rx
    }

    async fn run(self, tx: mpsc::Sender<GerritEvent>, cancel: CancellationToken) {
        let mut attempts: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match self.stream_once(&tx, &cancel).await {
                SessionEnd::Cancelled | SessionEnd::ConsumerGone => return,
                SessionEnd::Clean => {
                    // Successful session: the counter resets to zero and
                    // the reconnect happens immediately. Having produced
                    // events earlier does not count; only a clean end does.
                    attempts = 0;
                }
                SessionEnd::Failed => {
                    attempts += 1;
                    if attempts >= self.tuning.max_attempts {
                        error!(
                            attempts,
                            "giving up on event stream after repeated connection failures"
                        );
                        return;
                    }
                    let delay = self.tuning.backoff(attempts);
                    warn!(
                        attempt = attempts,
                        max = self.tuning.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "event stream connection lost, reconnecting"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => return,
                    }
                }
            }
        }
    }

    /// Runs a single transport session until it ends.
    async fn stream_once(
        &self,
        tx: &mpsc::Sender<GerritEvent>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        info!(program = %self.program, "connecting to event stream");
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(error = %err, "failed to start event stream transport");
                return SessionEnd::Failed;
            }
        };
        let Some(stdout) = child.stdout.take() else {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return SessionEnd::Failed;
        };
        let mut lines = BufReader::new(stdout).lines();
        let mut connected = false;

        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return SessionEnd::Cancelled;
                }
                next = lines.next_line() => next,
            };
            match next {
                Ok(Some(line)) => {
                    if !connected {
                        connected = true;
                        info!("connected, listening for events");
                    }
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<GerritEvent>(&line) {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                let _ = child.start_kill();
                                let _ = child.wait().await;
                                return SessionEnd::ConsumerGone;
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "skipping malformed event frame");
                            debug!(raw = %line, "raw event frame");
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "error reading event stream");
                    break;
                }
            }
        }

        match child.wait().await {
            Ok(status) if status.success() => SessionEnd::Clean,
            Ok(status) => {
                warn!(%status, "event stream transport exited");
                SessionEnd::Failed
            }
            Err(err) => {
                warn!(error = %err, "failed to reap event stream transport");
                SessionEnd::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVENT_LINE: &str = r#"{"type":"patchset-created","change":{"project":"p","number":1,"subject":"s"},"patchSet":{"number":2},"eventCreatedOn":1}"#;

    fn test_tuning(max_attempts: u32) -> StreamTuning {
        StreamTuning {
            initial_backoff: Duration::from_millis(1),
            steady_backoff: Duration::from_millis(1),
            fast_attempts: 5,
            max_attempts,
        }
    }

    fn stub(script: &str, max_attempts: u32) -> EventStream {
        EventStream::with_command("sh", ["-c", script], test_tuning(max_attempts))
    }

    #[test]
    fn backoff_schedule_matches_policy() {
        let tuning = StreamTuning::default();
        assert_eq!(tuning.backoff(1), Duration::from_secs(5));
        assert_eq!(tuning.backoff(5), Duration::from_secs(5));
        assert_eq!(tuning.backoff(6), Duration::from_secs(30));
        assert_eq!(tuning.backoff(99), Duration::from_secs(30));
        assert_eq!(tuning.max_attempts, 100);
    }

    #[tokio::test]
    async fn delivers_events_and_skips_malformed_frames() {
        let script = format!("echo '{EVENT_LINE}'; echo 'not json'; echo '{EVENT_LINE}'; exit 1");
        let cancel = CancellationToken::new();
        let mut rx = stub(&script, 1).open(cancel);

        let first = rx.recv().await.expect("first event");
        assert_eq!(first.event_type, "patchset-created");
        assert_eq!(first.change.unwrap().number, 1);
        let second = rx.recv().await.expect("second event");
        assert_eq!(second.patch_set.unwrap().number, 2);

        // Single-attempt cap: the failed exit terminates the stream.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn retry_cap_closes_the_channel() {
        let cancel = CancellationToken::new();
        let mut rx = stub("exit 1", 3).open(cancel);
        let closed = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert_eq!(closed.expect("stream should give up"), None);
    }

    #[tokio::test]
    async fn successful_connection_resets_the_retry_counter_to_zero() {
        // Sessions alternate: odd runs fail without output, even runs
        // deliver one event and end cleanly. With a cap of 2, every failure
        // raises the counter to 1, so the stream only survives the fourth
        // failure if each intervening clean session reset the counter to
        // zero; without the reset the second failure would already close
        // the channel after at most one event.
        let state = tempfile::tempdir().unwrap();
        let counter = state.path().join("count");
        let script = format!(
            "f={f}; n=$(cat \"$f\" 2>/dev/null || echo 0); n=$((n+1)); \
             printf %s \"$n\" > \"$f\"; \
             if [ $((n % 2)) -eq 1 ]; then exit 1; fi; \
             echo '{EVENT_LINE}'; exit 0",
            f = counter.display()
        );
        let cancel = CancellationToken::new();
        let mut rx = stub(&script, 2).open(cancel.clone());

        for _ in 0..4 {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("stream should keep reconnecting")
                .expect("event");
            assert_eq!(event.event_type, "patchset-created");
        }

        // Four events means four interleaved failures were absorbed.
        let sessions: u32 = std::fs::read_to_string(&counter)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(sessions >= 8, "expected at least 8 sessions, saw {sessions}");
        cancel.cancel();
    }

    #[tokio::test]
    async fn cancellation_closes_the_stream_promptly() {
        let cancel = CancellationToken::new();
        let mut rx = stub("sleep 30", 100).open(cancel.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert_eq!(closed.expect("stream should close within a second"), None);
    }
}
