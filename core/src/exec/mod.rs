//! Remote command execution over the asynchronous control plane
//!
//! A command is submitted, assigned an identifier, then polled to a terminal
//! status. File transfer rides the same channel: uploads are here-doc writes
//! (split into sequential appends when the payload budget is exceeded) and
//! downloads emit the file on stdout.

use crate::error::{LabError, LabResult};
use crate::retry::{poll_until, retry_transient, Backoff};
use crate::traits::{CommandId, CommandPoll, ControlPlane, TerminalStatus};
use std::sync::Arc;
use std::time::Duration;


/// Here-doc delimiter for uploads; must never occur in uploaded content
const UPLOAD_EOF: &str = "__BBENCH_EOF__";

/// Backoff between status polls: 2 s × 1.5, capped at 10 s
const POLL_BACKOFF: Backoff = Backoff::new(Duration::from_secs(2), 1.5, Duration::from_secs(10));

/// Backoff for transient submit/cancel failures
const SUBMIT_BACKOFF: Backoff =
    Backoff::new(Duration::from_secs(1), 2.0, Duration::from_secs(8));

/// Result of a successfully completed remote command
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Process exit code (0 for `Success`)
    pub exit_code: i32,
}

/// Executes commands and transfers files on remote hosts
///
/// Stateless apart from the shared control-plane client; any number of
/// calls may be in flight concurrently.
#[derive(Clone)]
pub struct RemoteExecutor {
    control: Arc<dyn ControlPlane>,
}

impl RemoteExecutor {
    /// Create an executor over the given control plane
    pub fn new(control: Arc<dyn ControlPlane>) -> Self {
        RemoteExecutor { control }
    }

    /// The shared control-plane client
    pub fn control(&self) -> &Arc<dyn ControlPlane> {
        &self.control
    }

    /// Run a shell payload on a host, polling until terminal
    ///
    /// Returns the captured output on `Success`. Any other terminal status
    /// maps to [`LabError::ExecutionFailed`]. If `deadline` expires first,
    /// the command is cancelled best-effort and reported `TimedOut`; the
    /// call never returns later than the deadline plus one poll interval.
    pub async fn run(
        &self,
        host: &str,
        payload: &str,
        deadline: Duration,
    ) -> LabResult<CommandOutcome> {
        let id = retry_transient(
            "submit-command",
            3,
            SUBMIT_BACKOFF,
            |e: &crate::traits::ControlPlaneError| e.is_retryable(),
            || self.control.submit(host, payload),
        )
        .await
        .map_err(|e| LabError::ExecutionFailed {
            host: host.to_string(),
            status: TerminalStatus::Failed,
            stderr: format!("submit failed: {e}"),
        })?;

        tracing::debug!(host, command_id = %id, "Command submitted");

        let polled = tokio::time::timeout(deadline, self.poll_to_terminal(host, &id)).await;

        let poll = match polled {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(host, command_id = %id, "Command deadline exceeded, cancelling");
                if let Err(e) = self.control.cancel(host, &id).await {
                    tracing::warn!(host, command_id = %id, error = %e, "Cancel failed");
                }
                return Err(LabError::ExecutionFailed {
                    host: host.to_string(),
                    status: TerminalStatus::TimedOut,
                    stderr: format!("deadline of {deadline:?} exceeded"),
                });
            }
        };

        match poll.status.terminal() {
            Some(TerminalStatus::Success) => Ok(CommandOutcome {
                stdout: poll.stdout,
                stderr: poll.stderr,
                exit_code: poll.exit_code.unwrap_or(0),
            }),
            Some(status) => Err(LabError::ExecutionFailed {
                host: host.to_string(),
                status,
                stderr: poll.stderr,
            }),
            None => Err(LabError::internal("poll_to_terminal returned non-terminal")),
        }
    }

    /// Upload text content to a path on the host
    ///
    /// The write is encoded as a here-doc; content larger than the control
    /// plane's payload budget is split into an initial write plus
    /// sequential appends, each awaited before the next is submitted.
    pub async fn upload(
        &self,
        host: &str,
        remote_path: &str,
        content: &str,
        deadline: Duration,
    ) -> LabResult<()> {
        if content.contains(UPLOAD_EOF) {
            return Err(LabError::internal(format!(
                "upload content contains the here-doc delimiter {UPLOAD_EOF}"
            )));
        }

        let budget = self.chunk_budget(remote_path)?;
        let chunks = split_chunks(content, budget);

        for (i, chunk) in chunks.iter().enumerate() {
            let redirect = if i == 0 { ">" } else { ">>" };
            let payload =
                format!("cat {redirect} '{remote_path}' <<'{UPLOAD_EOF}'\n{chunk}\n{UPLOAD_EOF}");
            self.run(host, &payload, deadline).await?;
        }

        tracing::debug!(
            host,
            path = remote_path,
            bytes = content.len(),
            parts = chunks.len(),
            "Upload complete"
        );
        Ok(())
    }

    /// Download a file from the host; the command emits it on stdout
    pub async fn download(
        &self,
        host: &str,
        remote_path: &str,
        deadline: Duration,
    ) -> LabResult<String> {
        let outcome = self
            .run(host, &format!("cat '{remote_path}'"), deadline)
            .await?;
        Ok(outcome.stdout)
    }

    async fn poll_to_terminal(&self, host: &str, id: &CommandId) -> LabResult<CommandPoll> {
        poll_until(POLL_BACKOFF, || async {
            match self.control.poll(host, id).await {
                Ok(poll) if poll.status.is_terminal() => Ok(Some(poll)),
                Ok(_) => Ok(None),
                // Transient poll failures keep waiting; the deadline bounds them
                Err(e) if e.is_retryable() => {
                    tracing::debug!(host, command_id = %id, error = %e, "Poll hiccup");
                    Ok(None)
                }
                Err(e) => Err(LabError::ExecutionFailed {
                    host: host.to_string(),
                    status: TerminalStatus::Failed,
                    stderr: format!("poll failed: {e}"),
                }),
            }
        })
        .await
    }

    fn chunk_budget(&self, remote_path: &str) -> LabResult<usize> {
        // Framing: cat line, two delimiter lines, newlines
        let overhead = remote_path.len() + UPLOAD_EOF.len() * 2 + 16;
        let max = self.control.max_payload_bytes();
        if max <= overhead {
            return Err(LabError::internal(format!(
                "control-plane payload budget {max} too small for upload framing"
            )));
        }
        Ok(max - overhead)
    }
}

/// Split text into chunks of at most `budget` bytes on char boundaries
fn split_chunks(content: &str, budget: usize) -> Vec<&str> {
    if content.is_empty() {
        return vec![""];
    }
    let mut chunks = Vec::new();
    let mut rest = content;
    while !rest.is_empty() {
        let mut end = budget.max(1).min(rest.len());
        while end < rest.len() && !rest.is_char_boundary(end) {
            end += 1;
        }
        let (chunk, tail) = rest.split_at(end);
        chunks.push(chunk);
        rest = tail;
    }
    chunks
}
