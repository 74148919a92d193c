//! Bounded subprocess execution.
//!
//! [`run_command`] spawns a prepared [`Command`], pipes the JSON payload to
//! stdin, drains stdout/stderr concurrently and enforces a hard wall-clock
//! limit. On timeout the child's process group is killed and the child is
//! reaped before returning.

use std::process::Stdio;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use super::ExecutionError;

/// Maximum stdout or stderr size captured per stream (10 MiB).
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Raw output of a finished subprocess.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// Process exit code (`-1` if killed by signal).
    pub exit_code: i32,
    pub duration_ms: u64,
}

/// Spawn `cmd`, write `stdin_payload` as JSON to its stdin, capture output,
/// and kill it if it outlives `timeout`.
///
/// One deadline covers the stdin write, the exit and both output streams.
/// The child runs in its own process group, which is killed once the child
/// exits or the deadline passes, so a background grandchild holding a pipe
/// open cannot keep the call waiting.
///
/// The caller sets program, arguments, env and working directory.
pub async fn run_command(
    cmd: &mut Command,
    stdin_payload: &Value,
    timeout: Duration,
) -> Result<ProcessOutput, ExecutionError> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(ExecutionError::Spawn)?;
    let pgid = child.id();

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let bytes = serde_json::to_vec(stdin_payload).unwrap_or_default();

    let io = async {
        let write = async {
            if let Some(mut stdin) = stdin {
                // The child may close stdin without reading it; that is not an error.
                let _ = stdin.write_all(&bytes).await;
            }
        };
        let wait = async {
            let status = child.wait().await;
            kill_group(pgid);
            status
        };
        let ((), status, out, err) = tokio::join!(write, wait, read_stream(stdout), read_stream(stderr));
        (status, out, err)
    };

    let outcome = tokio::time::timeout(timeout, io).await;
    match outcome {
        Ok((Ok(status), stdout_bytes, stderr_bytes)) => Ok(ProcessOutput {
            stdout: String::from_utf8_lossy(&stdout_bytes).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
            exit_code: status.code().unwrap_or(-1),
            duration_ms: start.elapsed().as_millis() as u64,
        }),
        Ok((Err(e), _, _)) => Err(ExecutionError::Io(e)),
        Err(_elapsed) => {
            kill_group(pgid);
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "Failed to kill timed-out calculation");
            }
            Err(ExecutionError::Timeout {
                elapsed_ms: start.elapsed().as_millis() as u64,
            })
        }
    }
}

/// SIGKILL every process left in the child's group.
fn kill_group(pgid: Option<u32>) {
    let Some(pgid) = pgid.and_then(|id| libc::pid_t::try_from(id).ok()) else {
        return;
    };
    // Safety: kill(2) with a negative pid only signals; ESRCH (group already
    // empty) is expected and ignored.
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

/// Read an entire output stream into a byte buffer, capped at [`MAX_OUTPUT_BYTES`].
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h)
            .take(MAX_OUTPUT_BYTES as u64)
            .read_to_end(&mut buf)
            .await;
    }
    buf
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
