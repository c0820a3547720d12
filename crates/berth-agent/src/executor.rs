//! Local task execution.
//!
//! A task script runs as `<shell> -c <script>`. Stdout and stderr are
//! read line by line and forwarded as output frames in arrival order.

use std::process::Stdio;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use berth_core::protocol::{AgentFrame, ExecuteTask};
use berth_core::LogStream;

/// Errors that can occur while starting a task.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to spawn {shell}: {source}")]
    Spawn {
        shell: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to capture task output")]
    Pipes,
}

/// Run one task to completion, streaming its output into `frames`.
///
/// Returns the `finished` frame to send last.
pub async fn run_task(
    shell: &str,
    task: &ExecuteTask,
    frames: &mpsc::Sender<AgentFrame>,
    cancel: CancellationToken,
) -> AgentFrame {
    match run(shell, task, frames, cancel).await {
        Ok(exit_code) => AgentFrame::Finished {
            task_id: task.task_id.clone(),
            exit_code,
            error: None,
        },
        Err(e) => {
            warn!(task_id = %task.task_id, error = %e, "Task failed to start");
            AgentFrame::Finished {
                task_id: task.task_id.clone(),
                exit_code: None,
                error: Some(e.to_string()),
            }
        }
    }
}

async fn run(
    shell: &str,
    task: &ExecuteTask,
    frames: &mpsc::Sender<AgentFrame>,
    cancel: CancellationToken,
) -> Result<Option<i32>, ExecutorError> {
    let mut child = Command::new(shell)
        .arg("-c")
        .arg(&task.script)
        .envs(&task.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ExecutorError::Spawn {
            shell: shell.to_string(),
            source,
        })?;

    info!(task_id = %task.task_id, category = %task.category, "Task process started");

    let stdout = child.stdout.take().ok_or(ExecutorError::Pipes)?;
    let stderr = child.stderr.take().ok_or(ExecutorError::Pipes)?;
    let mut stdout = BufReader::new(stdout);
    let mut stderr = BufReader::new(stderr);
    let (mut stdout_buf, mut stderr_buf) = (Vec::new(), Vec::new());
    let (mut stdout_open, mut stderr_open) = (true, true);

    let send = |stream: LogStream, content: String| {
        let frame = AgentFrame::Output {
            task_id: task.task_id.clone(),
            stream,
            content,
        };
        async move {
            if frames.send(frame).await.is_err() {
                debug!("Output channel closed");
            }
        }
    };

    // `read_until` keeps partial input in the buffer, so a branch that
    // loses the race resumes where it stopped.
    while stdout_open || stderr_open {
        tokio::select! {
            read = stdout.read_until(b'\n', &mut stdout_buf), if stdout_open => {
                if let Some(line) = take_line(read, &mut stdout_buf, &mut stdout_open) {
                    send(LogStream::Stdout, line).await;
                }
            }
            read = stderr.read_until(b'\n', &mut stderr_buf), if stderr_open => {
                if let Some(line) = take_line(read, &mut stderr_buf, &mut stderr_open) {
                    send(LogStream::Stderr, line).await;
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
    drop(stdout);
    drop(stderr);

    let status = tokio::select! {
        status = child.wait() => status,
        _ = cancel.cancelled() => {
            info!(task_id = %task.task_id, "Killing cancelled task");
            if let Err(e) = child.kill().await {
                warn!(task_id = %task.task_id, error = %e, "Failed to kill task process");
            }
            return Ok(None);
        }
    };

    match status {
        Ok(status) => {
            info!(task_id = %task.task_id, exit_code = ?status.code(), "Task process exited");
            Ok(status.code())
        }
        Err(e) => {
            warn!(task_id = %task.task_id, error = %e, "Failed to wait for task process");
            Ok(None)
        }
    }
}

/// Turn one `read_until` result into a log line.
///
/// Bytes are decoded lossily so a stray non-UTF-8 byte never stops the
/// pipe from being drained. `Ok(0)` is end of stream; a read error also
/// closes the stream, after flushing whatever was buffered.
fn take_line(read: std::io::Result<usize>, buf: &mut Vec<u8>, open: &mut bool) -> Option<String> {
    match read {
        Ok(0) => *open = false,
        Ok(_) if buf.ends_with(b"\n") => {}
        Ok(_) => return None,
        Err(e) => {
            warn!(error = %e, "Failed to read task output");
            *open = false;
        }
    }
    if buf.is_empty() {
        return None;
    }
    let line = decode_line(buf);
    buf.clear();
    Some(line)
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}
