//! Inference worker process capability
//!
//! A launched worker is reduced to four capabilities: a line sink
//! (its stdin), a line source (its stdout), an exit notification and a
//! kill switch. The supervisor and the protocol driver only ever see
//! [`WorkerProcess`], so anything that can provide those four can stand
//! in for a real child process.

use modelpool_common::{ModelPoolError, Result};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::SplitStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, trace, warn};

/// Everything needed to start one worker
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub model_path: PathBuf,
    pub user_id: String,
}

impl LaunchSpec {
    /// Configured arguments followed by `--model-path` and `--user-id`
    pub fn command_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        args.push("--model-path".to_string());
        args.push(self.model_path.display().to_string());
        args.push("--user-id".to_string());
        args.push(self.user_id.clone());
        args
    }
}

/// Fires the kill switch of one worker. Clones share the switch.
#[derive(Debug, Clone)]
pub struct KillHandle {
    tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl KillHandle {
    pub fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Request termination. Returns false if already requested.
    pub fn kill(&self) -> bool {
        match self.tx.lock().take() {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}

/// A running worker seen through its capabilities
#[derive(Debug)]
pub struct WorkerProcess {
    pub pid: Option<u32>,
    /// Lines written here reach the worker's stdin, newline-terminated
    pub input: mpsc::UnboundedSender<String>,
    /// Lines read from the worker's stdout; closes when stdout does
    pub output: mpsc::UnboundedReceiver<String>,
    /// Resolves with the exit code once the process is gone
    pub exit: oneshot::Receiver<Option<i32>>,
    pub kill: KillHandle,
}

/// Starts workers
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> Result<WorkerProcess>;
}

/// Launches workers as child processes with piped stdin/stdout.
///
/// Must be called from within a tokio runtime.
#[derive(Debug, Default, Clone)]
pub struct CommandLauncher;

impl WorkerLauncher for CommandLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<WorkerProcess> {
        info!(
            "Spawning worker for {}: {} {}",
            spec.user_id,
            spec.program,
            spec.command_args().join(" ")
        );

        let mut child = Command::new(&spec.program)
            .args(spec.command_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ModelPoolError::model_load_failed(format!(
                    "failed to spawn {} for {}: {}",
                    spec.program, spec.user_id, e
                ))
            })?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ModelPoolError::model_load_failed("worker stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ModelPoolError::model_load_failed("worker stdout not captured"))?;

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill, kill_rx) = KillHandle::new();

        tokio::spawn(stdin_writer_task(input_rx, stdin, spec.user_id.clone()));
        tokio::spawn(stdout_reader_task(stdout, output_tx, spec.user_id.clone()));
        tokio::spawn(wait_task(child, kill_rx, exit_tx, spec.user_id.clone()));

        Ok(WorkerProcess {
            pid,
            input: input_tx,
            output: output_rx,
            exit: exit_rx,
            kill,
        })
    }
}

/// Task that writes request lines to the worker's stdin
async fn stdin_writer_task(
    mut input_rx: mpsc::UnboundedReceiver<String>,
    mut stdin: ChildStdin,
    user_id: String,
) {
    while let Some(line) = input_rx.recv().await {
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;

        if let Err(e) = written {
            warn!("Failed to write to worker {} stdin: {}", user_id, e);
            break;
        }
    }
    debug!("Stdin writer for {} exiting", user_id);
}

/// Task that forwards stdout lines to the output channel. Bytes that are
/// not UTF-8 are replaced rather than ending the stream.
async fn stdout_reader_task(
    stdout: ChildStdout,
    output_tx: mpsc::UnboundedSender<String>,
    user_id: String,
) {
    let mut lines = SplitStream::new(BufReader::new(stdout).split(b'\n'));

    while let Some(line) = lines.next().await {
        match line {
            Ok(raw) => {
                let line = decode_line(&raw);
                if output_tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Worker {} stdout read error: {}", user_id, e);
                break;
            }
        }
    }
    debug!("Stdout reader for {} exiting", user_id);
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    match String::from_utf8_lossy(raw) {
        Cow::Borrowed(line) => line.to_string(),
        Cow::Owned(line) => {
            trace!("Worker output is not UTF-8: {}", line);
            line
        }
    }
}

/// Task that owns the child: reaps it, or kills it on request (or when
/// every kill handle is gone), then reports the exit code.
async fn wait_task(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: oneshot::Sender<Option<i32>>,
    user_id: String,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            debug!("Killing worker {}", user_id);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill worker {}: {}", user_id, e);
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => {
            debug!("Worker {} exited with {}", user_id, status);
            status.code()
        }
        Err(e) => {
            warn!("Failed to reap worker {}: {}", user_id, e);
            None
        }
    };
    let _ = exit_tx.send(code);
}
