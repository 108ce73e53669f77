//! Scripted in-process workers for tests

use crate::process::{KillHandle, LaunchSpec, WorkerLauncher, WorkerProcess};
use modelpool_common::Result;
use modelpool_proto::{CompletionMetadata, GenerateRequest, WorkerEvent, DEFAULT_READY_LINE};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// How a scripted worker ends its reply
#[derive(Debug, Clone)]
pub enum Outcome {
    /// `complete` event, optionally carrying the full text
    Complete(Option<String>),
    Error(String),
    /// Say nothing more
    Silent,
    /// Exit the process mid-reply
    Exit(Option<i32>),
}

/// Script for one request
#[derive(Debug, Clone)]
pub struct Reply {
    pub lines_before: Vec<String>,
    pub chunks: Vec<String>,
    pub outcome: Outcome,
    pub chunk_delay: Duration,
}

impl Reply {
    pub fn chunks(chunks: &[&str]) -> Self {
        Self {
            lines_before: Vec::new(),
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            outcome: Outcome::Complete(None),
            chunk_delay: Duration::ZERO,
        }
    }

    /// One chunk per word, trailing spaces kept
    pub fn words(text: &str) -> Self {
        let words: Vec<&str> = text.split_inclusive(' ').collect();
        Self::chunks(&words)
    }

    pub fn silent() -> Self {
        Self {
            outcome: Outcome::Silent,
            ..Self::chunks(&[])
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            outcome: Outcome::Error(message.to_string()),
            ..Self::chunks(&[])
        }
    }

    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn with_line_before(mut self, line: &str) -> Self {
        self.lines_before.push(line.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }
}

#[derive(Default)]
struct Shared {
    replies: Mutex<VecDeque<Reply>>,
    launched: Mutex<Vec<LaunchSpec>>,
    requests: Mutex<Vec<GenerateRequest>>,
    events: Mutex<Vec<String>>,
    crash: Mutex<HashMap<String, oneshot::Sender<Option<i32>>>>,
    outputs: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
    kills: AtomicUsize,
}

/// Launcher whose workers run as tasks and answer from a reply queue.
/// With the queue empty a worker answers `"ok"`.
pub struct FakeLauncher {
    ready: bool,
    shared: Arc<Shared>,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ready: true,
            shared: Arc::new(Shared::default()),
        })
    }

    /// Workers that never print the ready line
    pub fn never_ready() -> Arc<Self> {
        Arc::new(Self {
            ready: false,
            shared: Arc::new(Shared::default()),
        })
    }

    pub fn push_reply(&self, reply: Reply) {
        self.shared.replies.lock().push_back(reply);
    }

    pub fn launch_count(&self) -> usize {
        self.shared.launched.lock().len()
    }

    pub fn launched(&self) -> Vec<LaunchSpec> {
        self.shared.launched.lock().clone()
    }

    /// Requests received, in arrival order
    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.shared.requests.lock().clone()
    }

    /// `start:<message>` and `end:<message>` markers, in order
    pub fn events(&self) -> Vec<String> {
        self.shared.events.lock().clone()
    }

    /// Kill switches fired so far, once pending kills have been handled
    pub async fn kill_count(&self) -> usize {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
        self.shared.kills.load(Ordering::SeqCst)
    }

    /// Make the user's worker exit with `code`
    pub fn crash(&self, user_id: &str, code: Option<i32>) -> bool {
        match self.shared.crash.lock().remove(user_id) {
            Some(tx) => tx.send(code).is_ok(),
            None => false,
        }
    }

    /// Write a raw line to the user's worker output right now
    pub fn emit(&self, user_id: &str, line: &str) -> bool {
        self.shared
            .outputs
            .lock()
            .get(user_id)
            .map(|tx| tx.send(line.to_string()).is_ok())
            .unwrap_or(false)
    }
}

impl WorkerLauncher for FakeLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<WorkerProcess> {
        self.shared.launched.lock().push(spec.clone());

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (crash_tx, crash_rx) = oneshot::channel();
        let (kill, kill_rx) = KillHandle::new();

        self.shared.crash.lock().insert(spec.user_id.clone(), crash_tx);
        self.shared
            .outputs
            .lock()
            .insert(spec.user_id.clone(), output_tx.clone());

        tokio::spawn(simulate(
            self.ready,
            input_rx,
            output_tx,
            kill_rx,
            crash_rx,
            exit_tx,
            Arc::clone(&self.shared),
        ));

        Ok(WorkerProcess {
            pid: None,
            input: input_tx,
            output: output_rx,
            exit: exit_rx,
            kill,
        })
    }
}

async fn simulate(
    ready: bool,
    mut input_rx: mpsc::UnboundedReceiver<String>,
    output_tx: mpsc::UnboundedSender<String>,
    mut kill_rx: oneshot::Receiver<()>,
    mut crash_rx: oneshot::Receiver<Option<i32>>,
    exit_tx: oneshot::Sender<Option<i32>>,
    shared: Arc<Shared>,
) {
    if ready {
        let _ = output_tx.send("loading weights".to_string());
        let _ = output_tx.send(DEFAULT_READY_LINE.to_string());
    }

    let code = loop {
        // A kill sent just before the handles are dropped still counts
        let line = tokio::select! {
            biased;
            killed = &mut kill_rx => {
                if killed.is_ok() {
                    shared.kills.fetch_add(1, Ordering::SeqCst);
                }
                break Some(-9);
            }
            code = &mut crash_rx => break code.ok().flatten(),
            line = input_rx.recv() => match line {
                Some(line) => line,
                None => break Some(0),
            },
        };

        let reply = shared
            .replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Reply::chunks(&["ok"]));

        tokio::select! {
            biased;
            killed = &mut kill_rx => {
                if killed.is_ok() {
                    shared.kills.fetch_add(1, Ordering::SeqCst);
                }
                break Some(-9);
            }
            code = &mut crash_rx => break code.ok().flatten(),
            exit = play(&line, reply, &output_tx, &shared) => {
                if let Some(code) = exit {
                    break code;
                }
            }
        }
    };

    let _ = exit_tx.send(code);
}

/// Answer one request line. Returns `Some(code)` if the script exits.
async fn play(
    line: &str,
    reply: Reply,
    output: &mpsc::UnboundedSender<String>,
    shared: &Shared,
) -> Option<Option<i32>> {
    let request: GenerateRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            send(output, WorkerEvent::Error {
                request_id: None,
                message: e.to_string(),
            });
            return None;
        }
    };
    let request_id = request.request_id.clone();
    shared.events.lock().push(format!("start:{}", request.message));
    shared.requests.lock().push(request.clone());

    for raw in &reply.lines_before {
        let _ = output.send(raw.clone());
    }

    for chunk in &reply.chunks {
        if !reply.chunk_delay.is_zero() {
            tokio::time::sleep(reply.chunk_delay).await;
        }
        send(output, WorkerEvent::Stream {
            request_id: request_id.clone(),
            content: chunk.clone(),
        });
    }

    let exit = match reply.outcome {
        Outcome::Complete(content) => {
            send(output, WorkerEvent::Complete {
                request_id,
                content,
                metadata: CompletionMetadata {
                    token_count: Some(reply.chunks.len() as u32),
                    ..Default::default()
                },
            });
            None
        }
        Outcome::Error(message) => {
            send(output, WorkerEvent::Error { request_id, message });
            None
        }
        Outcome::Silent => None,
        Outcome::Exit(code) => Some(code),
    };

    shared.events.lock().push(format!("end:{}", request.message));
    exit
}

fn send(output: &mpsc::UnboundedSender<String>, event: WorkerEvent) {
    if let Ok(line) = event.to_line() {
        let _ = output.send(line);
    }
}
