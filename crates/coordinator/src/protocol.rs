//! Line protocol driver
//!
//! Writes one request to a worker and folds its event lines into a reply.
//! The worker's I/O is held for the whole exchange; callers serialize
//! access through the dispatch lanes so the I/O lock is never contended
//! in practice.

use crate::supervisor::{ModelWorker, Termination};
use modelpool_common::{ModelPoolError, Result, METRICS};
use modelpool_proto::{parse_event, CompletionMetadata, GenerateRequest, WorkerEvent};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Incremental update delivered while a reply streams in
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingChunk {
    pub session_id: String,
    pub message_id: String,
    pub content_delta: String,
    pub is_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<CompletionMetadata>,
}

/// Receives stream chunks as they arrive
pub type ChunkCallback<'a> = &'a mut (dyn FnMut(StreamingChunk) + Send);

/// Where one request stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Sent,
    Streaming,
    Complete,
    Errored,
    TimedOut,
}

/// Reply assembled from a successful exchange
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub content: String,
    /// Worker metadata; `response_time_ms` is filled in when absent
    pub metadata: CompletionMetadata,
    pub chunks: usize,
    pub elapsed: Duration,
}

/// Identifies the chunks of one reply
#[derive(Debug, Clone)]
pub struct ChunkTarget {
    pub session_id: String,
    pub message_id: String,
}

pub struct ProtocolDriver {
    inactivity_timeout: Duration,
}

/// Returns the worker to ready however the exchange ends
struct BusyGuard<'a>(&'a ModelWorker);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.finish_generation();
    }
}

impl ProtocolDriver {
    pub fn new(inactivity_timeout: Duration) -> Self {
        Self { inactivity_timeout }
    }

    pub fn inactivity_timeout(&self) -> Duration {
        self.inactivity_timeout
    }

    /// Run one request to completion on `worker`.
    ///
    /// Stream events reach `on_chunk` in arrival order. Lines that are not
    /// events, and events tagged with another request id, are skipped.
    /// The exchange fails if the worker is terminated, if `cancel`
    /// changes, or if no line arrives within the inactivity timeout.
    pub async fn generate(
        &self,
        worker: &ModelWorker,
        request: &GenerateRequest,
        target: &ChunkTarget,
        mut on_chunk: Option<ChunkCallback<'_>>,
        mut cancel: Option<watch::Receiver<u64>>,
    ) -> Result<GenerationOutcome> {
        let started = Instant::now();
        let mut terminated = worker.terminated();
        if let Some(reason) = *terminated.borrow_and_update() {
            return Err(reason.into_error(worker.id()));
        }

        let mut io = worker.io.lock().await;
        if !worker.begin_generation() {
            return Err(match worker.termination() {
                Some(reason) => reason.into_error(worker.id()),
                None => ModelPoolError::internal(format!(
                    "worker {} is {:?}, not ready",
                    worker.id(),
                    worker.state()
                )),
            });
        }
        let _busy = BusyGuard(worker);

        // Leftovers from an abandoned exchange must not leak into this one
        let mut stale = 0;
        while io.output.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!("Discarded {} buffered lines from {}", stale, worker.id());
        }

        let line = request.to_line()?;
        io.input.send(line).map_err(|_| {
            ModelPoolError::worker_exited(format!("worker {} input is closed", worker.id()))
        })?;

        let mut state = RequestState::Sent;
        let mut assembled = String::new();
        let mut chunks = 0usize;

        let result = loop {
            let line = tokio::select! {
                reason = wait_terminated(&mut terminated) => {
                    break Err(reason.into_error(worker.id()));
                }
                _ = wait_cancelled(&mut cancel) => {
                    break Err(ModelPoolError::cancelled(format!(
                        "generation on {} cancelled",
                        worker.id()
                    )));
                }
                line = tokio::time::timeout(self.inactivity_timeout, io.output.recv()) => match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        worker.abandon();
                        break Err(ModelPoolError::worker_exited(format!(
                            "worker {} closed its output",
                            worker.id()
                        )));
                    }
                    Err(_) => {
                        state = RequestState::TimedOut;
                        METRICS.sessions.generation_timeouts.inc();
                        break Err(ModelPoolError::response_timeout(format!(
                            "no output from {} for {:?}",
                            worker.id(),
                            self.inactivity_timeout
                        )));
                    }
                },
            };

            let Some(event) = parse_event(&line) else {
                trace!("Ignoring worker output: {}", line);
                continue;
            };

            if let (Some(theirs), Some(ours)) = (event.request_id(), request.request_id.as_deref()) {
                if theirs != ours {
                    debug!("Ignoring event for stale request {}", theirs);
                    continue;
                }
            }

            match event {
                WorkerEvent::Stream { content, .. } => {
                    state = RequestState::Streaming;
                    chunks += 1;
                    assembled.push_str(&content);
                    METRICS.sessions.chunks_streamed_total.inc();
                    if let Some(callback) = on_chunk.as_deref_mut() {
                        callback(StreamingChunk {
                            session_id: target.session_id.clone(),
                            message_id: target.message_id.clone(),
                            content_delta: content,
                            is_complete: false,
                            metadata: None,
                        });
                    }
                }
                WorkerEvent::Complete {
                    content,
                    mut metadata,
                    ..
                } => {
                    state = RequestState::Complete;
                    let elapsed = started.elapsed();
                    if metadata.response_time_ms.is_none() {
                        metadata.response_time_ms = Some(elapsed.as_millis() as u64);
                    }
                    let content = content.filter(|c| !c.is_empty()).unwrap_or(assembled);
                    break Ok(GenerationOutcome {
                        content,
                        metadata,
                        chunks,
                        elapsed,
                    });
                }
                WorkerEvent::Error { message, .. } => {
                    state = RequestState::Errored;
                    break Err(ModelPoolError::WorkerError(message));
                }
            }
        };

        match &result {
            Ok(outcome) => {
                METRICS
                    .sessions
                    .generation_duration
                    .observe(outcome.elapsed.as_secs_f64());
                debug!(
                    "Request on {} {:?} after {} chunks",
                    worker.id(),
                    state,
                    outcome.chunks
                );
            }
            Err(e) => warn!("Request on {} ended {:?}: {}", worker.id(), state, e),
        }
        result
    }
}

async fn wait_terminated(terminated: &mut watch::Receiver<Option<Termination>>) -> Termination {
    loop {
        if let Some(reason) = *terminated.borrow_and_update() {
            return reason;
        }
        if terminated.changed().await.is_err() {
            // Sender gone with the worker; nothing more will arrive
            std::future::pending::<()>().await;
        }
    }
}

async fn wait_cancelled(cancel: &mut Option<watch::Receiver<u64>>) {
    match cancel {
        Some(rx) => {
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}
