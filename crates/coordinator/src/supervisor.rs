//! Worker pool supervision
//!
//! At most one worker per user is resident. Loading a worker reserves
//! its arena share first, so a spawn never starts without memory behind
//! it, and the share is released on every path that ends the worker
//! except eviction (the allocator already dropped it).

use crate::allocator::{Allocator, EvictionListener, MemoryAllocation, Priority};
use crate::locator::ModelLocator;
use crate::process::{KillHandle, LaunchSpec, WorkerLauncher, WorkerProcess};
use chrono::{DateTime, Utc};
use modelpool_common::config::{AllocatorConfig, SupervisorConfig};
use modelpool_common::{ModelPoolError, Result, METRICS};
use modelpool_proto::is_ready_line;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Loading,
    Ready,
    Busy,
    Draining,
    Dead,
}

/// Why a worker stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The allocator reclaimed its share
    Evicted,
    /// Unloaded by the supervisor (pool limit, shutdown, explicit)
    Unloaded,
    /// The process exited on its own
    Exited(Option<i32>),
}

impl Termination {
    pub fn into_error(self, worker_id: &str) -> ModelPoolError {
        match self {
            Termination::Evicted | Termination::Unloaded => {
                ModelPoolError::worker_evicted(format!("worker {} was unloaded", worker_id))
            }
            Termination::Exited(code) => ModelPoolError::worker_exited(format!(
                "worker {} exited with code {:?}",
                worker_id, code
            )),
        }
    }
}

/// Line channels of a worker; held for the whole of one generation
#[derive(Debug)]
pub struct WorkerIo {
    pub input: mpsc::UnboundedSender<String>,
    pub output: mpsc::UnboundedReceiver<String>,
}

#[derive(Debug, Clone, Copy)]
struct Activity {
    last_activity: Instant,
    inference_count: u64,
    average_response_time_ms: f64,
}

/// One resident model worker
#[derive(Debug)]
pub struct ModelWorker {
    id: String,
    model_path: PathBuf,
    pid: Option<u32>,
    loaded_at: DateTime<Utc>,
    state: Mutex<WorkerState>,
    activity: Mutex<Activity>,
    pub(crate) io: tokio::sync::Mutex<WorkerIo>,
    termination: watch::Sender<Option<Termination>>,
    kill: KillHandle,
}

/// Read-only view of a worker
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub user_id: String,
    pub model_path: PathBuf,
    pub pid: Option<u32>,
    pub state: WorkerState,
    pub loaded_at: DateTime<Utc>,
    pub inference_count: u64,
    pub average_response_time_ms: f64,
    pub idle_secs: f64,
}

impl ModelWorker {
    fn new(user_id: &str, model_path: &Path, pid: Option<u32>, io: WorkerIo, kill: KillHandle) -> Self {
        let (termination, _) = watch::channel(None);
        Self {
            id: user_id.to_string(),
            model_path: model_path.to_path_buf(),
            pid,
            loaded_at: Utc::now(),
            state: Mutex::new(WorkerState::Loading),
            activity: Mutex::new(Activity {
                last_activity: Instant::now(),
                inference_count: 0,
                average_response_time_ms: 0.0,
            }),
            io: tokio::sync::Mutex::new(io),
            termination,
            kill,
        }
    }

    /// Worker id; equal to the owning user's id
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    pub fn is_serving(&self) -> bool {
        matches!(self.state(), WorkerState::Ready | WorkerState::Busy)
    }

    /// Observe termination; the current value is visible immediately
    pub fn terminated(&self) -> watch::Receiver<Option<Termination>> {
        self.termination.subscribe()
    }

    pub fn termination(&self) -> Option<Termination> {
        *self.termination.borrow()
    }

    /// Ready -> Busy. False if the worker cannot take a request.
    pub(crate) fn begin_generation(&self) -> bool {
        let mut state = self.state.lock();
        if *state != WorkerState::Ready {
            return false;
        }
        *state = WorkerState::Busy;
        self.activity.lock().last_activity = Instant::now();
        true
    }

    /// Busy -> Ready; no-op once the worker is draining or dead
    pub(crate) fn finish_generation(&self) {
        let mut state = self.state.lock();
        if *state == WorkerState::Busy {
            *state = WorkerState::Ready;
        }
        self.activity.lock().last_activity = Instant::now();
    }

    fn record_inference(&self, elapsed: Duration) {
        let mut activity = self.activity.lock();
        let ms = elapsed.as_secs_f64() * 1000.0;
        activity.inference_count += 1;
        let n = activity.inference_count as f64;
        activity.average_response_time_ms += (ms - activity.average_response_time_ms) / n;
        activity.last_activity = Instant::now();
    }

    fn last_activity(&self) -> Instant {
        self.activity.lock().last_activity
    }

    fn set_state(&self, next: WorkerState) {
        *self.state.lock() = next;
    }

    /// Stop serving and kill a process whose output is gone. The exit
    /// monitor retires it once the process is reaped.
    pub(crate) fn abandon(&self) {
        {
            let mut state = self.state.lock();
            if *state == WorkerState::Dead {
                return;
            }
            *state = WorkerState::Draining;
        }
        warn!("Worker {} lost its output; killing it", self.id);
        self.kill.kill();
    }

    /// Mark dead, publish the reason and fire the kill switch. Only the
    /// first termination is recorded.
    fn terminate(&self, reason: Termination) -> bool {
        {
            let mut state = self.state.lock();
            if *state == WorkerState::Dead {
                return false;
            }
            if !matches!(reason, Termination::Exited(_)) {
                *state = WorkerState::Draining;
            }
        }

        self.termination.send_replace(Some(reason));
        self.kill.kill();
        self.set_state(WorkerState::Dead);
        true
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        let activity = *self.activity.lock();
        WorkerSnapshot {
            user_id: self.id.clone(),
            model_path: self.model_path.clone(),
            pid: self.pid,
            state: self.state(),
            loaded_at: self.loaded_at,
            inference_count: activity.inference_count,
            average_response_time_ms: activity.average_response_time_ms,
            idle_secs: activity.last_activity.elapsed().as_secs_f64(),
        }
    }
}

/// Inference totals across every worker ever loaded
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorStats {
    pub loaded_workers: usize,
    pub total_inferences: u64,
    pub average_response_time_ms: f64,
}

#[derive(Debug, Default)]
struct Totals {
    inferences: u64,
    response_time_ms: f64,
}

/// Spawns, tracks and retires model workers
pub struct Supervisor {
    config: SupervisorConfig,
    allocator: Arc<Allocator>,
    launcher: Arc<dyn WorkerLauncher>,
    locator: Arc<dyn ModelLocator>,
    workers: Mutex<HashMap<String, Arc<ModelWorker>>>,
    totals: Mutex<Totals>,
    /// Serializes loads so pool-limit and arena decisions see settled state
    load_lock: tokio::sync::Mutex<()>,
}

impl Supervisor {
    /// Create a supervisor that owns a fresh allocator and listens for
    /// its evictions
    pub fn new(
        config: SupervisorConfig,
        allocator_config: &AllocatorConfig,
        launcher: Arc<dyn WorkerLauncher>,
        locator: Arc<dyn ModelLocator>,
    ) -> Arc<Self> {
        let supervisor = Arc::new(Self {
            config,
            allocator: Arc::new(Allocator::new(allocator_config)),
            launcher,
            locator,
            workers: Mutex::new(HashMap::new()),
            totals: Mutex::new(Totals::default()),
            load_lock: tokio::sync::Mutex::new(()),
        });

        let listener: Weak<dyn EvictionListener> =
            Arc::downgrade(&supervisor) as Weak<Supervisor>;
        supervisor.allocator.set_listener(listener);
        supervisor
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Resident, serving worker for `user_id`
    pub fn worker(&self, user_id: &str) -> Option<Arc<ModelWorker>> {
        self.workers
            .lock()
            .get(user_id)
            .filter(|w| w.is_serving())
            .cloned()
    }

    pub fn loaded_workers(&self) -> Vec<WorkerSnapshot> {
        let mut snapshots: Vec<_> = self.workers.lock().values().map(|w| w.snapshot()).collect();
        snapshots.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        snapshots
    }

    pub fn loaded_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Return the user's worker, loading it if needed.
    ///
    /// The load runs on its own task, so a caller that gives up waiting
    /// does not strand a half-started worker or its arena share: the load
    /// still ends in a ready worker or a full cleanup.
    pub async fn ensure_loaded(self: &Arc<Self>, user_id: &str) -> Result<Arc<ModelWorker>> {
        if let Some(worker) = self.worker(user_id) {
            self.allocator.touch(user_id);
            return Ok(worker);
        }

        let supervisor = Arc::clone(self);
        let owned_id = user_id.to_string();
        tokio::spawn(async move { supervisor.load(&owned_id).await })
            .await
            .map_err(|e| ModelPoolError::internal(format!("load task for {} failed: {}", user_id, e)))?
    }

    async fn load(self: &Arc<Self>, user_id: &str) -> Result<Arc<ModelWorker>> {
        let _load = self.load_lock.lock().await;

        // Another caller may have finished the load while we waited
        if let Some(worker) = self.worker(user_id) {
            self.allocator.touch(user_id);
            return Ok(worker);
        }

        let model_path = self
            .locator
            .locate(user_id)
            .ok_or_else(|| ModelPoolError::model_not_found(format!("no model for user {}", user_id)))?;

        self.enforce_pool_limit();

        let size_gb = self.config.estimated_model_size_gb;
        if !self.allocator.admit(user_id, user_id, size_gb, Priority::Medium) {
            return Err(ModelPoolError::insufficient_resources(format!(
                "cannot fit {:.1} GB for {} ({:.1} GB available)",
                size_gb,
                user_id,
                self.allocator.available_gb()
            )));
        }

        match self.start_worker(user_id, &model_path).await {
            Ok(worker) => Ok(worker),
            Err(e) => {
                self.allocator.release(user_id);
                METRICS.supervisor.worker_load_failures.inc();
                warn!("Failed to load worker for {}: {}", user_id, e);
                Err(e)
            }
        }
    }

    /// Unload the least recently active workers until there is room for
    /// one more
    fn enforce_pool_limit(&self) {
        loop {
            let oldest = {
                let workers = self.workers.lock();
                if workers.len() < self.config.max_loaded_models {
                    return;
                }
                workers
                    .values()
                    .min_by_key(|w| w.last_activity())
                    .map(|w| w.id.clone())
            };

            match oldest {
                Some(id) => {
                    info!("Worker pool full; unloading least recently used {}", id);
                    self.unload(&id);
                }
                None => return,
            }
        }
    }

    async fn start_worker(self: &Arc<Self>, user_id: &str, model_path: &Path) -> Result<Arc<ModelWorker>> {
        let spec = LaunchSpec {
            program: self.config.worker_program.clone(),
            args: self.config.worker_args.clone(),
            model_path: model_path.to_path_buf(),
            user_id: user_id.to_string(),
        };

        let started = Instant::now();
        let WorkerProcess {
            pid,
            input,
            output,
            mut exit,
            kill,
        } = self.launcher.launch(&spec)?;

        let worker = Arc::new(ModelWorker::new(
            user_id,
            model_path,
            pid,
            WorkerIo { input, output },
            kill,
        ));
        self.workers.lock().insert(user_id.to_string(), Arc::clone(&worker));

        let ready = {
            let mut io = worker.io.lock().await;
            tokio::time::timeout(
                self.config.startup_timeout(),
                wait_for_ready(&mut io.output, &mut exit, &self.config.ready_line),
            )
            .await
        };

        let failure = match ready {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => Some(ModelPoolError::ModelLoadTimeout(format!(
                "worker for {} not ready within {:?}",
                user_id,
                self.config.startup_timeout()
            ))),
        };

        if let Some(e) = failure {
            self.remove_worker(&worker);
            worker.terminate(Termination::Unloaded);
            return Err(e);
        }

        worker.set_state(WorkerState::Ready);
        let load_time = started.elapsed();
        METRICS.supervisor.worker_loads_total.inc();
        METRICS
            .supervisor
            .worker_load_duration
            .observe(load_time.as_secs_f64());
        info!(
            "Worker for {} ready in {:.2}s (pid {:?})",
            user_id,
            load_time.as_secs_f64(),
            pid
        );

        self.spawn_exit_monitor(Arc::clone(&worker), exit);
        Ok(worker)
    }

    fn spawn_exit_monitor(self: &Arc<Self>, worker: Arc<ModelWorker>, exit: oneshot::Receiver<Option<i32>>) {
        let supervisor = Arc::downgrade(self);
        tokio::spawn(async move {
            let code = exit.await.ok().flatten();
            if let Some(supervisor) = supervisor.upgrade() {
                supervisor.handle_exit(&worker, code);
            }
        });
    }

    fn handle_exit(&self, worker: &Arc<ModelWorker>, code: Option<i32>) {
        if !worker.terminate(Termination::Exited(code)) {
            debug!("Worker {} exited after termination", worker.id);
            return;
        }

        warn!("Worker {} exited unexpectedly (code {:?})", worker.id, code);
        METRICS.supervisor.worker_exits_total.inc();
        if self.remove_worker(worker) {
            self.allocator.release(&worker.id);
        }
    }

    /// Remove `worker` from the pool if it is still the registered one
    fn remove_worker(&self, worker: &Arc<ModelWorker>) -> bool {
        let mut workers = self.workers.lock();
        let current = workers
            .get(&worker.id)
            .map(|w| Arc::ptr_eq(w, worker))
            .unwrap_or(false);
        if current {
            workers.remove(&worker.id);
            METRICS.supervisor.loaded_workers.set(workers.len() as i64);
        }
        current
    }

    /// Stop the user's worker and release its share
    pub fn unload(&self, user_id: &str) -> bool {
        let worker = {
            let mut workers = self.workers.lock();
            let worker = workers.remove(user_id);
            METRICS.supervisor.loaded_workers.set(workers.len() as i64);
            worker
        };

        match worker {
            Some(worker) => {
                info!("Unloading worker {}", user_id);
                worker.terminate(Termination::Unloaded);
                self.allocator.release(user_id);
                true
            }
            None => false,
        }
    }

    /// Unload every worker
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.workers.lock().keys().cloned().collect();
        info!("Shutting down {} workers", ids.len());
        for id in ids {
            self.unload(&id);
        }
    }

    /// Count a completed generation toward the worker's and the pool's
    /// running averages
    pub fn record_inference(&self, worker: &ModelWorker, elapsed: Duration) {
        worker.record_inference(elapsed);
        let mut totals = self.totals.lock();
        totals.inferences += 1;
        totals.response_time_ms += elapsed.as_secs_f64() * 1000.0;
    }

    pub fn stats(&self) -> SupervisorStats {
        let totals = self.totals.lock();
        SupervisorStats {
            loaded_workers: self.loaded_count(),
            total_inferences: totals.inferences,
            average_response_time_ms: if totals.inferences > 0 {
                totals.response_time_ms / totals.inferences as f64
            } else {
                0.0
            },
        }
    }
}

impl EvictionListener for Supervisor {
    fn on_evicted(&self, allocation: &MemoryAllocation) {
        let worker = {
            let mut workers = self.workers.lock();
            let worker = workers.remove(&allocation.worker_id);
            METRICS.supervisor.loaded_workers.set(workers.len() as i64);
            worker
        };

        if let Some(worker) = worker {
            info!(
                "Worker {} evicted ({:.1} GB reclaimed)",
                worker.id, allocation.size_gb
            );
            worker.terminate(Termination::Evicted);
        }
    }
}

/// Consume startup output until the ready line
async fn wait_for_ready(
    output: &mut mpsc::UnboundedReceiver<String>,
    exit: &mut oneshot::Receiver<Option<i32>>,
    ready_line: &str,
) -> Result<()> {
    loop {
        tokio::select! {
            line = output.recv() => match line {
                Some(line) if is_ready_line(&line, ready_line) => return Ok(()),
                Some(line) => debug!("Worker startup: {}", line),
                None => {
                    return Err(ModelPoolError::model_load_failed(
                        "worker closed its output before becoming ready",
                    ))
                }
            },
            code = &mut *exit => {
                return Err(ModelPoolError::model_load_failed(format!(
                    "worker exited during startup (code {:?})",
                    code.ok().flatten()
                )))
            }
        }
    }
}
