//! Per-worker FIFO dispatch lanes
//!
//! A worker generates one reply at a time. Every message bound for a
//! worker takes a [`LaneGuard`] for it first; holders are served in
//! arrival order and the guard hands the lane to the next waiter when
//! dropped. A waiter that gives up (its future is dropped) is skipped.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::trace;

#[derive(Default)]
struct Lane {
    busy: bool,
    waiters: VecDeque<oneshot::Sender<LaneGuard>>,
}

/// Lanes keyed by worker id
#[derive(Default)]
pub struct DispatchQueue {
    lanes: Mutex<HashMap<String, Lane>>,
}

/// Exclusive turn on one worker's lane
pub struct LaneGuard {
    queue: Arc<DispatchQueue>,
    worker_id: String,
    armed: bool,
}

impl LaneGuard {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }
}

impl DispatchQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wait for this caller's turn on `worker_id`
    pub async fn acquire(self: &Arc<Self>, worker_id: &str) -> LaneGuard {
        loop {
            let turn = {
                let mut lanes = self.lanes.lock();
                let lane = lanes.entry(worker_id.to_string()).or_default();
                if !lane.busy {
                    lane.busy = true;
                    return LaneGuard {
                        queue: Arc::clone(self),
                        worker_id: worker_id.to_string(),
                        armed: true,
                    };
                }
                let (tx, rx) = oneshot::channel();
                lane.waiters.push_back(tx);
                trace!("Queued on lane {} ({} waiting)", worker_id, lane.waiters.len());
                rx
            };

            // A dropped sender means the hand-off never happened; queue again
            if let Ok(guard) = turn.await {
                return guard;
            }
        }
    }

    /// Callers waiting behind the current holder
    pub fn queue_depth(&self, worker_id: &str) -> usize {
        self.lanes
            .lock()
            .get(worker_id)
            .map(|lane| lane.waiters.len())
            .unwrap_or(0)
    }

    pub fn is_busy(&self, worker_id: &str) -> bool {
        self.lanes
            .lock()
            .get(worker_id)
            .map(|lane| lane.busy)
            .unwrap_or(false)
    }

    fn release(queue: &Arc<DispatchQueue>, worker_id: &str) {
        let mut lanes = queue.lanes.lock();
        let Some(lane) = lanes.get_mut(worker_id) else {
            return;
        };

        while let Some(waiter) = lane.waiters.pop_front() {
            let next = LaneGuard {
                queue: Arc::clone(queue),
                worker_id: worker_id.to_string(),
                armed: true,
            };
            match waiter.send(next) {
                Ok(()) => return,
                // Waiter went away; disarm so the drop does not recurse
                Err(mut skipped) => skipped.armed = false,
            }
        }

        lane.busy = false;
        lanes.remove(worker_id);
    }
}

impl Drop for LaneGuard {
    fn drop(&mut self) {
        if self.armed {
            DispatchQueue::release(&self.queue, &self.worker_id);
        }
    }
}
