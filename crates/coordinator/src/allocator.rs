//! Accelerator memory arena with LRU-with-priority eviction
//!
//! The arena is a fixed-capacity region (total minus a reserved margin)
//! modelled as an ordered list of fragments. Each live allocation backs
//! exactly one fragment and is referenced by the fragment's offset, so
//! splitting and merging never invalidate an allocation.
//!
//! Sizes are accounted in whole MiB internally; the public API speaks GB.
//! All mutations for one call happen under a single lock, so admit,
//! evict, release and defragment never interleave. Eviction
//! notifications are delivered after the lock is dropped but before the
//! call that caused them returns.

use modelpool_common::config::AllocatorConfig;
use modelpool_common::METRICS;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Weak;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const MB_PER_GB: f64 = 1024.0;

/// Convert GB to whole MiB, rounding up
pub fn gb_to_mb(gb: f64) -> u64 {
    if gb <= 0.0 || !gb.is_finite() {
        return 0;
    }
    (gb * MB_PER_GB).ceil() as u64
}

fn mb_to_gb(mb: u64) -> f64 {
    mb as f64 / MB_PER_GB
}

/// Eviction priority; lower priorities are evicted first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

/// Contiguous arena range
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryFragment {
    pub offset_mb: u64,
    pub size_mb: u64,
    pub free: bool,
}

impl MemoryFragment {
    pub fn end_mb(&self) -> u64 {
        self.offset_mb + self.size_mb
    }
}

/// Arena share held by one resident worker
#[derive(Debug, Clone)]
pub struct MemoryAllocation {
    pub worker_id: String,
    pub user_id: String,
    pub size_gb: f64,
    pub size_mb: u64,
    /// Offset of the backing fragment
    pub offset_mb: u64,
    pub allocated_at: Instant,
    pub last_accessed: Instant,
    pub priority: Priority,
}

/// Read-only arena snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocatorStats {
    pub utilization_percent: f64,
    pub fragmentation_ratio: f64,
    pub active_allocations: usize,
    pub capacity_gb: f64,
    pub used_gb: f64,
    pub free_fragments: usize,
}

/// Receives every allocation the allocator evicts on its own
pub trait EvictionListener: Send + Sync {
    fn on_evicted(&self, allocation: &MemoryAllocation);
}

struct ArenaState {
    fragments: Vec<MemoryFragment>,
    allocations: HashMap<String, MemoryAllocation>,
}

impl ArenaState {
    fn used_mb(&self) -> u64 {
        self.allocations.values().map(|a| a.size_mb).sum()
    }

    fn free_fragment_count(&self) -> usize {
        self.fragments.iter().filter(|f| f.free).count()
    }

    fn fragmentation_ratio(&self) -> f64 {
        let free = self.free_fragment_count();
        if free > 1 {
            (free - 1) as f64 / free as f64
        } else {
            0.0
        }
    }

    fn fragment_index(&self, offset_mb: u64) -> Option<usize> {
        self.fragments
            .binary_search_by_key(&offset_mb, |f| f.offset_mb)
            .ok()
    }
}

/// First-fit arena allocator
pub struct Allocator {
    capacity_mb: u64,
    /// Admission ceiling: capacity scaled by the utilization cap
    budget_mb: u64,
    protected_window: Duration,
    defrag_utilization_threshold: f64,
    defrag_fragmentation_threshold: f64,
    state: Mutex<ArenaState>,
    listener: RwLock<Option<Weak<dyn EvictionListener>>>,
}

impl Allocator {
    /// Create an allocator with one free fragment spanning the arena
    pub fn new(config: &AllocatorConfig) -> Self {
        let capacity_mb = gb_to_mb(config.capacity_gb());
        let budget_mb = (capacity_mb as f64 * config.max_utilization).floor() as u64;

        info!(
            "Allocator initialised: capacity {:.1} GB, admission budget {:.1} GB",
            mb_to_gb(capacity_mb),
            mb_to_gb(budget_mb)
        );

        Self {
            capacity_mb,
            budget_mb,
            protected_window: config.protected_window(),
            defrag_utilization_threshold: config.defrag_utilization_threshold,
            defrag_fragmentation_threshold: config.defrag_fragmentation_threshold,
            state: Mutex::new(ArenaState {
                fragments: vec![MemoryFragment {
                    offset_mb: 0,
                    size_mb: capacity_mb,
                    free: true,
                }],
                allocations: HashMap::new(),
            }),
            listener: RwLock::new(None),
        }
    }

    /// Register the component told about evictions
    pub fn set_listener(&self, listener: Weak<dyn EvictionListener>) {
        *self.listener.write() = Some(listener);
    }

    pub fn capacity_gb(&self) -> f64 {
        mb_to_gb(self.capacity_mb)
    }

    /// Admit an allocation, evicting lower-or-equal priority residents if
    /// the budget is short. Idempotent for an already allocated id.
    ///
    /// Victims are only evicted when they can cover the whole shortfall;
    /// a doomed admission leaves every resident in place.
    pub fn admit(&self, worker_id: &str, user_id: &str, size_gb: f64, priority: Priority) -> bool {
        let (admitted, evicted) = {
            let mut state = self.state.lock();
            let outcome = self.admit_locked(&mut state, worker_id, user_id, size_gb, priority);
            self.publish(&state);
            outcome
        };

        self.notify_evicted(&evicted);

        if admitted {
            METRICS.allocator.admissions_total.inc();
        } else {
            METRICS.allocator.admissions_rejected.inc();
        }
        admitted
    }

    fn admit_locked(
        &self,
        state: &mut ArenaState,
        worker_id: &str,
        user_id: &str,
        size_gb: f64,
        priority: Priority,
    ) -> (bool, Vec<MemoryAllocation>) {
        if let Some(existing) = state.allocations.get_mut(worker_id) {
            existing.last_accessed = Instant::now();
            return (true, Vec::new());
        }

        let size_mb = gb_to_mb(size_gb);
        if size_mb == 0 || size_mb > self.budget_mb {
            warn!(
                "Rejecting allocation for {}: {:.2} GB can never fit the {:.1} GB budget",
                worker_id,
                size_gb,
                mb_to_gb(self.budget_mb)
            );
            return (false, Vec::new());
        }

        let mut evicted = Vec::new();
        let available = self.budget_mb.saturating_sub(state.used_mb());
        if size_mb > available {
            let shortfall = size_mb - available;
            let (victims, freeable) = self.eviction_plan(state, shortfall, Some(priority));
            if freeable < shortfall {
                info!(
                    "Cannot admit {} ({:.2} GB): {:.2} GB short and only {:.2} GB evictable at or below {:?} priority",
                    worker_id,
                    size_gb,
                    mb_to_gb(shortfall),
                    mb_to_gb(freeable),
                    priority
                );
                return (false, evicted);
            }
            evicted = self.evict_victims(state, &victims);
        }

        let index = match Self::first_fit(state, size_mb) {
            Some(index) => index,
            None => {
                self.defragment_locked(state);
                match Self::first_fit(state, size_mb) {
                    Some(index) => index,
                    None => {
                        warn!(
                            "No contiguous fragment of {:.2} GB for {} even after defragmentation",
                            size_gb, worker_id
                        );
                        return (false, evicted);
                    }
                }
            }
        };

        let offset_mb = Self::split(state, index, size_mb);
        let now = Instant::now();
        state.allocations.insert(
            worker_id.to_string(),
            MemoryAllocation {
                worker_id: worker_id.to_string(),
                user_id: user_id.to_string(),
                size_gb,
                size_mb,
                offset_mb,
                allocated_at: now,
                last_accessed: now,
                priority,
            },
        );

        info!(
            "Admitted {} for user {}: {:.2} GB at offset {} MiB ({:?} priority)",
            worker_id, user_id, size_gb, offset_mb, priority
        );
        (true, evicted)
    }

    /// Index of the first free fragment that can hold `size_mb`
    fn first_fit(state: &ArenaState, size_mb: u64) -> Option<usize> {
        state
            .fragments
            .iter()
            .position(|f| f.free && f.size_mb >= size_mb)
    }

    /// Carve `size_mb` off the front of a free fragment; returns its offset
    fn split(state: &mut ArenaState, index: usize, size_mb: u64) -> u64 {
        let fragment = &mut state.fragments[index];
        let offset_mb = fragment.offset_mb;
        let remainder = fragment.size_mb - size_mb;

        fragment.size_mb = size_mb;
        fragment.free = false;

        if remainder > 0 {
            state.fragments.insert(
                index + 1,
                MemoryFragment {
                    offset_mb: offset_mb + size_mb,
                    size_mb: remainder,
                    free: true,
                },
            );
        }
        offset_mb
    }

    /// Release an allocation and free its fragment
    pub fn release(&self, worker_id: &str) -> bool {
        let mut state = self.state.lock();
        let released = self.release_locked(&mut state, worker_id).is_some();
        self.publish(&state);
        released
    }

    fn release_locked(&self, state: &mut ArenaState, worker_id: &str) -> Option<MemoryAllocation> {
        let allocation = state.allocations.remove(worker_id)?;

        match state.fragment_index(allocation.offset_mb) {
            Some(index) => state.fragments[index].free = true,
            None => warn!(
                "Allocation {} referenced missing fragment at {} MiB",
                worker_id, allocation.offset_mb
            ),
        }

        debug!("Released {} ({:.2} GB)", worker_id, allocation.size_gb);

        let utilization = state.used_mb() as f64 / self.capacity_mb as f64;
        if utilization < self.defrag_utilization_threshold
            && state.fragmentation_ratio() > self.defrag_fragmentation_threshold
        {
            self.defragment_locked(state);
        }

        Some(allocation)
    }

    /// Mark an allocation as recently used
    pub fn touch(&self, worker_id: &str) -> bool {
        let mut state = self.state.lock();
        match state.allocations.get_mut(worker_id) {
            Some(allocation) => {
                allocation.last_accessed = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Evict residents in (priority, last access) order until `required_gb`
    /// is freed or no candidate is left. Returns the GB actually freed.
    pub fn evict_until(&self, required_gb: f64) -> f64 {
        let evicted = {
            let mut state = self.state.lock();
            let (victims, _) = self.eviction_plan(&state, gb_to_mb(required_gb), None);
            let evicted = self.evict_victims(&mut state, &victims);
            self.publish(&state);
            evicted
        };

        self.notify_evicted(&evicted);
        mb_to_gb(evicted.iter().map(|a| a.size_mb).sum())
    }

    fn is_protected(&self, allocation: &MemoryAllocation, now: Instant) -> bool {
        allocation.priority == Priority::High
            && now.duration_since(allocation.last_accessed) < self.protected_window
    }

    /// Ordered victims covering `required_mb`, and how much they free.
    /// `ceiling` limits candidates to that priority or lower.
    fn eviction_plan(
        &self,
        state: &ArenaState,
        required_mb: u64,
        ceiling: Option<Priority>,
    ) -> (Vec<String>, u64) {
        let now = Instant::now();
        let mut candidates: Vec<&MemoryAllocation> = state
            .allocations
            .values()
            .filter(|a| ceiling.map_or(true, |c| a.priority <= c))
            .filter(|a| !self.is_protected(a, now))
            .collect();

        candidates.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.last_accessed.cmp(&b.last_accessed))
        });

        let mut victims = Vec::new();
        let mut freed = 0;
        for candidate in candidates {
            if freed >= required_mb {
                break;
            }
            freed += candidate.size_mb;
            victims.push(candidate.worker_id.clone());
        }
        (victims, freed)
    }

    fn evict_victims(&self, state: &mut ArenaState, victims: &[String]) -> Vec<MemoryAllocation> {
        let mut evicted = Vec::with_capacity(victims.len());
        for id in victims {
            if let Some(allocation) = self.release_locked(state, id) {
                info!(
                    "Evicted {} ({:?} priority, {:.2} GB, idle {:?})",
                    id,
                    allocation.priority,
                    allocation.size_gb,
                    allocation.last_accessed.elapsed()
                );
                METRICS.allocator.evictions_total.inc();
                evicted.push(allocation);
            }
        }
        evicted
    }

    fn notify_evicted(&self, evicted: &[MemoryAllocation]) {
        if evicted.is_empty() {
            return;
        }
        let listener = self.listener.read().as_ref().and_then(|l| l.upgrade());
        match listener {
            Some(listener) => {
                for allocation in evicted {
                    listener.on_evicted(allocation);
                }
            }
            None => debug!("No eviction listener registered for {} evictions", evicted.len()),
        }
    }

    /// Merge adjacent free fragments. Returns the number of merges.
    pub fn defragment(&self) -> usize {
        let mut state = self.state.lock();
        let merges = self.defragment_locked(&mut state);
        self.publish(&state);
        merges
    }

    fn defragment_locked(&self, state: &mut ArenaState) -> usize {
        state.fragments.sort_by_key(|f| f.offset_mb);

        let before = state.fragments.len();
        let mut merged: Vec<MemoryFragment> = Vec::with_capacity(before);
        for fragment in state.fragments.drain(..) {
            if let Some(last) = merged.last_mut() {
                if last.free && fragment.free {
                    last.size_mb += fragment.size_mb;
                    continue;
                }
            }
            merged.push(fragment);
        }
        state.fragments = merged;

        let merges = before - state.fragments.len();
        if merges > 0 {
            METRICS.allocator.defragmentations_total.inc();
            debug!(
                "Defragmented arena: {} merges, {} fragments left",
                merges,
                state.fragments.len()
            );
        }
        merges
    }

    pub fn stats(&self) -> AllocatorStats {
        let state = self.state.lock();
        self.stats_locked(&state)
    }

    fn stats_locked(&self, state: &ArenaState) -> AllocatorStats {
        let used_mb = state.used_mb();
        AllocatorStats {
            utilization_percent: used_mb as f64 / self.capacity_mb as f64 * 100.0,
            fragmentation_ratio: state.fragmentation_ratio(),
            active_allocations: state.allocations.len(),
            capacity_gb: mb_to_gb(self.capacity_mb),
            used_gb: mb_to_gb(used_mb),
            free_fragments: state.free_fragment_count(),
        }
    }

    fn publish(&self, state: &ArenaState) {
        let stats = self.stats_locked(state);
        METRICS.allocator.utilization_percent.set(stats.utilization_percent);
        METRICS.allocator.fragmentation_ratio.set(stats.fragmentation_ratio);
        METRICS.allocator.active_allocations.set(stats.active_allocations as i64);
    }

    /// Snapshot of the fragment list, ordered by offset
    pub fn fragments(&self) -> Vec<MemoryFragment> {
        self.state.lock().fragments.clone()
    }

    pub fn allocation(&self, worker_id: &str) -> Option<MemoryAllocation> {
        self.state.lock().allocations.get(worker_id).cloned()
    }

    pub fn is_allocated(&self, worker_id: &str) -> bool {
        self.state.lock().allocations.contains_key(worker_id)
    }

    /// GB that admissions may still claim without eviction
    pub fn available_gb(&self) -> f64 {
        let state = self.state.lock();
        mb_to_gb(self.budget_mb.saturating_sub(state.used_mb()))
    }
}
