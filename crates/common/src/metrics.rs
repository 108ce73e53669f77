//! Metrics collection for ModelPool
//!
//! This module provides Prometheus metrics for observability.
//! Metrics are write-only from the core's point of view: nothing reads
//! them back into allocator, supervisor or session state.

use lazy_static::lazy_static;
use prometheus::{Gauge, Histogram, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for ModelPool
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub allocator: AllocatorMetrics,
    pub supervisor: SupervisorMetrics,
    pub sessions: SessionMetrics,
}

/// Arena and eviction metrics
#[derive(Debug, Clone)]
pub struct AllocatorMetrics {
    /// Share of the arena backing live allocations
    pub utilization_percent: Gauge,

    /// (free fragments - 1) / free fragments
    pub fragmentation_ratio: Gauge,

    /// Live allocations
    pub active_allocations: IntGauge,

    /// Successful admissions
    pub admissions_total: IntCounter,

    /// Admissions refused after eviction
    pub admissions_rejected: IntCounter,

    /// Allocations evicted to make room
    pub evictions_total: IntCounter,

    /// Defragmentation passes
    pub defragmentations_total: IntCounter,
}

/// Worker pool metrics
#[derive(Debug, Clone)]
pub struct SupervisorMetrics {
    /// Resident workers
    pub loaded_workers: IntGauge,

    /// Workers that reached readiness
    pub worker_loads_total: IntCounter,

    /// Spawns that timed out or failed
    pub worker_load_failures: IntCounter,

    /// Unexpected worker process exits
    pub worker_exits_total: IntCounter,

    /// Spawn-to-ready duration
    pub worker_load_duration: Histogram,
}

/// Chat session metrics
#[derive(Debug, Clone)]
pub struct SessionMetrics {
    /// Live sessions
    pub active_sessions: IntGauge,

    /// Assistant messages produced
    pub messages_total: IntCounter,

    /// Failed generations (any cause)
    pub generation_failures: IntCounter,

    /// Generations aborted by the inactivity timeout
    pub generation_timeouts: IntCounter,

    /// Stream chunks forwarded to callers
    pub chunks_streamed_total: IntCounter,

    /// Request-to-complete duration
    pub generation_duration: Histogram,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        // Allocator metrics
        let utilization_percent = Gauge::new(
            "allocator_utilization_percent",
            "Percentage of the arena backing live allocations"
        ).unwrap();

        let fragmentation_ratio = Gauge::new(
            "allocator_fragmentation_ratio",
            "Fragmentation ratio of the free space"
        ).unwrap();

        let active_allocations = IntGauge::new(
            "allocator_active_allocations",
            "Current number of live allocations"
        ).unwrap();

        let admissions_total = IntCounter::new(
            "allocator_admissions_total",
            "Total number of successful admissions"
        ).unwrap();

        let admissions_rejected = IntCounter::new(
            "allocator_admissions_rejected_total",
            "Total number of admissions refused after eviction"
        ).unwrap();

        let evictions_total = IntCounter::new(
            "allocator_evictions_total",
            "Total number of evicted allocations"
        ).unwrap();

        let defragmentations_total = IntCounter::new(
            "allocator_defragmentations_total",
            "Total number of defragmentation passes"
        ).unwrap();

        // Supervisor metrics
        let loaded_workers = IntGauge::new(
            "supervisor_loaded_workers",
            "Current number of resident model workers"
        ).unwrap();

        let worker_loads_total = IntCounter::new(
            "supervisor_worker_loads_total",
            "Total number of workers that reached readiness"
        ).unwrap();

        let worker_load_failures = IntCounter::new(
            "supervisor_worker_load_failures_total",
            "Total number of worker spawns that timed out or failed"
        ).unwrap();

        let worker_exits_total = IntCounter::new(
            "supervisor_worker_exits_total",
            "Total number of unexpected worker process exits"
        ).unwrap();

        let worker_load_duration = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "supervisor_worker_load_duration_seconds",
                "Worker spawn-to-ready duration in seconds"
            ).buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0])
        ).unwrap();

        // Session metrics
        let active_sessions = IntGauge::new(
            "sessions_active",
            "Current number of chat sessions"
        ).unwrap();

        let messages_total = IntCounter::new(
            "sessions_messages_total",
            "Total number of assistant messages produced"
        ).unwrap();

        let generation_failures = IntCounter::new(
            "sessions_generation_failures_total",
            "Total number of failed generations"
        ).unwrap();

        let generation_timeouts = IntCounter::new(
            "sessions_generation_timeouts_total",
            "Total number of generations aborted by the inactivity timeout"
        ).unwrap();

        let chunks_streamed_total = IntCounter::new(
            "sessions_chunks_streamed_total",
            "Total number of stream chunks forwarded to callers"
        ).unwrap();

        let generation_duration = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "sessions_generation_duration_seconds",
                "Generation duration in seconds"
            ).buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0])
        ).unwrap();

        // Register all metrics
        registry.register(Box::new(utilization_percent.clone())).unwrap();
        registry.register(Box::new(fragmentation_ratio.clone())).unwrap();
        registry.register(Box::new(active_allocations.clone())).unwrap();
        registry.register(Box::new(admissions_total.clone())).unwrap();
        registry.register(Box::new(admissions_rejected.clone())).unwrap();
        registry.register(Box::new(evictions_total.clone())).unwrap();
        registry.register(Box::new(defragmentations_total.clone())).unwrap();

        registry.register(Box::new(loaded_workers.clone())).unwrap();
        registry.register(Box::new(worker_loads_total.clone())).unwrap();
        registry.register(Box::new(worker_load_failures.clone())).unwrap();
        registry.register(Box::new(worker_exits_total.clone())).unwrap();
        registry.register(Box::new(worker_load_duration.clone())).unwrap();

        registry.register(Box::new(active_sessions.clone())).unwrap();
        registry.register(Box::new(messages_total.clone())).unwrap();
        registry.register(Box::new(generation_failures.clone())).unwrap();
        registry.register(Box::new(generation_timeouts.clone())).unwrap();
        registry.register(Box::new(chunks_streamed_total.clone())).unwrap();
        registry.register(Box::new(generation_duration.clone())).unwrap();

        let allocator = AllocatorMetrics {
            utilization_percent,
            fragmentation_ratio,
            active_allocations,
            admissions_total,
            admissions_rejected,
            evictions_total,
            defragmentations_total,
        };

        let supervisor = SupervisorMetrics {
            loaded_workers,
            worker_loads_total,
            worker_load_failures,
            worker_exits_total,
            worker_load_duration,
        };

        let sessions = SessionMetrics {
            active_sessions,
            messages_total,
            generation_failures,
            generation_timeouts,
            chunks_streamed_total,
            generation_duration,
        };

        MetricsRegistry {
            registry,
            allocator,
            supervisor,
            sessions,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
