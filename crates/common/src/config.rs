//! Configuration structures for ModelPool
//!
//! Configurations are loaded from YAML files and can be overridden by
//! environment variables of the form `MODELPOOL__SECTION__KEY`
//! (e.g. `MODELPOOL__SUPERVISOR__MAX_LOADED_MODELS=2`).

use crate::error::{ModelPoolError, Result};
use modelpool_proto::{ChatSettings, DEFAULT_READY_LINE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment prefix for overrides
pub const ENV_PREFIX: &str = "MODELPOOL";

/// Top-level configuration for the coordinator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelPoolConfig {
    /// Memory arena and eviction policy
    #[serde(default)]
    pub allocator: AllocatorConfig,

    /// Worker pool configuration
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Chat session configuration
    #[serde(default)]
    pub sessions: SessionConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Allocator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Total accelerator memory in GB
    #[serde(default = "default_total_memory")]
    pub total_memory_gb: f64,

    /// Fixed system margin subtracted from the total
    #[serde(default = "default_reserved_memory")]
    pub reserved_memory_gb: f64,

    /// Fraction of the arena that admissions may fill
    #[serde(default = "default_max_utilization")]
    pub max_utilization: f64,

    /// High-priority allocations touched within this window are never
    /// auto-evicted
    #[serde(default = "default_protected_window")]
    pub protected_window_secs: u64,

    /// Release-time defragmentation runs below this utilization...
    #[serde(default = "default_defrag_utilization")]
    pub defrag_utilization_threshold: f64,

    /// ...and above this fragmentation ratio
    #[serde(default = "default_defrag_fragmentation")]
    pub defrag_fragmentation_threshold: f64,
}

/// Worker supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Upper bound on resident workers
    #[serde(default = "default_max_loaded_models")]
    pub max_loaded_models: usize,

    /// Arena share requested for one fine-tuned model
    #[serde(default = "default_model_size")]
    pub estimated_model_size_gb: f64,

    /// Time allowed between spawn and the readiness line
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Program started once per loaded model
    #[serde(default = "default_worker_program")]
    pub worker_program: String,

    /// Extra arguments placed before `--model-path`/`--user-id`
    #[serde(default)]
    pub worker_args: Vec<String>,

    /// Literal line a worker prints once ready
    #[serde(default = "default_ready_line")]
    pub ready_line: String,

    /// Directory holding one model artifact per user id
    #[serde(default = "default_model_root")]
    pub model_root: PathBuf,
}

/// Session manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Inactivity timeout for a single generation
    #[serde(default = "default_generation_timeout")]
    pub generation_timeout_secs: u64,

    /// Sessions idle longer than this are swept
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Interval of the idle sweep
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// System message seeded into every new session
    #[serde(default = "default_welcome_message")]
    pub welcome_message: String,

    /// Settings applied when a session is created without any
    #[serde(default)]
    pub default_settings: ChatSettings,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// How often the daemon logs the admin snapshot
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,

    /// Enable Prometheus metrics
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,
}

/// Default value functions
fn default_total_memory() -> f64 {
    32.0
}

fn default_reserved_memory() -> f64 {
    2.0
}

fn default_max_utilization() -> f64 {
    0.95
}

fn default_protected_window() -> u64 {
    300
}

fn default_defrag_utilization() -> f64 {
    0.5
}

fn default_defrag_fragmentation() -> f64 {
    0.3
}

fn default_max_loaded_models() -> usize {
    3
}

fn default_model_size() -> f64 {
    14.0
}

fn default_startup_timeout() -> u64 {
    300
}

fn default_worker_program() -> String {
    "modelpool-worker".to_string()
}

fn default_ready_line() -> String {
    DEFAULT_READY_LINE.to_string()
}

fn default_model_root() -> PathBuf {
    PathBuf::from("models")
}

fn default_generation_timeout() -> u64 {
    60
}

fn default_idle_timeout() -> u64 {
    30 * 60
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_welcome_message() -> String {
    "Hi! I'm here to chat whenever you're ready.".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stats_interval() -> u64 {
    30
}

fn default_metrics() -> bool {
    true
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            total_memory_gb: default_total_memory(),
            reserved_memory_gb: default_reserved_memory(),
            max_utilization: default_max_utilization(),
            protected_window_secs: default_protected_window(),
            defrag_utilization_threshold: default_defrag_utilization(),
            defrag_fragmentation_threshold: default_defrag_fragmentation(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_loaded_models: default_max_loaded_models(),
            estimated_model_size_gb: default_model_size(),
            startup_timeout_secs: default_startup_timeout(),
            worker_program: default_worker_program(),
            worker_args: Vec::new(),
            ready_line: default_ready_line(),
            model_root: default_model_root(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            generation_timeout_secs: default_generation_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            welcome_message: default_welcome_message(),
            default_settings: ChatSettings::default(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            stats_interval_secs: default_stats_interval(),
            enable_metrics: default_metrics(),
        }
    }
}

impl AllocatorConfig {
    /// Arena capacity (total minus the reserved margin)
    pub fn capacity_gb(&self) -> f64 {
        self.total_memory_gb - self.reserved_memory_gb
    }

    pub fn protected_window(&self) -> Duration {
        Duration::from_secs(self.protected_window_secs)
    }
}

impl SupervisorConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

impl SessionConfig {
    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl ModelPoolConfig {
    /// Load configuration from a YAML file layered with environment
    /// overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| {
                ModelPoolError::Config(format!(
                    "Failed to read config file {}: {}",
                    path.display(),
                    e
                ))
            })?;

        let config: ModelPoolConfig = settings.try_deserialize().map_err(|e| {
            ModelPoolError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML document
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: ModelPoolConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let allocator = &self.allocator;
        if allocator.total_memory_gb <= 0.0 {
            return Err(ModelPoolError::config("total_memory_gb must be positive"));
        }
        if allocator.reserved_memory_gb < 0.0
            || allocator.reserved_memory_gb >= allocator.total_memory_gb
        {
            return Err(ModelPoolError::config(format!(
                "reserved_memory_gb ({}) must be in [0, total_memory_gb)",
                allocator.reserved_memory_gb
            )));
        }
        if !(allocator.max_utilization > 0.0 && allocator.max_utilization <= 1.0) {
            return Err(ModelPoolError::config(format!(
                "max_utilization ({}) must be in (0, 1]",
                allocator.max_utilization
            )));
        }

        let supervisor = &self.supervisor;
        if supervisor.max_loaded_models == 0 {
            return Err(ModelPoolError::config("max_loaded_models must be at least 1"));
        }
        if supervisor.estimated_model_size_gb <= 0.0 {
            return Err(ModelPoolError::config("estimated_model_size_gb must be positive"));
        }
        if supervisor.startup_timeout_secs == 0 {
            return Err(ModelPoolError::config("startup_timeout_secs must be positive"));
        }
        if supervisor.worker_program.trim().is_empty() {
            return Err(ModelPoolError::config("worker_program must not be empty"));
        }
        if supervisor.ready_line.trim().is_empty() {
            return Err(ModelPoolError::config("ready_line must not be empty"));
        }

        let sessions = &self.sessions;
        if sessions.generation_timeout_secs == 0 {
            return Err(ModelPoolError::config("generation_timeout_secs must be positive"));
        }
        if sessions.idle_timeout_secs == 0 || sessions.sweep_interval_secs == 0 {
            return Err(ModelPoolError::config(
                "idle_timeout_secs and sweep_interval_secs must be positive",
            ));
        }

        if self.observability.stats_interval_secs == 0 {
            return Err(ModelPoolError::config("stats_interval_secs must be positive"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = ModelPoolConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.allocator.capacity_gb(), 30.0);
        assert_eq!(config.sessions.generation_timeout(), Duration::from_secs(60));
        assert_eq!(config.supervisor.startup_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_partial_yaml_falls_back_to_defaults() {
        let config = ModelPoolConfig::from_yaml_str(
            r#"
allocator:
  total_memory_gb: 30
  reserved_memory_gb: 2
supervisor:
  max_loaded_models: 2
  worker_program: /opt/tutor/bin/worker
sessions:
  default_settings:
    temperature: 0.2
    max_tokens: 128
"#,
        )
        .unwrap();

        assert_eq!(config.allocator.capacity_gb(), 28.0);
        assert_eq!(config.allocator.max_utilization, 0.95);
        assert_eq!(config.supervisor.max_loaded_models, 2);
        assert_eq!(config.supervisor.ready_line, DEFAULT_READY_LINE);
        assert_eq!(config.sessions.default_settings.max_tokens, 128);
        assert_eq!(config.sessions.default_settings.memory_length, 10);
    }

    #[test]
    fn test_config_validation_rejects_bad_utilization() {
        let mut config = ModelPoolConfig::default();
        config.allocator.max_utilization = 1.5;
        assert!(config.validate().is_err());

        config.allocator.max_utilization = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_rejects_reserved_above_total() {
        let mut config = ModelPoolConfig::default();
        config.allocator.reserved_memory_gb = 40.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_rejects_empty_pool() {
        let mut config = ModelPoolConfig::default();
        config.supervisor.max_loaded_models = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "supervisor:\n  estimated_model_size_gb: 7.5\nsessions:\n  idle_timeout_secs: 600"
        )
        .unwrap();

        let config = ModelPoolConfig::load(file.path()).unwrap();
        assert_eq!(config.supervisor.estimated_model_size_gb, 7.5);
        assert_eq!(config.sessions.idle_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = ModelPoolConfig::load("/nonexistent/modelpool.yaml");
        assert!(matches!(result, Err(ModelPoolError::Config(_))));
    }
}
