//! Configuration types for gpusched

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{GpuschedError, GpuschedResult};

const GIB: u64 = 1024 * 1024 * 1024;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// API server configuration
    pub api: ApiConfig,
    /// Dispatcher configuration
    pub scheduler: SchedulerConfig,
    /// Priority weights
    pub priority: PriorityConfig,
    /// GPU monitoring configuration
    pub gpu: GpuConfig,
    /// Runtime configuration
    pub runtime: RuntimeConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> GpuschedResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GpuschedError::Config(format!("Failed to read config file: {}", e)))?;
        let config: DaemonConfig = toml::from_str(&content)
            .map_err(|e| GpuschedError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> GpuschedResult<()> {
        if self.scheduler.tick_interval_ms == 0 {
            return Err(GpuschedError::Config(
                "scheduler.tick_interval_ms must be positive".to_string(),
            ));
        }
        self.priority.validate()
    }
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to bind the REST API server
    pub address: String,
    /// Port for the REST API server
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 9090,
        }
    }
}

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval between dispatcher ticks in milliseconds
    pub tick_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 2000,
        }
    }
}

/// Priority weights and class tables.
///
/// Final score:
/// `weight_qos * qos + weight_partition * partition + weight_age_per_hour * hours_waiting
///  - weight_job_size * min(vram_required / total_capacity, 1)`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    pub weight_qos: f64,
    pub weight_partition: f64,
    /// Score gained per hour spent in the queue
    pub weight_age_per_hour: f64,
    /// Maximum penalty for a job requesting all known capacity
    pub weight_job_size: f64,
    /// QoS class -> factor in [0, 1]
    pub qos_levels: BTreeMap<String, f64>,
    /// Partition -> factor in [0, 1]
    pub partitions: BTreeMap<String, f64>,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        let qos_levels = [
            ("hil", 1.0),
            ("high", 0.8),
            ("standard", 0.5),
            ("normal", 0.5),
            ("low", 0.1),
        ];
        let partitions = [("debug", 1.0), ("normal", 0.5), ("batch", 0.2)];

        Self {
            weight_qos: 10000.0,
            weight_partition: 1000.0,
            weight_age_per_hour: 1000.0,
            weight_job_size: 500.0,
            qos_levels: qos_levels
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            partitions: partitions
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }
}

impl PriorityConfig {
    /// Weights must be finite and non-negative, factors in [0, 1].
    ///
    /// Aging must be strictly positive, otherwise a low-priority job can be
    /// overtaken forever.
    pub fn validate(&self) -> GpuschedResult<()> {
        if !self.weight_age_per_hour.is_finite() || self.weight_age_per_hour <= 0.0 {
            return Err(GpuschedError::Config(format!(
                "priority.weight_age_per_hour must be a positive number, got {}",
                self.weight_age_per_hour
            )));
        }

        let weights = [
            ("weight_qos", self.weight_qos),
            ("weight_partition", self.weight_partition),
            ("weight_job_size", self.weight_job_size),
        ];
        for (name, value) in weights {
            if !value.is_finite() || value < 0.0 {
                return Err(GpuschedError::Config(format!(
                    "priority.{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }

        let factors = self
            .qos_levels
            .iter()
            .map(|(k, v)| ("qos_levels", k, *v))
            .chain(self.partitions.iter().map(|(k, v)| ("partitions", k, *v)));
        for (table, key, value) in factors {
            if !(0.0..=1.0).contains(&value) {
                return Err(GpuschedError::Config(format!(
                    "priority.{}.{} must be within [0, 1], got {}",
                    table, key, value
                )));
            }
        }
        Ok(())
    }
}

/// GPU monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    /// Capacity of the synthetic device used without a driver interface
    pub virtual_memory_total: u64,
    /// Upper bound for a single device sample
    pub sample_timeout_ms: u64,
    /// Devices at or above this temperature accept no new work
    pub max_healthy_temperature: u32,
    /// Skip driver detection and always use the synthetic device
    pub force_virtual: bool,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            virtual_memory_total: 16 * GIB,
            sample_timeout_ms: 1000,
            max_healthy_temperature: 85,
            force_virtual: false,
        }
    }
}

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Interpreter used to run scripts; scripts are executed directly when unset
    pub interpreter: Option<PathBuf>,
    /// Number of trailing output lines kept for the failure report
    pub stderr_tail_lines: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            interpreter: None,
            stderr_tail_lines: 20,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for job records, scripts and logs
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/gpusched"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (text or compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}
