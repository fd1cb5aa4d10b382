//! GPU detection and monitoring
//!
//! A [`GpuMonitor`] produces point-in-time samples of the installed devices.
//! Which implementation is used is decided once at startup by
//! [`detect_monitor`]: NVML when the driver library can be loaded, otherwise a
//! single synthetic device so that the scheduler keeps working on hosts
//! without GPUs.

use async_trait::async_trait;
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::Nvml;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::GpuConfig;
use crate::error::{GpuschedError, GpuschedResult};

/// Name reported by the synthetic device
pub const FALLBACK_DEVICE_NAME: &str = "CPU-fallback";

/// Point-in-time sample of a GPU device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuDevice {
    /// Device index
    pub gpu_id: u32,
    /// Device name
    pub name: String,
    /// Total memory in bytes
    pub memory_total: u64,
    /// Used memory in bytes
    pub memory_used: u64,
    /// Core temperature in degrees Celsius
    pub temperature: Option<u32>,
    /// Current utilization percentage (0-100)
    pub utilization: Option<u32>,
    /// Whether new work may be placed on the device
    pub is_healthy: bool,
}

impl GpuDevice {
    /// Synthetic device used when no driver interface is available
    pub fn fallback(memory_total: u64) -> Self {
        Self {
            gpu_id: 0,
            name: FALLBACK_DEVICE_NAME.to_string(),
            memory_total,
            memory_used: 0,
            temperature: None,
            utilization: None,
            is_healthy: true,
        }
    }

    /// Unused memory according to the sample
    pub fn memory_free(&self) -> u64 {
        self.memory_total.saturating_sub(self.memory_used)
    }
}

/// Source of GPU samples
#[async_trait]
pub trait GpuMonitor: Send + Sync {
    /// Sample all devices, ordered by device id.
    ///
    /// Never fails: implementations degrade to a synthetic device.
    async fn sample(&self) -> Vec<GpuDevice>;

    /// Get the monitor name
    fn name(&self) -> &'static str;
}

/// Blocking device query against a driver interface
pub trait DeviceQuery: Send + Sync + 'static {
    fn query(&self) -> GpuschedResult<Vec<GpuDevice>>;
}

/// Monitor that always reports the single synthetic device
#[derive(Debug, Clone)]
pub struct VirtualMonitor {
    memory_total: u64,
}

impl VirtualMonitor {
    /// Create a virtual monitor with the given capacity
    pub fn new(memory_total: u64) -> Self {
        Self { memory_total }
    }
}

#[async_trait]
impl GpuMonitor for VirtualMonitor {
    async fn sample(&self) -> Vec<GpuDevice> {
        vec![GpuDevice::fallback(self.memory_total)]
    }

    fn name(&self) -> &'static str {
        "virtual"
    }
}

/// Monitor that runs a blocking [`DeviceQuery`] with a bounded timeout and
/// falls back to the synthetic device on any failure
pub struct SampledMonitor<Q: DeviceQuery> {
    query: Arc<Q>,
    timeout: Duration,
    fallback: VirtualMonitor,
}

impl<Q: DeviceQuery> SampledMonitor<Q> {
    pub fn new(query: Q, timeout: Duration, fallback_memory_total: u64) -> Self {
        Self {
            query: Arc::new(query),
            timeout,
            fallback: VirtualMonitor::new(fallback_memory_total),
        }
    }

    async fn try_sample(&self) -> GpuschedResult<Vec<GpuDevice>> {
        let query = self.query.clone();
        let task = tokio::task::spawn_blocking(move || query.query());

        let mut devices = tokio::time::timeout(self.timeout, task)
            .await
            .map_err(|_| GpuschedError::Gpu(format!("sample timed out after {:?}", self.timeout)))?
            .map_err(|e| GpuschedError::Gpu(format!("sample task failed: {}", e)))??;

        if devices.is_empty() {
            return Err(GpuschedError::Gpu("no devices reported".to_string()));
        }
        devices.sort_by_key(|d| d.gpu_id);
        Ok(devices)
    }
}

#[async_trait]
impl<Q: DeviceQuery> GpuMonitor for SampledMonitor<Q> {
    async fn sample(&self) -> Vec<GpuDevice> {
        match self.try_sample().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!(error = %e, "GPU sample failed, using fallback device");
                self.fallback.sample().await
            }
        }
    }

    fn name(&self) -> &'static str {
        "sampled"
    }
}

/// NVIDIA devices through NVML
pub struct NvmlQuery {
    nvml: Nvml,
    max_healthy_temperature: u32,
}

impl NvmlQuery {
    /// Load the NVML library
    pub fn init(max_healthy_temperature: u32) -> GpuschedResult<Self> {
        let nvml = Nvml::init().map_err(|e| GpuschedError::Gpu(e.to_string()))?;
        Ok(Self {
            nvml,
            max_healthy_temperature,
        })
    }
}

impl DeviceQuery for NvmlQuery {
    fn query(&self) -> GpuschedResult<Vec<GpuDevice>> {
        let nvml_err = |e: nvml_wrapper::error::NvmlError| GpuschedError::Gpu(e.to_string());

        let count = self.nvml.device_count().map_err(nvml_err)?;
        let mut devices = Vec::with_capacity(count as usize);

        for index in 0..count {
            let device = self.nvml.device_by_index(index).map_err(nvml_err)?;
            let name = device.name().map_err(nvml_err)?;
            let memory = device.memory_info().map_err(nvml_err)?;
            // Temperature and utilization are not supported on every board
            let temperature = device.temperature(TemperatureSensor::Gpu).ok();
            let utilization = device.utilization_rates().ok().map(|u| u.gpu);

            devices.push(GpuDevice {
                gpu_id: index,
                name,
                memory_total: memory.total,
                memory_used: memory.used,
                temperature,
                utilization,
                is_healthy: is_healthy_temperature(temperature, self.max_healthy_temperature),
            });
        }

        Ok(devices)
    }
}

fn is_healthy_temperature(temperature: Option<u32>, max: u32) -> bool {
    temperature.map_or(true, |t| t < max)
}

/// Select the monitor implementation for this host
pub fn detect_monitor(config: &GpuConfig) -> Arc<dyn GpuMonitor> {
    if config.force_virtual {
        info!(
            memory_total = config.virtual_memory_total,
            "Virtual GPU mode forced by configuration"
        );
        return Arc::new(VirtualMonitor::new(config.virtual_memory_total));
    }

    match NvmlQuery::init(config.max_healthy_temperature) {
        Ok(query) => {
            info!("NVML available, monitoring NVIDIA devices");
            Arc::new(SampledMonitor::new(
                query,
                Duration::from_millis(config.sample_timeout_ms),
                config.virtual_memory_total,
            ))
        }
        Err(e) => {
            debug!(error = %e, "NVML unavailable");
            info!(
                memory_total = config.virtual_memory_total,
                "No GPU driver interface, running in virtual GPU mode"
            );
            Arc::new(VirtualMonitor::new(config.virtual_memory_total))
        }
    }
}
