//! Per-device capacity bookkeeping for a dispatcher tick

use gpusched_core::{GpuDevice, GpuschedError, GpuschedResult, Job, JobStatus};
use serde::Serialize;
use tracing::{debug, warn};

/// Capacity of one device as seen by the current tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceCapacity {
    /// Device index
    pub gpu_id: u32,
    /// Total memory in bytes
    pub memory_total: u64,
    /// Bytes still available for new reservations
    pub available: u64,
    /// Whether new work may be placed on the device
    pub healthy: bool,
}

/// Tracks memory reservations against a device sample.
///
/// Built from one monitor sample plus the jobs already running; every
/// placement made during the tick is reserved here so later jobs in the same
/// tick see it.
#[derive(Debug, Clone)]
pub struct CapacityLedger {
    /// Devices ordered by id
    devices: Vec<DeviceCapacity>,
}

impl CapacityLedger {
    /// Create a ledger from a device sample and the currently running jobs
    pub fn new(devices: &[GpuDevice], running: &[Job]) -> Self {
        let mut devices: Vec<DeviceCapacity> = devices
            .iter()
            .map(|d| DeviceCapacity {
                gpu_id: d.gpu_id,
                memory_total: d.memory_total,
                available: d.memory_free(),
                healthy: d.is_healthy,
            })
            .collect();
        devices.sort_by_key(|d| d.gpu_id);

        let mut ledger = Self { devices };
        for job in running.iter().filter(|j| j.status == JobStatus::Running) {
            let reserved = job
                .assigned_gpu_id
                .map_or(false, |gpu_id| ledger.consume(gpu_id, job.vram_required));
            if !reserved {
                debug!(
                    job_id = %job.id,
                    gpu_id = ?job.assigned_gpu_id,
                    "Running job assigned to an unknown device"
                );
            }
        }
        ledger
    }

    /// Devices in stable id order
    pub fn devices(&self) -> &[DeviceCapacity] {
        &self.devices
    }

    /// Sum of the memory of every sampled device
    pub fn total_capacity(&self) -> u64 {
        self.devices.iter().map(|d| d.memory_total).sum()
    }

    /// Available bytes on a device
    pub fn available(&self, gpu_id: u32) -> Option<u64> {
        self.devices
            .iter()
            .find(|d| d.gpu_id == gpu_id)
            .map(|d| d.available)
    }

    /// Whether some healthy device is large enough to ever hold `vram_required`
    pub fn can_ever_fit(&self, vram_required: u64) -> bool {
        self.devices
            .iter()
            .any(|d| d.healthy && d.memory_total >= vram_required)
    }

    /// Reserve memory on a device
    pub fn reserve(&mut self, gpu_id: u32, bytes: u64) -> GpuschedResult<()> {
        let device = self.device_mut(gpu_id).ok_or_else(|| {
            GpuschedError::Scheduler(format!("Unknown device {}", gpu_id))
        })?;

        if device.available < bytes {
            return Err(GpuschedError::Scheduler(format!(
                "Not enough memory on device {}: requested {}, available {}",
                gpu_id, bytes, device.available
            )));
        }

        device.available -= bytes;
        debug!(gpu_id = gpu_id, bytes = bytes, available = device.available, "Reserved memory");
        Ok(())
    }

    /// Return a reservation that was not used
    pub fn release(&mut self, gpu_id: u32, bytes: u64) {
        match self.device_mut(gpu_id) {
            Some(device) => {
                device.available = device.available.saturating_add(bytes).min(device.memory_total);
                debug!(gpu_id = gpu_id, bytes = bytes, "Released memory");
            }
            None => warn!(gpu_id = gpu_id, "Release on unknown device"),
        }
    }

    fn consume(&mut self, gpu_id: u32, bytes: u64) -> bool {
        match self.device_mut(gpu_id) {
            Some(device) => {
                device.available = device.available.saturating_sub(bytes);
                true
            }
            None => false,
        }
    }

    fn device_mut(&mut self, gpu_id: u32) -> Option<&mut DeviceCapacity> {
        self.devices.iter_mut().find(|d| d.gpu_id == gpu_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gpusched_core::{JobRequest, Transition};
    use std::path::PathBuf;
    use uuid::Uuid;

    const GB: u64 = 1_000_000_000;

    fn device(gpu_id: u32, total: u64, used: u64) -> GpuDevice {
        GpuDevice {
            gpu_id,
            name: format!("Test GPU {}", gpu_id),
            memory_total: total,
            memory_used: used,
            temperature: Some(40),
            utilization: Some(0),
            is_healthy: true,
        }
    }

    fn running_job(gpu_id: u32, vram_required: u64) -> Job {
        let request = JobRequest {
            user_id: "alice".to_string(),
            script_name: None,
            script: b"#!/bin/sh\n".to_vec(),
            vram_required,
            partition: "normal".to_string(),
            qos: "low".to_string(),
        };
        let mut job = Job::new(Uuid::new_v4(), &request, PathBuf::from("/tmp/a.sh"), Utc::now());
        job.apply(&Transition::start(gpu_id, PathBuf::from("/tmp/a.log"), Utc::now()))
            .unwrap();
        job
    }

    #[test]
    fn test_ledger_from_sample() {
        let ledger = CapacityLedger::new(&[device(1, 16 * GB, 0), device(0, 8 * GB, 2 * GB)], &[]);
        let ids: Vec<u32> = ledger.devices().iter().map(|d| d.gpu_id).collect();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(ledger.available(0), Some(6 * GB));
        assert_eq!(ledger.available(1), Some(16 * GB));
        assert_eq!(ledger.available(7), None);
        assert_eq!(ledger.total_capacity(), 24 * GB);
    }

    #[test]
    fn test_running_jobs_are_reserved() {
        let running = vec![running_job(0, 4 * GB), running_job(0, 3 * GB), running_job(5, GB)];
        let ledger = CapacityLedger::new(&[device(0, 16 * GB, GB)], &running);
        assert_eq!(ledger.available(0), Some(8 * GB));
    }

    #[test]
    fn test_oversubscribed_device_saturates() {
        let running = vec![running_job(0, 12 * GB)];
        let ledger = CapacityLedger::new(&[device(0, 16 * GB, 8 * GB)], &running);
        assert_eq!(ledger.available(0), Some(0));
    }

    #[test]
    fn test_reserve_and_release() {
        let mut ledger = CapacityLedger::new(&[device(0, 16 * GB, 0)], &[]);
        ledger.reserve(0, 10 * GB).unwrap();
        assert_eq!(ledger.available(0), Some(6 * GB));

        assert!(ledger.reserve(0, 10 * GB).is_err());
        assert!(ledger.reserve(3, GB).is_err());

        ledger.release(0, 10 * GB);
        assert_eq!(ledger.available(0), Some(16 * GB));
    }

    #[test]
    fn test_can_ever_fit_ignores_unhealthy_devices() {
        let mut hot = device(1, 32 * GB, 0);
        hot.is_healthy = false;
        let ledger = CapacityLedger::new(&[device(0, 8 * GB, 0), hot], &[]);
        assert!(ledger.can_ever_fit(8 * GB));
        assert!(!ledger.can_ever_fit(16 * GB));
    }
}
