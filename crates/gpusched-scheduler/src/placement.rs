//! Job placement decisions

use crate::capacity::DeviceCapacity;

/// Strategy for choosing a device for a job
pub trait PlacementStrategy: Send + Sync {
    /// Pick a device for a job requesting `vram_required` bytes.
    ///
    /// `devices` is ordered by device id.
    fn place(&self, vram_required: u64, devices: &[DeviceCapacity]) -> Option<u32>;
}

/// First healthy device, in id order, with enough available memory
pub struct FirstFit;

impl PlacementStrategy for FirstFit {
    fn place(&self, vram_required: u64, devices: &[DeviceCapacity]) -> Option<u32> {
        devices
            .iter()
            .find(|d| d.healthy && d.available >= vram_required)
            .map(|d| d.gpu_id)
    }
}
