//! gpusched-scheduler: Priority scoring and dispatch for gpusched
//!
//! This crate decides which queued job runs where:
//! - Priority scores with aging
//! - Per-device capacity bookkeeping
//! - Placement decisions
//! - The periodic dispatcher loop

pub mod capacity;
pub mod dispatcher;
pub mod placement;
pub mod priority;

pub use capacity::{CapacityLedger, DeviceCapacity};
pub use dispatcher::{Dispatcher, TickReport};
pub use placement::{FirstFit, PlacementStrategy};
pub use priority::{PriorityEngine, PriorityFactors};
