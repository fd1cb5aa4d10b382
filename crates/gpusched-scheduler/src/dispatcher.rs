//! Dispatcher loop
//!
//! Every tick samples the devices, re-scores the queue and walks it once in
//! priority order, placing each job first-fit against a capacity ledger.
//! Claiming a job is a store transition, so several dispatchers sharing a
//! store never start the same job twice.

use chrono::{DateTime, Utc};
use gpusched_core::{
    ExitInfo, GpuDevice, GpuMonitor, GpuschedError, GpuschedResult, Job, JobRequest, JobStatus,
    Transition,
};
use gpusched_runtime::Runtime;
use gpusched_store::{queue_order, JobStore};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::capacity::{CapacityLedger, DeviceCapacity};
use crate::placement::{FirstFit, PlacementStrategy};
use crate::priority::PriorityEngine;

/// Outcome of one dispatcher tick
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    /// Jobs started this tick with their device
    pub dispatched: Vec<(Uuid, u32)>,
    /// Jobs that fit no device right now
    pub skipped: Vec<Uuid>,
    /// Jobs larger than every healthy device
    pub unschedulable: Vec<Uuid>,
    /// Jobs that failed to start
    pub launch_failures: Vec<Uuid>,
    /// Jobs already claimed by a concurrent tick
    pub already_claimed: Vec<Uuid>,
    /// Device capacity left at the end of the tick
    pub capacity: Vec<DeviceCapacity>,
}

/// Per-tick state, held for the whole tick
#[derive(Default)]
struct TickState {
    /// Unschedulable jobs that were already reported
    reported_unschedulable: HashSet<Uuid>,
}

/// Dispatcher matches queued jobs to devices and hands them to the runtime
pub struct Dispatcher {
    store: Arc<JobStore>,
    monitor: Arc<dyn GpuMonitor>,
    runtime: Arc<dyn Runtime>,
    engine: PriorityEngine,
    placement: Arc<dyn PlacementStrategy>,
    interval: Duration,
    /// Latest device sample
    devices: RwLock<Vec<GpuDevice>>,
    state: Mutex<TickState>,
}

impl Dispatcher {
    /// Create a new dispatcher
    pub fn new(
        store: Arc<JobStore>,
        monitor: Arc<dyn GpuMonitor>,
        runtime: Arc<dyn Runtime>,
        engine: PriorityEngine,
        interval: Duration,
    ) -> Self {
        info!(
            monitor = monitor.name(),
            runtime = runtime.name(),
            interval_ms = interval.as_millis() as u64,
            "Dispatcher initialized"
        );

        Self {
            store,
            monitor,
            runtime,
            engine,
            placement: Arc::new(FirstFit),
            interval,
            devices: RwLock::new(Vec::new()),
            state: Mutex::new(TickState::default()),
        }
    }

    /// Replace the placement strategy
    pub fn with_placement(mut self, placement: Arc<dyn PlacementStrategy>) -> Self {
        self.placement = placement;
        self
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn engine(&self) -> &PriorityEngine {
        &self.engine
    }

    /// Latest device sample, sampling the monitor if no tick ran yet
    pub async fn latest_devices(&self) -> Vec<GpuDevice> {
        {
            let devices = self.devices.read().await;
            if !devices.is_empty() {
                return devices.clone();
            }
        }
        let sample = self.monitor.sample().await;
        *self.devices.write().await = sample.clone();
        sample
    }

    /// Total memory of the latest device sample
    pub async fn total_capacity(&self) -> u64 {
        self.latest_devices()
            .await
            .iter()
            .map(|d| d.memory_total)
            .sum()
    }

    /// Ingest a submission with its initial score
    pub async fn submit(&self, request: JobRequest) -> GpuschedResult<Job> {
        let total_capacity = self.total_capacity().await;
        let job = self
            .store
            .create(request, |job| {
                self.engine.score(job, job.submitted_at, total_capacity)
            })
            .await?;

        info!(
            job_id = %job.id,
            user = %job.user_id,
            vram_required = job.vram_required,
            qos = %job.qos,
            partition = %job.partition,
            priority = job.priority_score,
            "Job submitted"
        );
        Ok(job)
    }

    /// Run one tick at the current time
    pub async fn tick(&self) -> TickReport {
        self.tick_at(Utc::now()).await
    }

    /// Run one tick scoring jobs at `now`
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let mut state = self.state.lock().await;

        let devices = self.monitor.sample().await;
        *self.devices.write().await = devices.clone();

        let running = self.store.list(Some(JobStatus::Running)).await;
        let mut ledger = CapacityLedger::new(&devices, &running);
        let total_capacity = ledger.total_capacity();

        // Re-score the queue
        let mut queue = self.store.list(Some(JobStatus::Queued)).await;
        let scores: Vec<(Uuid, f64)> = queue
            .iter_mut()
            .map(|job| {
                job.priority_score = self.engine.score(job, now, total_capacity);
                (job.id, job.priority_score)
            })
            .collect();
        self.store.update_scores(&scores).await;
        queue.sort_by(queue_order);

        let mut report = TickReport::default();

        for job in &queue {
            if !ledger.can_ever_fit(job.vram_required) {
                if state.reported_unschedulable.insert(job.id) {
                    warn!(
                        job_id = %job.id,
                        vram_required = job.vram_required,
                        "Job requests more memory than any device provides, it stays queued"
                    );
                }
                report.unschedulable.push(job.id);
                continue;
            }

            let Some(gpu_id) = self.placement.place(job.vram_required, ledger.devices()) else {
                report.skipped.push(job.id);
                continue;
            };

            if let Err(e) = ledger.reserve(gpu_id, job.vram_required) {
                error!(job_id = %job.id, error = %e, "Placement chose a device without capacity");
                report.skipped.push(job.id);
                continue;
            }

            match self.dispatch(job, gpu_id, now).await {
                Dispatch::Started => report.dispatched.push((job.id, gpu_id)),
                Dispatch::Failed => {
                    ledger.release(gpu_id, job.vram_required);
                    report.launch_failures.push(job.id);
                }
                Dispatch::Claimed => {
                    ledger.release(gpu_id, job.vram_required);
                    report.already_claimed.push(job.id);
                }
                Dispatch::Deferred => {
                    ledger.release(gpu_id, job.vram_required);
                    report.skipped.push(job.id);
                }
            }
        }

        // Report again if a job becomes unschedulable after fitting once
        let still_unschedulable: HashSet<&Uuid> = report.unschedulable.iter().collect();
        state
            .reported_unschedulable
            .retain(|id| still_unschedulable.contains(id));

        report.capacity = ledger.devices().to_vec();

        if !report.dispatched.is_empty() || !report.launch_failures.is_empty() {
            info!(
                dispatched = report.dispatched.len(),
                failed = report.launch_failures.len(),
                queued = queue.len() - report.dispatched.len() - report.launch_failures.len(),
                "Dispatcher tick"
            );
        } else {
            debug!(queued = queue.len(), "Dispatcher tick, nothing started");
        }

        report
    }

    /// Prepare, claim and launch a single job
    async fn dispatch(&self, job: &Job, gpu_id: u32, now: DateTime<Utc>) -> Dispatch {
        let log_path = match self.runtime.prepare(job).await {
            Ok(path) => path,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Job cannot be started");
                let transition = Transition::fail(ExitInfo::failure(e.to_string()), Utc::now());
                return match self.store.transition(job.id, transition).await {
                    Ok(_) => Dispatch::Failed,
                    Err(GpuschedError::InvalidTransition { .. }) => Dispatch::Claimed,
                    Err(e) => {
                        error!(job_id = %job.id, error = %e, "Failed to record launch failure");
                        Dispatch::Deferred
                    }
                };
            }
        };

        let running = match self
            .store
            .transition(job.id, Transition::start(gpu_id, log_path, now.max(job.submitted_at)))
            .await
        {
            Ok(running) => running,
            Err(GpuschedError::InvalidTransition { .. }) => {
                debug!(job_id = %job.id, "Job already claimed");
                return Dispatch::Claimed;
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to claim job");
                return Dispatch::Deferred;
            }
        };

        match self.runtime.launch(&running).await {
            Ok(handle) => {
                info!(
                    job_id = %job.id,
                    gpu_id = gpu_id,
                    pid = ?handle.pid,
                    priority = job.priority_score,
                    "Job started"
                );
                Dispatch::Started
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Job failed to launch");
                Dispatch::Failed
            }
        }
    }

    /// Tick on the configured interval until cancelled
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Dispatcher started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Dispatcher stopping");
                    break;
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
    }
}

enum Dispatch {
    Started,
    /// The job was moved to FAILED
    Failed,
    /// Another tick owns the job
    Claimed,
    /// Left queued for the next tick
    Deferred,
}
