//! Priority scoring for queued jobs

use chrono::{DateTime, Utc};
use gpusched_core::{Job, PriorityConfig};
use serde::Serialize;
use std::collections::BTreeMap;

const MILLIS_PER_HOUR: f64 = 3_600_000.0;

/// Raw inputs of a priority score
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriorityFactors {
    /// QoS class factor in [0, 1]
    pub qos: f64,
    /// Partition factor in [0, 1]
    pub partition: f64,
    /// Hours spent in the queue
    pub wait_hours: f64,
    /// Share of the known capacity requested, capped at 1
    pub size: f64,
}

/// Computes priority scores from a [`PriorityConfig`].
///
/// Scoring is a pure function of the job and the given instant.
#[derive(Debug, Clone)]
pub struct PriorityEngine {
    config: PriorityConfig,
}

impl PriorityEngine {
    pub fn new(config: PriorityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PriorityConfig {
        &self.config
    }

    /// Score a job at `now` against `total_capacity` bytes of known device memory
    pub fn score(&self, job: &Job, now: DateTime<Utc>, total_capacity: u64) -> f64 {
        self.combine(&self.breakdown(job, now, total_capacity))
    }

    /// Individual factors the score is built from
    pub fn breakdown(&self, job: &Job, now: DateTime<Utc>, total_capacity: u64) -> PriorityFactors {
        let waited_ms = (now - job.submitted_at).num_milliseconds().max(0);
        let size = if total_capacity == 0 {
            1.0
        } else {
            (job.vram_required as f64 / total_capacity as f64).min(1.0)
        };

        PriorityFactors {
            qos: lookup(&self.config.qos_levels, &job.qos),
            partition: lookup(&self.config.partitions, &job.partition),
            wait_hours: waited_ms as f64 / MILLIS_PER_HOUR,
            size,
        }
    }

    /// Weighted sum of the factors
    pub fn combine(&self, factors: &PriorityFactors) -> f64 {
        self.config.weight_qos * factors.qos
            + self.config.weight_partition * factors.partition
            + self.config.weight_age_per_hour * factors.wait_hours
            - self.config.weight_job_size * factors.size
    }
}

/// Factor for `key`; unknown keys get the lowest configured factor
fn lookup(table: &BTreeMap<String, f64>, key: &str) -> f64 {
    match table.get(key) {
        Some(factor) => *factor,
        None => table.values().copied().reduce(f64::min).unwrap_or(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use gpusched_core::JobRequest;
    use std::path::PathBuf;
    use uuid::Uuid;

    const GB: u64 = 1_000_000_000;

    fn job(qos: &str, partition: &str, vram_required: u64, submitted_at: DateTime<Utc>) -> Job {
        let request = JobRequest {
            user_id: "alice".to_string(),
            script_name: None,
            script: b"#!/bin/sh\n".to_vec(),
            vram_required,
            partition: partition.to_string(),
            qos: qos.to_string(),
        };
        Job::new(
            Uuid::new_v4(),
            &request,
            PathBuf::from("/tmp/job.sh"),
            submitted_at,
        )
    }

    fn engine() -> PriorityEngine {
        PriorityEngine::new(PriorityConfig::default())
    }

    #[test]
    fn test_score_is_deterministic() {
        let now = Utc::now();
        let j = job("high", "normal", 4 * GB, now - Duration::minutes(17));
        let e = engine();
        assert_eq!(
            e.score(&j, now, 16 * GB).to_bits(),
            e.score(&j, now, 16 * GB).to_bits()
        );
    }

    #[test]
    fn test_default_formula() {
        let submitted = Utc::now();
        let j = job("high", "batch", 8 * GB, submitted);
        let score = engine().score(&j, submitted + Duration::hours(2), 16 * GB);
        // 10000 * 0.8 + 1000 * 0.2 + 1000 * 2 - 500 * 0.5
        assert!((score - 9950.0).abs() < 1e-6);
    }

    #[test]
    fn test_aging_is_monotonic() {
        let submitted = Utc::now();
        let j = job("low", "normal", GB, submitted);
        let e = engine();

        let mut previous = f64::MIN;
        for minutes in (0..600).step_by(7) {
            let score = e.score(&j, submitted + Duration::minutes(minutes), 16 * GB);
            assert!(score >= previous);
            previous = score;
        }
    }

    #[test]
    fn test_clock_skew_does_not_reduce_score() {
        let submitted = Utc::now();
        let j = job("low", "normal", GB, submitted);
        let e = engine();
        assert_eq!(
            e.score(&j, submitted - Duration::minutes(5), 16 * GB),
            e.score(&j, submitted, 16 * GB)
        );
    }

    #[test]
    fn test_higher_qos_outranks_lower() {
        let now = Utc::now();
        let e = engine();
        let high = job("high", "normal", 10 * GB, now);
        let low = job("low", "normal", 10 * GB, now);
        assert!(e.score(&high, now, 10 * GB) > e.score(&low, now, 10 * GB));
    }

    #[test]
    fn test_unknown_class_gets_lowest_factor() {
        let now = Utc::now();
        let e = engine();
        let factors = e.breakdown(&job("platinum", "nowhere", GB, now), now, 16 * GB);
        assert_eq!(factors.qos, 0.1);
        assert_eq!(factors.partition, 0.2);

        let empty = PriorityEngine::new(PriorityConfig {
            qos_levels: BTreeMap::new(),
            ..PriorityConfig::default()
        });
        assert_eq!(empty.breakdown(&job("high", "normal", GB, now), now, GB).qos, 0.0);
    }

    #[test]
    fn test_size_penalty_is_bounded() {
        let now = Utc::now();
        let e = engine();
        assert_eq!(e.breakdown(&job("low", "normal", 64 * GB, now), now, 8 * GB).size, 1.0);
        assert_eq!(e.breakdown(&job("low", "normal", GB, now), now, 0).size, 1.0);

        let small = e.score(&job("low", "normal", GB, now), now, 16 * GB);
        let large = e.score(&job("low", "normal", 12 * GB, now), now, 16 * GB);
        assert!(small > large);
    }

    #[test]
    fn test_waiting_job_eventually_outranks_fresh_submissions() {
        // One tick per minute, a fresh high-QoS job arrives every tick
        let start = Utc::now();
        let e = engine();
        let waiting = job("low", "normal", 16 * GB, start);

        let overtaken_at = (0..24 * 60).find(|minute| {
            let now = start + Duration::minutes(*minute);
            let fresh = job("hil", "debug", GB, now);
            e.score(&waiting, now, 16 * GB) > e.score(&fresh, now, 16 * GB)
        });

        // (10000 * 0.9 + 1000 * 0.5 + 500 * (1 - 1/16)) / 1000 per hour ≈ 9.97 hours
        assert_eq!(overtaken_at, Some(599));
    }
}
