//! Durable job store
//!
//! Every job lives in an in-memory index keyed by id and is mirrored to one
//! JSON record on disk. The status is a field of the record, so a job's state
//! is always recovered from exactly one file. Mutations go through
//! [`JobStore::transition`], which checks the state machine, writes the new
//! record and only then publishes it to the index. A failed write leaves the
//! job in its previous state.

use chrono::{DateTime, Utc};
use gpusched_core::{
    ExitInfo, GpuschedError, GpuschedResult, Job, JobRequest, JobStatus, Transition,
};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::layout::StoreLayout;
use crate::logs::{self, LogChunk};

/// Reason recorded for jobs found running after a restart
pub const ORPHANED_REASON: &str = "orphaned by scheduler restart";

/// Job store manager
pub struct JobStore {
    layout: StoreLayout,
    /// Jobs indexed by ID
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl JobStore {
    /// Open the store, creating the layout and loading all committed records
    pub async fn open(layout: StoreLayout) -> GpuschedResult<Self> {
        layout.init().await?;
        let jobs = load_records(&layout).await?;

        info!(
            path = %layout.root().display(),
            jobs = jobs.len(),
            "Job store opened"
        );

        Ok(Self {
            layout,
            jobs: RwLock::new(jobs),
        })
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Ingest a submission and enqueue it.
    ///
    /// `score` computes the initial priority of the new job.
    pub async fn create<F>(&self, request: JobRequest, score: F) -> GpuschedResult<Job>
    where
        F: FnOnce(&Job) -> f64,
    {
        request.validate()?;

        let id = self.fresh_id().await;
        let script_path = self
            .layout
            .script_path(id, request.script_name.as_deref());
        write_script(&script_path, &request).await?;

        let mut job = Job::new(id, &request, script_path.clone(), Utc::now());
        job.priority_score = score(&job);

        let mut jobs = self.jobs.write().await;
        if let Err(e) = self.persist(&job).await {
            drop(jobs);
            if let Err(cleanup) = tokio::fs::remove_file(&script_path).await {
                warn!(job_id = %id, error = %cleanup, "Failed to remove orphaned script");
            }
            return Err(e);
        }
        jobs.insert(id, job.clone());

        info!(
            job_id = %id,
            user_id = %job.user_id,
            vram_required = job.vram_required,
            partition = %job.partition,
            qos = %job.qos,
            priority_score = job.priority_score,
            "Job submitted"
        );

        Ok(job)
    }

    async fn fresh_id(&self) -> Uuid {
        let jobs = self.jobs.read().await;
        loop {
            let id = Uuid::new_v4();
            if jobs.contains_key(&id) {
                continue;
            }
            let record = tokio::fs::metadata(self.layout.record_path(id)).await;
            if matches!(record, Err(e) if e.kind() == std::io::ErrorKind::NotFound) {
                return id;
            }
        }
    }

    /// Get a job by ID
    pub async fn get(&self, id: Uuid) -> GpuschedResult<Job> {
        let jobs = self.jobs.read().await;
        jobs.get(&id).cloned().ok_or(GpuschedError::JobNotFound(id))
    }

    /// Snapshot of jobs, optionally restricted to one status.
    ///
    /// Running jobs come first, then queued jobs by descending score (earlier
    /// submission wins ties), then finished jobs, most recent first.
    pub async fn list(&self, status: Option<JobStatus>) -> Vec<Job> {
        let mut list: Vec<Job> = {
            let jobs = self.jobs.read().await;
            jobs.values()
                .filter(|j| status.map_or(true, |s| j.status == s))
                .cloned()
                .collect()
        };
        list.sort_by(listing_order);
        list
    }

    /// Atomically move a job to a new status.
    ///
    /// Fails with [`GpuschedError::InvalidTransition`] when the job's current
    /// status does not allow it, e.g. a second dispatch of the same job.
    pub async fn transition(&self, id: Uuid, transition: Transition) -> GpuschedResult<Job> {
        let mut jobs = self.jobs.write().await;
        let current = jobs.get(&id).ok_or(GpuschedError::JobNotFound(id))?;

        let mut updated = current.clone();
        updated.apply(&transition)?;
        self.persist(&updated).await?;

        debug!(
            job_id = %id,
            from = %current.status,
            to = %updated.status,
            "Job transitioned"
        );
        jobs.insert(id, updated.clone());

        Ok(updated)
    }

    /// Refresh priority scores of queued jobs. Jobs that left the queue keep
    /// their frozen score.
    ///
    /// Scores are derived data and are written to disk with the next transition.
    pub async fn update_scores(&self, scores: &[(Uuid, f64)]) -> usize {
        let mut jobs = self.jobs.write().await;
        scores
            .iter()
            .filter(|(id, score)| {
                jobs.get_mut(id)
                    .map_or(false, |job| job.set_priority_score(*score))
            })
            .count()
    }

    /// Fail every job recorded as running.
    ///
    /// A record left running by a previous scheduler process has no runner
    /// supervising it, so its outcome could never be recorded.
    pub async fn recover_orphans(&self) -> GpuschedResult<Vec<Uuid>> {
        let orphans: Vec<Uuid> = self
            .list(Some(JobStatus::Running))
            .await
            .into_iter()
            .map(|j| j.id)
            .collect();

        for id in &orphans {
            let transition = Transition::fail(ExitInfo::failure(ORPHANED_REASON), Utc::now());
            match self.transition(*id, transition).await {
                Ok(_) => warn!(job_id = %id, "Running job orphaned by restart marked failed"),
                Err(GpuschedError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(orphans)
    }

    /// Read captured output of a job starting at `offset`
    pub async fn read_log(
        &self,
        id: Uuid,
        offset: u64,
        max_bytes: usize,
    ) -> GpuschedResult<LogChunk> {
        let job = self.get(id).await?;
        match job.log_path {
            Some(path) => logs::read_from(&path, offset, max_bytes).await,
            None => Ok(LogChunk {
                data: Vec::new(),
                next_offset: offset,
            }),
        }
    }

    /// Write the record to a partial file and rename it into place
    async fn persist(&self, job: &Job) -> GpuschedResult<()> {
        let partial = self.layout.partial_record_path(job.id);
        let target = self.layout.record_path(job.id);
        let content = serde_json::to_vec_pretty(job)?;

        let result = async {
            let mut file = tokio::fs::File::create(&partial).await?;
            file.write_all(&content).await?;
            file.sync_all().await?;
            tokio::fs::rename(&partial, &target).await
        }
        .await;

        result.map_err(|e| {
            GpuschedError::Storage(format!("Failed to persist job {}: {}", job.id, e))
        })
    }
}

fn listing_order(a: &Job, b: &Job) -> Ordering {
    fn group(status: JobStatus) -> u8 {
        match status {
            JobStatus::Running => 0,
            JobStatus::Queued => 1,
            JobStatus::Completed | JobStatus::Failed => 2,
        }
    }

    group(a.status)
        .cmp(&group(b.status))
        .then_with(|| match a.status {
            JobStatus::Queued => queue_order(a, b),
            _ => recency(b.last_activity(), a.last_activity()),
        })
        .then_with(|| a.id.cmp(&b.id))
}

/// Descending score, earlier submission first on ties
pub fn queue_order(a: &Job, b: &Job) -> Ordering {
    b.priority_score
        .total_cmp(&a.priority_score)
        .then_with(|| a.submitted_at.cmp(&b.submitted_at))
}

fn recency(a: DateTime<Utc>, b: DateTime<Utc>) -> Ordering {
    a.cmp(&b)
}

async fn write_script(path: &Path, request: &JobRequest) -> GpuschedResult<()> {
    tokio::fs::write(path, &request.script).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if request.has_interpreter_line() {
            0o755
        } else {
            0o644
        };
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    }

    Ok(())
}

async fn load_records(layout: &StoreLayout) -> GpuschedResult<HashMap<Uuid, Job>> {
    let mut jobs = HashMap::new();
    let mut entries = tokio::fs::read_dir(layout.records_dir()).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();

        if StoreLayout::is_partial_record(&path) {
            warn!(path = %path.display(), "Discarding partially written record");
            tokio::fs::remove_file(&path).await?;
            continue;
        }
        if !StoreLayout::is_record(&path) {
            continue;
        }

        let content = tokio::fs::read(&path).await?;
        match serde_json::from_slice::<Job>(&content) {
            Ok(job) => {
                jobs.insert(job.id, job);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable job record");
            }
        }
    }

    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn request(qos: &str, vram: u64) -> JobRequest {
        JobRequest {
            user_id: "alice".to_string(),
            script_name: Some("job.sh".to_string()),
            script: b"#!/bin/sh\necho hi\n".to_vec(),
            vram_required: vram,
            partition: "normal".to_string(),
            qos: qos.to_string(),
        }
    }

    async fn open(dir: &TempDir) -> JobStore {
        JobStore::open(StoreLayout::new(dir.path())).await.unwrap()
    }

    fn start(gpu_id: u32) -> Transition {
        Transition::start(gpu_id, PathBuf::from("/tmp/job.log"), Utc::now())
    }

    #[tokio::test]
    async fn test_create_sets_initial_score() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;

        let job = store.create(request("low", 8), |_| 42.0).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.priority_score, 42.0);
        assert!(job.script_path.exists());
        assert!(job.script_path.to_string_lossy().ends_with(".sh"));
        assert!(store.layout().record_path(job.id).exists());
    }

    #[tokio::test]
    async fn test_create_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;

        let mut req = request("low", 8);
        req.script.clear();
        let err = store.create(req, |_| 0.0).await.unwrap_err();
        assert!(matches!(err, GpuschedError::Validation(_)));
        assert!(store.list(None).await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;

        let with_shebang = store.create(request("low", 1), |_| 0.0).await.unwrap();
        let mut plain = request("low", 1);
        plain.script = b"echo hi\n".to_vec();
        let plain = store.create(plain, |_| 0.0).await.unwrap();

        let mode = |p: &Path| std::fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&with_shebang.script_path), 0o755);
        assert_eq!(mode(&plain.script_path), 0o644);
    }

    #[tokio::test]
    async fn test_transition_guards_double_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        let job = store.create(request("low", 8), |_| 0.0).await.unwrap();

        let running = store.transition(job.id, start(0)).await.unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(running.assigned_gpu_id, Some(0));

        let err = store.transition(job.id, start(1)).await.unwrap_err();
        assert!(matches!(
            err,
            GpuschedError::InvalidTransition {
                from: JobStatus::Running,
                to: JobStatus::Running,
                ..
            }
        ));
        assert_eq!(store.get(job.id).await.unwrap().assigned_gpu_id, Some(0));
    }

    #[tokio::test]
    async fn test_concurrent_claims_single_winner() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open(&dir).await);
        let job = store.create(request("low", 8), |_| 0.0).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|gpu| {
                let store = store.clone();
                tokio::spawn(async move { store.transition(job.id, start(gpu)).await })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_transition_unknown_job() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        let err = store.transition(Uuid::new_v4(), start(0)).await.unwrap_err();
        assert!(matches!(err, GpuschedError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn test_failed_persist_keeps_prior_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        let job = store.create(request("low", 8), |_| 0.0).await.unwrap();

        // A directory in place of the partial file makes the write fail
        tokio::fs::create_dir(store.layout().partial_record_path(job.id))
            .await
            .unwrap();

        let err = store.transition(job.id, start(0)).await.unwrap_err();
        assert!(matches!(err, GpuschedError::Storage(_)));
        let current = store.get(job.id).await.unwrap();
        assert_eq!(current.status, JobStatus::Queued);
        assert!(current.assigned_gpu_id.is_none());
    }

    #[tokio::test]
    async fn test_list_ordering() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;

        let low = store.create(request("low", 1), |_| 10.0).await.unwrap();
        let high = store.create(request("high", 1), |_| 50.0).await.unwrap();
        let tie = store.create(request("low", 1), |_| 10.0).await.unwrap();
        let run = store.create(request("low", 1), |_| 1.0).await.unwrap();
        store.transition(run.id, start(0)).await.unwrap();

        let ids: Vec<Uuid> = store.list(None).await.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![run.id, high.id, low.id, tie.id]);

        let queued: Vec<Uuid> = store
            .list(Some(JobStatus::Queued))
            .await
            .iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(queued, vec![high.id, low.id, tie.id]);
    }

    #[tokio::test]
    async fn test_update_scores_only_queued() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        let queued = store.create(request("low", 1), |_| 1.0).await.unwrap();
        let running = store.create(request("low", 1), |_| 1.0).await.unwrap();
        store.transition(running.id, start(0)).await.unwrap();

        let updated = store
            .update_scores(&[(queued.id, 5.0), (running.id, 5.0), (Uuid::new_v4(), 5.0)])
            .await;
        assert_eq!(updated, 1);
        assert_eq!(store.get(queued.id).await.unwrap().priority_score, 5.0);
        assert_eq!(store.get(running.id).await.unwrap().priority_score, 1.0);
    }

    #[tokio::test]
    async fn test_reopen_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        let (queued, done) = {
            let store = open(&dir).await;
            let queued = store.create(request("low", 1), |_| 3.0).await.unwrap();
            let done = store.create(request("high", 1), |_| 4.0).await.unwrap();
            store.transition(done.id, start(0)).await.unwrap();
            store
                .transition(
                    done.id,
                    Transition::finish(ExitInfo::exited(Some(0), None), Utc::now()),
                )
                .await
                .unwrap();
            (queued, done)
        };

        let store = open(&dir).await;
        assert_eq!(store.list(None).await.len(), 2);
        assert_eq!(store.get(queued.id).await.unwrap().status, JobStatus::Queued);
        let done = store.get(done.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.assigned_gpu_id, Some(0));
    }

    #[tokio::test]
    async fn test_reopen_discards_partial_and_corrupt_records() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.init().await.unwrap();
        let stray = Uuid::new_v4();
        tokio::fs::write(layout.partial_record_path(stray), b"{\"id\":")
            .await
            .unwrap();
        tokio::fs::write(layout.record_path(stray), b"not json")
            .await
            .unwrap();

        let store = JobStore::open(layout.clone()).await.unwrap();
        assert!(store.list(None).await.is_empty());
        assert!(!layout.partial_record_path(stray).exists());
    }

    #[tokio::test]
    async fn test_recover_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let (queued, running) = {
            let store = open(&dir).await;
            let queued = store.create(request("low", 1), |_| 0.0).await.unwrap();
            let running = store.create(request("low", 1), |_| 0.0).await.unwrap();
            store.transition(running.id, start(0)).await.unwrap();
            (queued, running)
        };

        let store = open(&dir).await;
        let orphans = store.recover_orphans().await.unwrap();
        assert_eq!(orphans, vec![running.id]);

        let failed = store.get(running.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.exit_info.unwrap().reason, ORPHANED_REASON);
        assert_eq!(failed.assigned_gpu_id, Some(0));
        assert_eq!(store.get(queued.id).await.unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_read_log_before_start_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        let job = store.create(request("low", 1), |_| 0.0).await.unwrap();

        let chunk = store.read_log(job.id, 0, 1024).await.unwrap();
        assert!(chunk.data.is_empty());
        assert!(store.read_log(Uuid::new_v4(), 0, 1024).await.is_err());
    }
}
