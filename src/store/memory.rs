use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::QueueStore;
use crate::error::StoreError;
use crate::job::{new_job_id, JobId, JobStatus, Payload, QueuedJob};

/// In-memory [`QueueStore`] with the same ordering and pruning rules as the
/// SQLite store. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
  jobs: Mutex<HashMap<JobId, QueuedJob>>,
}

impl MemoryQueueStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn sorted(&self, filter: impl Fn(&QueuedJob) -> bool) -> Vec<QueuedJob> {
    let jobs = self.jobs.lock();
    let mut selected: Vec<QueuedJob> = jobs.values().filter(|job| filter(job)).cloned().collect();
    selected.sort_by(|a, b| (a.queued_at, a.id).cmp(&(b.queued_at, b.id)));
    selected
  }

  fn set_status(&self, id: JobId, status: JobStatus, error: Option<&str>) -> Result<(), StoreError> {
    let mut jobs = self.jobs.lock();
    let job = jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
    job.status = status;
    job.error = error.map(str::to_string);
    Ok(())
  }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
  async fn initialize(&self) -> Result<(), StoreError> {
    Ok(())
  }

  async fn enqueue(&self, locator: &str, payload: Option<Payload>) -> Result<JobId, StoreError> {
    let id = new_job_id();
    let job = QueuedJob {
      id,
      locator: locator.to_string(),
      payload,
      status: JobStatus::Pending,
      error: None,
      queued_at: Utc::now(),
    };
    self.jobs.lock().insert(id, job);
    Ok(id)
  }

  async fn next_pending(&self) -> Result<Option<QueuedJob>, StoreError> {
    let jobs = self.jobs.lock();
    Ok(
      jobs
        .values()
        .filter(|job| job.status == JobStatus::Pending)
        .min_by_key(|job| (job.queued_at, job.id))
        .cloned(),
    )
  }

  async fn mark_in_progress(&self, id: JobId) -> Result<(), StoreError> {
    self.set_status(id, JobStatus::InProgress, None)
  }

  async fn mark_completed(&self, id: JobId) -> Result<(), StoreError> {
    self.set_status(id, JobStatus::Completed, None)
  }

  async fn mark_errored(&self, id: JobId, message: &str) -> Result<(), StoreError> {
    self.set_status(id, JobStatus::Errored, Some(message))
  }

  async fn prune_completed(&self, max_retained: usize) -> Result<usize, StoreError> {
    let terminal = self.sorted(|job| job.status.is_terminal());
    let excess = terminal.len().saturating_sub(max_retained);
    let mut jobs = self.jobs.lock();
    for job in terminal.iter().take(excess) {
      jobs.remove(&job.id);
    }
    Ok(excess)
  }

  async fn get(&self, id: JobId) -> Result<Option<QueuedJob>, StoreError> {
    Ok(self.jobs.lock().get(&id).cloned())
  }

  async fn list(&self, status: Option<JobStatus>) -> Result<Vec<QueuedJob>, StoreError> {
    Ok(self.sorted(|job| status.map_or(true, |s| job.status == s)))
  }

  async fn count(&self, status: JobStatus) -> Result<usize, StoreError> {
    Ok(
      self
        .jobs
        .lock()
        .values()
        .filter(|job| job.status == status)
        .count(),
    )
  }

  async fn fail_in_progress(&self, message: &str) -> Result<usize, StoreError> {
    let mut jobs = self.jobs.lock();
    let mut changed = 0;
    for job in jobs.values_mut().filter(|job| job.status == JobStatus::InProgress) {
      job.status = JobStatus::Errored;
      job.error = Some(message.to_string());
      changed += 1;
    }
    Ok(changed)
  }
}
