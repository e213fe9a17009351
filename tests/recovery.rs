mod common;
use crate::common::{memory_store, register_counter, setup_tracing, wait_for_status, wait_until_drained};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use turnqueue::{JobQueue, JobRegistry, JobStatus, QueueStore, SqliteQueueStore, INTERRUPTED_MESSAGE};

const WAIT: StdDuration = StdDuration::from_secs(5);

#[tokio::test]
async fn test_orphaned_in_progress_row_is_marked_errored_at_startup() {
  setup_tracing();
  let store = memory_store();
  store.initialize().await.unwrap();
  let orphan = store.enqueue("jobs/count", None).await.unwrap();
  store.mark_in_progress(orphan).await.unwrap();
  let waiting = store.enqueue("jobs/count", None).await.unwrap();

  let counter = Arc::new(AtomicUsize::new(0));
  let mut registry = JobRegistry::new();
  register_counter(&mut registry, "jobs/count", counter.clone(), StdDuration::ZERO);

  let queue = JobQueue::builder()
    .shared_store(store.clone())
    .registry(registry)
    .build()
    .await
    .unwrap();

  // Recovery happens inside build, before anything is dispatched.
  let row = queue.get_job(orphan).await.unwrap().unwrap();
  assert_eq!(row.status, JobStatus::Errored);
  assert_eq!(row.error.as_deref(), Some(INTERRUPTED_MESSAGE));

  wait_for_status(&queue, waiting, JobStatus::Completed, WAIT).await;
  wait_until_drained(&queue, WAIT).await;

  // The orphan is not re-run; only the pending row executed.
  assert_eq!(counter.load(Ordering::SeqCst), 1);
  let metrics = queue.metrics_snapshot();
  assert_eq!(metrics.jobs_recovered, 1);
  assert_eq!(metrics.jobs_dispatched, 1);
  queue.shutdown_graceful(Some(WAIT)).await.unwrap();
}

#[tokio::test]
async fn test_recovery_survives_reopening_the_database() -> anyhow::Result<()> {
  setup_tracing();
  let dir = tempfile::tempdir()?;
  let path = dir.path().join("queue.db");

  let orphan = {
    let store = SqliteQueueStore::open(&path, "queued_jobs")?;
    store.initialize().await?;
    let id = store.enqueue("jobs/count", None).await?;
    store.mark_in_progress(id).await?;
    id
  };

  let queue = JobQueue::builder()
    .store(SqliteQueueStore::open(&path, "queued_jobs")?)
    .build()
    .await?;

  let row = queue.get_job(orphan).await?.expect("orphaned row still stored");
  assert_eq!(row.status, JobStatus::Errored);
  assert_eq!(row.error.as_deref(), Some(INTERRUPTED_MESSAGE));
  assert!(queue.list_jobs(Some(JobStatus::InProgress)).await?.is_empty());
  queue.shutdown_graceful(Some(WAIT)).await?;
  Ok(())
}

#[tokio::test]
async fn test_startup_prune_applies_retention_cap() {
  setup_tracing();
  let store = memory_store();
  store.initialize().await.unwrap();
  for _ in 0..12 {
    let id = store.enqueue("jobs/old", None).await.unwrap();
    store.mark_completed(id).await.unwrap();
  }

  let queue = JobQueue::builder()
    .shared_store(store)
    .max_retained(5)
    .build()
    .await
    .unwrap();

  assert_eq!(
    queue.list_jobs(Some(JobStatus::Completed)).await.unwrap().len(),
    5
  );
  assert_eq!(queue.metrics_snapshot().jobs_pruned, 7);
  queue.shutdown_graceful(Some(WAIT)).await.unwrap();
}
