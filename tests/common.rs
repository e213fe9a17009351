//! tests/common.rs
//! Shared helper functions for integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing_subscriber::fmt::TestWriter;
use turnqueue::{
  DispatcherState, JobError, JobId, JobQueue, JobRegistry, JobResult, JobStatus, MemoryQueueStore, Payload, QueueStore,
  QueuedJob,
};

// Initializes tracing subscriber for test output.
pub fn setup_tracing() {
  // Use try_init to avoid panic if called multiple times
  let _ = tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_writer(TestWriter::new())
    .with_test_writer()
    .try_init();
}

// Polls `check` every 10ms until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: StdDuration, mut check: F) -> bool
where
  F: FnMut() -> Fut,
  Fut: Future<Output = bool>,
{
  let deadline = tokio::time::Instant::now() + timeout;
  loop {
    if check().await {
      return true;
    }
    if tokio::time::Instant::now() >= deadline {
      return false;
    }
    tokio::time::sleep(StdDuration::from_millis(10)).await;
  }
}

// Waits until the job row reaches `status`, returning the row.
pub async fn wait_for_status(
  queue: &JobQueue,
  id: JobId,
  status: JobStatus,
  timeout: StdDuration,
) -> QueuedJob {
  let reached = wait_until(timeout, move || async move {
    matches!(queue.get_job(id).await, Ok(Some(job)) if job.status == status)
  })
  .await;
  assert!(reached, "job {id} did not reach status {status} within {timeout:?}");
  queue
    .get_job(id)
    .await
    .expect("query failed")
    .expect("job row missing")
}

// Waits until no row is pending or in progress and the dispatcher is idle.
pub async fn wait_until_drained(queue: &JobQueue, timeout: StdDuration) {
  let drained = wait_until(timeout, move || async move {
    let pending = queue.list_jobs(Some(JobStatus::Pending)).await.unwrap_or_default();
    let running = queue
      .list_jobs(Some(JobStatus::InProgress))
      .await
      .unwrap_or_default();
    pending.is_empty() && running.is_empty()
  })
  .await;
  assert!(drained, "queue did not drain within {timeout:?}");

  // The dispatcher answers queries only between events, so an idle answer
  // means bookkeeping for the last reply (metrics, pruning) is done.
  let settled = wait_until(timeout, move || async move {
    matches!(queue.dispatcher_state().await, Ok(DispatcherState::Idle))
  })
  .await;
  assert!(settled, "dispatcher did not return to idle within {timeout:?}");
}

pub fn memory_store() -> Arc<dyn QueueStore> {
  Arc::new(MemoryQueueStore::new())
}

// Registers a job that increments `counter`, optionally sleeping first.
pub fn register_counter(
  registry: &mut JobRegistry,
  locator: &str,
  counter: Arc<AtomicUsize>,
  delay: StdDuration,
) {
  registry.register(locator, move |_payload| {
    let ctr = counter.clone();
    async move {
      if delay > StdDuration::ZERO {
        tokio::time::sleep(delay).await;
      }
      let count = ctr.fetch_add(1, Ordering::SeqCst) + 1;
      tracing::debug!("Counter job executing (Count: {})", count);
      Ok(json!(count))
    }
  });
}

// Registers a job that appends every payload it receives to `log`, in call order.
pub fn register_recorder(registry: &mut JobRegistry, locator: &str, log: Arc<Mutex<Vec<Value>>>) {
  registry.register(locator, move |payload: Option<Payload>| {
    let log = log.clone();
    async move {
      log.lock().push(payload.unwrap_or(Value::Null));
      Ok(Value::Null)
    }
  });
}

// Registers a job that tracks how many instances run at once.
// Increments active count on start, decrements on end. Updates max observed.
pub fn register_concurrency_tracker(
  registry: &mut JobRegistry,
  locator: &str,
  active_counter: Arc<AtomicUsize>,
  max_observed_active: Arc<AtomicUsize>,
  delay: StdDuration,
) {
  registry.register(locator, move |_payload| {
    let active = active_counter.clone();
    let max_obs = max_observed_active.clone();
    async move {
      let current_active = active.fetch_add(1, Ordering::SeqCst) + 1;
      tracing::debug!("Concurrency job START (Active: {})", current_active);
      max_obs.fetch_max(current_active, Ordering::SeqCst);

      tokio::time::sleep(delay).await;

      active.fetch_sub(1, Ordering::SeqCst);
      Ok(Value::Null)
    }
  });
}

fn explode() -> JobResult {
  panic!("boom")
}

// Registers a job that panics after yielding once.
pub fn register_panic(registry: &mut JobRegistry, locator: &str) {
  registry.register(locator, |_payload| async {
    tokio::task::yield_now().await;
    explode()
  });
}

// Registers a job that always returns `Err(message)`.
pub fn register_failing(registry: &mut JobRegistry, locator: &str, message: &'static str) {
  registry.register(locator, move |_payload| async move { Err(JobError::failed(message)) });
}

// Registers a job that never finishes.
pub fn register_hanging(registry: &mut JobRegistry, locator: &str) {
  registry.register(locator, |_payload| async {
    std::future::pending::<()>().await;
    Ok(Value::Null)
  });
}
