mod common;
use crate::common::{
  memory_store, register_concurrency_tracker, register_counter, register_recorder, setup_tracing,
  wait_for_status, wait_until, wait_until_drained,
};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use turnqueue::{
  BuildError, DispatcherState, JobQueue, JobRegistry, JobStatus, SqliteQueueStore,
};

const WAIT: StdDuration = StdDuration::from_secs(5);

#[tokio::test]
async fn test_build_requires_store() {
  let result = JobQueue::builder().build().await;
  assert!(matches!(result, Err(BuildError::MissingStore)));
}

#[tokio::test]
async fn test_drain_after_burst_runs_one_at_a_time_in_order() {
  setup_tracing();
  let active = Arc::new(AtomicUsize::new(0));
  let max_active = Arc::new(AtomicUsize::new(0));
  let log = Arc::new(Mutex::new(Vec::new()));

  let mut registry = JobRegistry::new();
  register_concurrency_tracker(
    &mut registry,
    "jobs/slow",
    active.clone(),
    max_active.clone(),
    StdDuration::from_millis(30),
  );
  register_recorder(&mut registry, "jobs/record", log.clone());

  let queue = JobQueue::builder()
    .store(SqliteQueueStore::in_memory().unwrap())
    .registry(registry)
    .build()
    .await
    .unwrap();

  // Interleave slow jobs with recorders so ordering is observable.
  let mut ids = Vec::new();
  for i in 0..5 {
    ids.push(queue.enqueue("jobs/slow", None).await.unwrap());
    ids.push(queue.enqueue("jobs/record", Some(json!(i))).await.unwrap());
  }

  wait_until_drained(&queue, WAIT).await;

  assert_eq!(max_active.load(Ordering::SeqCst), 1, "jobs must never overlap");
  assert_eq!(*log.lock(), vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
  for id in &ids {
    let job = queue.get_job(*id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed, "job {id} should be completed");
  }

  let metrics = queue.metrics_snapshot();
  assert_eq!(metrics.jobs_enqueued, 10);
  assert_eq!(metrics.jobs_dispatched, 10);
  assert_eq!(metrics.jobs_completed, 10);
  assert_eq!(metrics.jobs_errored, 0);
  assert_eq!(metrics.job_execution_duration_count, 10);

  queue.shutdown_graceful(Some(WAIT)).await.unwrap();
}

#[tokio::test]
async fn test_at_most_one_row_in_progress() {
  setup_tracing();
  let active = Arc::new(AtomicUsize::new(0));
  let max_active = Arc::new(AtomicUsize::new(0));
  let mut registry = JobRegistry::new();
  register_concurrency_tracker(
    &mut registry,
    "jobs/slow",
    active,
    max_active.clone(),
    StdDuration::from_millis(50),
  );

  let queue = JobQueue::builder()
    .shared_store(memory_store())
    .registry(registry)
    .build()
    .await
    .unwrap();

  for _ in 0..4 {
    queue.enqueue("jobs/slow", None).await.unwrap();
  }

  // Sample the table while the backlog drains.
  let max_in_progress = Arc::new(AtomicUsize::new(0));
  let drained = wait_until(WAIT, || {
    let queue = queue.clone();
    let max_in_progress = max_in_progress.clone();
    async move {
      let running = queue.list_jobs(Some(JobStatus::InProgress)).await.unwrap().len();
      let pending = queue.list_jobs(Some(JobStatus::Pending)).await.unwrap().len();
      max_in_progress.fetch_max(running, Ordering::SeqCst);
      running == 0 && pending == 0
    }
  })
  .await;

  assert!(drained);
  let observed = max_in_progress.load(Ordering::SeqCst);
  assert!(observed <= 1, "observed {observed} rows in progress");
  assert_eq!(max_active.load(Ordering::SeqCst), 1);
  queue.shutdown_graceful(Some(WAIT)).await.unwrap();
}

#[tokio::test]
async fn test_payload_round_trip() {
  setup_tracing();
  let log = Arc::new(Mutex::new(Vec::new()));
  let mut registry = JobRegistry::new();
  register_recorder(&mut registry, "jobs/record", log.clone());

  let queue = JobQueue::builder()
    .store(SqliteQueueStore::in_memory().unwrap())
    .registry(registry)
    .build()
    .await
    .unwrap();

  let payload = json!({ "n": 3, "tags": ["a", "b"] });
  let id = queue.enqueue("jobs/record", Some(payload.clone())).await.unwrap();
  let job = wait_for_status(&queue, id, JobStatus::Completed, WAIT).await;

  assert_eq!(*log.lock(), vec![payload.clone()]);
  assert_eq!(job.payload, Some(payload));
  assert_eq!(job.error, None);
  queue.shutdown_graceful(Some(WAIT)).await.unwrap();
}

#[tokio::test]
async fn test_enqueue_serialized_and_typed_handler() {
  setup_tracing();
  #[derive(Serialize, serde::Deserialize, Debug, PartialEq, Clone)]
  struct Resize {
    image: String,
    width: u32,
  }

  let seen = Arc::new(Mutex::new(Vec::<Resize>::new()));
  let mut registry = JobRegistry::new();
  let seen_clone = seen.clone();
  registry.register_typed("images/resize", move |job: Resize| {
    let seen = seen_clone.clone();
    async move {
      seen.lock().push(job.clone());
      Ok(json!(job.width))
    }
  });

  let queue = JobQueue::builder()
    .shared_store(memory_store())
    .registry(registry)
    .build()
    .await
    .unwrap();

  let request = Resize {
    image: "cat.png".into(),
    width: 320,
  };
  let id = queue
    .enqueue_serialized("images/resize", &request)
    .await
    .unwrap();
  wait_for_status(&queue, id, JobStatus::Completed, WAIT).await;
  assert_eq!(*seen.lock(), vec![request]);
  queue.shutdown_graceful(Some(WAIT)).await.unwrap();
}

#[tokio::test]
async fn test_retention_cap_applied_after_each_job() {
  setup_tracing();
  let counter = Arc::new(AtomicUsize::new(0));
  let mut registry = JobRegistry::new();
  register_counter(&mut registry, "jobs/count", counter.clone(), StdDuration::ZERO);

  let queue = JobQueue::builder()
    .shared_store(memory_store())
    .registry(registry)
    .max_retained(100)
    .build()
    .await
    .unwrap();

  let mut ids = Vec::with_capacity(150);
  for _ in 0..150 {
    ids.push(queue.enqueue("jobs/count", None).await.unwrap());
  }
  wait_until_drained(&queue, StdDuration::from_secs(10)).await;

  assert_eq!(counter.load(Ordering::SeqCst), 150);
  let remaining: Vec<_> = queue
    .list_jobs(Some(JobStatus::Completed))
    .await
    .unwrap()
    .into_iter()
    .map(|job| job.id)
    .collect();
  assert_eq!(remaining, ids[50..].to_vec(), "the 100 most recent jobs remain");
  assert_eq!(queue.metrics_snapshot().jobs_pruned, 50);

  // Nothing new finished, so a manual prune is a no-op.
  assert_eq!(queue.prune(100).await.unwrap(), 0);
  assert_eq!(queue.prune(40).await.unwrap(), 60);
  assert_eq!(
    queue.list_jobs(Some(JobStatus::Completed)).await.unwrap().len(),
    40
  );
  queue.shutdown_graceful(Some(WAIT)).await.unwrap();
}

#[tokio::test]
async fn test_dispatcher_state_reports_in_flight_job() {
  setup_tracing();
  let mut registry = JobRegistry::new();
  register_counter(
    &mut registry,
    "jobs/slow",
    Arc::new(AtomicUsize::new(0)),
    StdDuration::from_millis(300),
  );

  let queue = JobQueue::builder()
    .shared_store(memory_store())
    .registry(registry)
    .build()
    .await
    .unwrap();

  assert_eq!(queue.dispatcher_state().await.unwrap(), DispatcherState::Idle);
  let id = queue.enqueue("jobs/slow", None).await.unwrap();

  let busy = wait_until(WAIT, || {
    let queue = queue.clone();
    async move { queue.dispatcher_state().await.unwrap() == DispatcherState::Busy(id) }
  })
  .await;
  assert!(busy, "dispatcher should report the running job");
  assert_eq!(
    queue.get_job(id).await.unwrap().unwrap().status,
    JobStatus::InProgress
  );

  wait_for_status(&queue, id, JobStatus::Completed, WAIT).await;
  let idle = wait_until(WAIT, || {
    let queue = queue.clone();
    async move { queue.dispatcher_state().await.unwrap() == DispatcherState::Idle }
  })
  .await;
  assert!(idle);
  queue.shutdown_graceful(Some(WAIT)).await.unwrap();
}

#[tokio::test]
async fn test_pending_rows_drain_on_startup() {
  setup_tracing();
  let store = memory_store();
  store.initialize().await.unwrap();
  let first = store.enqueue("jobs/count", None).await.unwrap();
  let second = store.enqueue("jobs/count", None).await.unwrap();

  let counter = Arc::new(AtomicUsize::new(0));
  let mut registry = JobRegistry::new();
  register_counter(&mut registry, "jobs/count", counter.clone(), StdDuration::ZERO);

  // No enqueue after build: the dispatcher picks the backlog up by itself.
  let queue = JobQueue::builder()
    .shared_store(store)
    .registry(registry)
    .build()
    .await
    .unwrap();

  wait_for_status(&queue, first, JobStatus::Completed, WAIT).await;
  wait_for_status(&queue, second, JobStatus::Completed, WAIT).await;
  assert_eq!(counter.load(Ordering::SeqCst), 2);
  queue.shutdown_graceful(Some(WAIT)).await.unwrap();
}
