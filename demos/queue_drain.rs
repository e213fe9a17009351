//! demos/queue_drain.rs
//!
//! Enqueues a burst of jobs into a SQLite-backed queue and watches them drain
//! one at a time, oldest first. Run it twice: the database file keeps the
//! history (capped by `max_retained`) between runs.

use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{error, info};
use turnqueue::{job_fn, DispatcherState, JobError, JobQueue, JobRegistry, JobStatus, SqliteQueueStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  // --- Setup Tracing ---
  let filter = tracing_subscriber::EnvFilter::try_new("warn,turnqueue=info,queue_drain=trace")
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  // --- Register Jobs ---
  let sent = Arc::new(AtomicUsize::new(0));
  let sent_clone = sent.clone();
  let mut registry = JobRegistry::new();
  registry.register(
    "mail/send",
    job_fn! {
      |payload|
      {
        let sent = sent_clone.clone();
      }
      {
        let to = payload
          .as_ref()
          .and_then(|p| p.get("to"))
          .and_then(|to| to.as_str())
          .ok_or_else(|| JobError::failed("payload has no 'to' address"))?
          .to_string();
        tokio::time::sleep(StdDuration::from_millis(200)).await;
        let n = sent.fetch_add(1, Ordering::Relaxed) + 1;
        info!("*** Mail #{} sent to {} ***", n, to);
        Ok(json!({ "delivered": to }))
      }
    },
  );

  // --- Build Queue ---
  info!("Building queue...");
  let queue = JobQueue::builder()
    .store(SqliteQueueStore::open("queue_drain.db", "queued_jobs")?)
    .registry(registry)
    .max_retained(20)
    .build()
    .await?;
  info!("Queue built.");

  // --- Enqueue a Burst ---
  for i in 0..5 {
    let id = queue
      .enqueue("mail/send", Some(json!({ "to": format!("user{i}@example.com") })))
      .await?;
    info!("Enqueued job {}", id);
  }
  // Fails when it runs, not when it is enqueued.
  queue.enqueue("mail/send", Some(json!({}))).await?;

  // --- Wait for the Queue to Drain ---
  loop {
    let pending = queue.list_jobs(Some(JobStatus::Pending)).await?.len();
    let state = queue.dispatcher_state().await?;
    if pending == 0 && state == DispatcherState::Idle {
      break;
    }
    info!("Pending: {}, dispatcher: {:?}", pending, state);
    tokio::time::sleep(StdDuration::from_millis(250)).await;
  }

  for job in queue.list_jobs(None).await? {
    match job.status {
      JobStatus::Errored => error!(
        "{} {} errored: {}",
        job.id,
        job.locator,
        job.error.unwrap_or_default()
      ),
      status => info!("{} {} {}", job.id, job.locator, status),
    }
  }
  info!("Metrics: {:#?}", queue.metrics_snapshot());

  // --- Shutdown ---
  info!("Requesting graceful shutdown...");
  match queue.shutdown_graceful(Some(StdDuration::from_secs(5))).await {
    Ok(()) => info!("Queue shut down successfully."),
    Err(e) => error!("Shutdown failed: {}", e),
  }

  Ok(())
}
