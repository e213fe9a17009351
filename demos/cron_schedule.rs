//! demos/cron_schedule.rs
//!
//! Runs two cron entries against the local clock for a few minutes. The slow
//! entry takes longer than a minute, which does not delay the fast one.

use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{error, info};
use turnqueue::{job_fn, JobRegistry, Scheduler};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  // --- Setup Tracing ---
  let filter = tracing_subscriber::EnvFilter::try_new("warn,turnqueue=info,cron_schedule=trace")
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  // --- Register Jobs ---
  let heartbeats = Arc::new(AtomicUsize::new(0));
  let heartbeats_clone = heartbeats.clone();
  let mut registry = JobRegistry::new();
  registry.register(
    "ops/heartbeat",
    job_fn! {
      |_payload|
      {
        let heartbeats = heartbeats_clone.clone();
      }
      {
        let n = heartbeats.fetch_add(1, Ordering::Relaxed) + 1;
        info!("*** Heartbeat #{} ***", n);
        #[cfg(feature = "job_context")]
        {
          use turnqueue::job_context;
          let ctx = job_context!();
          info!("  Context: run {}, locator {}", ctx.job_id, ctx.locator);
        }
        Ok(json!(n))
      }
    },
  );
  registry.register(
    "reports/rollup",
    job_fn! {
      |payload|
      {
        info!("Rollup started with {:?}", payload);
        tokio::time::sleep(StdDuration::from_secs(90)).await;
        info!("Rollup finished.");
        Ok(json!("rolled up"))
      }
    },
  );

  // --- Build Scheduler ---
  info!("Building scheduler...");
  let scheduler = Scheduler::builder()
    .entry("* * * * *", "ops/heartbeat")
    .entry_with_payload("*/2 * * * *", "reports/rollup", json!({ "window": "2m" }))
    .registry(registry)
    .build()?;
  info!("Scheduler built with {} entries.", scheduler.entries().len());

  // --- Let it Tick ---
  tokio::time::sleep(StdDuration::from_secs(5 * 60)).await;
  info!(
    "Heartbeats: {}, metrics: {:#?}",
    heartbeats.load(Ordering::Relaxed),
    scheduler.metrics_snapshot()
  );

  // --- Shutdown ---
  // A rollup may still be sleeping; don't wait for it.
  info!("Requesting forced shutdown...");
  match scheduler.shutdown_force(Some(StdDuration::from_secs(5))).await {
    Ok(()) => info!("Scheduler shut down successfully."),
    Err(e) => error!("Shutdown failed: {}", e),
  }

  Ok(())
}
