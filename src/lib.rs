//! TurnQueue: A Persistent Single-Flight Job Queue with a Cron Scheduler
//!
//! Provides two independent background execution facilities for a long-running
//! Tokio service:
//!
//! - A [`JobQueue`] that persists jobs in a SQLite table and executes them one
//!   at a time in FIFO order, recording each outcome on the row.
//! - A [`Scheduler`] that evaluates five-field cron expressions once a minute
//!   and fires matching jobs without blocking on earlier runs.
//!
//! # Features
//!
//! - Jobs are addressed by a string *locator* resolved through a [`JobRegistry`]
//!   at execution time, with an optional JSON payload.
//! - Durable queue rows (`pending` → `in_progress` → `completed` | `errored`)
//!   in a configurable SQLite table ([`SqliteQueueStore`]), or in memory
//!   ([`MemoryQueueStore`]).
//! - Strict single-flight dispatch: at most one queued job runs at a time.
//! - Retention cap on finished rows (`max_retained`), applied after every job.
//! - Startup recovery of rows left `in_progress` by a crashed process.
//! - Jobs run on their own Tokio task, so panics become recorded failures.
//! - Optional per-job timeout.
//! - Built-in metrics (snapshots via [`QueueMetricsSnapshot`] and
//!   [`SchedulerMetricsSnapshot`]).
//! - Graceful and forced shutdown procedures (with optional timeout).
//! - Optional task-local job context (`JobContext`) for job functions (requires `job_context` feature).
//!
//! # Usage
//!
//! ```no_run
//! use turnqueue::{JobError, JobQueue, JobRegistry, Scheduler, SqliteQueueStore};
//! use serde::Deserialize;
//! use serde_json::json;
//! use std::time::Duration;
//!
//! #[derive(Deserialize)]
//! struct Resize {
//!     image: String,
//!     width: u32,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // tracing_subscriber::fmt().with_env_filter("warn,turnqueue=info").init();
//!
//!     let mut registry = JobRegistry::new();
//!     registry.register_typed("images/resize", |job: Resize| async move {
//!         if job.width == 0 {
//!             return Err(JobError::failed("width must be positive"));
//!         }
//!         Ok(json!({ "image": job.image, "width": job.width }))
//!     });
//!
//!     let queue = JobQueue::builder()
//!         .store(SqliteQueueStore::open("app.db", "queued_jobs")?)
//!         .registry(registry)
//!         .max_retained(1_000)
//!         .build()
//!         .await?;
//!
//!     let id = queue
//!         .enqueue("images/resize", Some(json!({ "image": "cat.png", "width": 320 })))
//!         .await?;
//!     println!("Enqueued {id}");
//!
//!     let mut cron_registry = JobRegistry::new();
//!     cron_registry.register("reports/hourly", |_payload| async { Ok(json!(null)) });
//!     let scheduler = Scheduler::builder()
//!         .entry("0 * * * *", "reports/hourly")
//!         .registry(cron_registry)
//!         .build()?;
//!
//!     tokio::time::sleep(Duration::from_secs(5)).await;
//!     println!("Queue metrics: {:#?}", queue.metrics_snapshot());
//!
//!     scheduler.shutdown(Some(Duration::from_secs(10))).await?;
//!     queue.shutdown_graceful(Some(Duration::from_secs(10))).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! Use the [`QueueBuilder`] to configure a queue:
//! - `store` (required): where rows live. [`SqliteQueueStore`] validates its table name.
//! - `registry`: the locators the worker can run.
//! - `max_retained`: keep at most this many finished rows.
//! - `job_timeout`: abort jobs that run longer. Without it a hanging job
//!   keeps the queue busy forever.
//! - `command_buffer_size`: capacity of the handle → dispatcher channel.
//!
//! Use the [`SchedulerBuilder`] to configure a scheduler:
//! - `entry` / `entry_with_payload` / `entries`: the static schedule.
//! - `clock`: evaluate expressions in local time (default) or UTC.
//! - `registry`, `job_timeout`: as for the queue.
//!
//! # Job Lifecycle & State
//!
//! - `enqueue` writes a `pending` row and wakes the dispatcher; it never waits
//!   for the job to run.
//! - When idle, the dispatcher takes the oldest `pending` row, marks it
//!   `in_progress` and hands it to its worker.
//! - The worker's reply marks the row `completed` or `errored` (with the error
//!   message), returns the dispatcher to idle and starts the next row.
//! - Unknown locators, payloads of the wrong shape, `Err` results, panics and
//!   timeouts all end as `errored`. Nothing is retried.
//!
//! # Observability
//!
//! - Metrics snapshots via [`JobQueue::metrics_snapshot`] and [`Scheduler::metrics_snapshot`].
//! - Row queries via [`JobQueue::get_job`] and [`JobQueue::list_jobs`].
//! - Every transition is logged through the `tracing` crate with `job_id`,
//!   `locator`, `status` and `error` fields.

// --- Feature-gated Documentation ---

// This empty module attaches the documentation block below only when
// the `job_context` feature is enabled during doc generation.
#[cfg(all(doc, feature = "job_context"))]
pub mod job_context_docs {
    //! # Accessing Job Context (`job_context` feature)
    //!
    //! When the `job_context` feature is enabled, job functions can read which
    //! job they are running as through Tokio's task-local context.
    //!
    //! 1.  **`try_get_current_job_context() -> Option<JobContext>`**: Returns
    //!     `None` if called outside a job started by a worker.
    //! 2.  **`job_context!() -> JobContext`**: **Panics** outside a job.
    //!
    //! ```no_run
    //! # #[cfg(feature = "job_context")] {
    //! use turnqueue::{job_context, try_get_current_job_context, JobRegistry};
    //! use serde_json::json;
    //!
    //! let mut registry = JobRegistry::new();
    //! registry.register("audit", |_payload| async {
    //!     if let Some(ctx) = try_get_current_job_context() {
    //!         println!("Running {} as {}", ctx.locator, ctx.job_id);
    //!     }
    //!     let required = job_context!();
    //!     Ok(json!({ "job_id": required.job_id }))
    //! });
    //! # }
    //! ```
    //!
    //! For queued jobs `job_id` is the row id; for scheduled runs it is a
    //! fresh id generated per fire.
}

// Declare modules within the crate
pub mod command;
pub mod cron;
mod dispatcher;
pub mod error;
pub mod job;
mod macros;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod store;
mod worker;

// --- Public Re-exports ---

// Queue and scheduler handles
pub use command::DispatcherState;
pub use dispatcher::INTERRUPTED_MESSAGE;
pub use queue::{JobQueue, QueueBuilder};
pub use scheduler::{ScheduleClock, Scheduler, SchedulerBuilder};

// Error types
pub use error::{
  BuildError, CronError, EnqueueError, JobError, QueryError, ShutdownError, StoreError,
};

// Job related types
pub use cron::CronExpr;
pub use job::{BoxedJobFn, JobId, JobResult, JobStatus, Payload, QueuedJob, ScheduleEntry};
pub use registry::JobRegistry;
pub use store::{MemoryQueueStore, QueueStore, SqliteQueueStore};

// Conditionally export context items
#[cfg(feature = "job_context")]
pub use job::context::{try_get_current_job_context, JobContext};

// Metrics related types
pub use metrics::{QueueMetricsSnapshot, SchedulerMetricsSnapshot};
