#[cfg(feature = "job_context")]
pub mod context;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::cron::CronExpr;
use crate::error::JobError;

// --- Public Type Aliases ---

/// Identifier of a queued job (or of a single scheduled run).
/// Uses UUID v7, so ids sort by generation time.
pub type JobId = Uuid;

/// Structured job input: maps, arrays, strings, numbers, booleans or null.
pub type Payload = Value;

/// What a job returns. The `Ok` value is reported back to the coordinator
/// for observability only.
pub type JobResult = Result<Value, JobError>;

/// The function type registered for a locator.
///
/// Called once per execution with the decoded payload (if any). The returned
/// future runs on its own Tokio task inside the worker, so a panic is caught
/// and reported as a job failure instead of unwinding into the coordinator.
pub type BoxedJobFn = Box<
  dyn Fn(Option<Payload>) -> Pin<Box<dyn Future<Output = JobResult> + Send + 'static>>
    + Send
    + Sync
    + 'static,
>;

/// Generates a new time-ordered job id.
pub(crate) fn new_job_id() -> JobId {
  Uuid::now_v7()
}

// --- Job Status ---

/// Lifecycle state of a queued job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
  /// Waiting to be picked up by the dispatcher.
  Pending,
  /// Handed to the worker; at most one row per queue is in this state.
  InProgress,
  /// The worker reported success.
  Completed,
  /// The worker reported failure (or the job could not be loaded).
  Errored,
}

impl JobStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      JobStatus::Pending => "pending",
      JobStatus::InProgress => "in_progress",
      JobStatus::Completed => "completed",
      JobStatus::Errored => "errored",
    }
  }

  /// `true` for `Completed` and `Errored`, the states retention pruning works on.
  pub fn is_terminal(&self) -> bool {
    matches!(self, JobStatus::Completed | JobStatus::Errored)
  }
}

impl fmt::Display for JobStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for JobStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "pending" => Ok(JobStatus::Pending),
      "in_progress" => Ok(JobStatus::InProgress),
      "completed" => Ok(JobStatus::Completed),
      "errored" => Ok(JobStatus::Errored),
      other => Err(format!("unknown job status: {other}")),
    }
  }
}

// --- Core Job Structures ---

/// A persisted unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
  /// Primary key, also the FIFO tiebreak when `queued_at` collides.
  pub id: JobId,
  /// Key resolved by the [`JobRegistry`](crate::registry::JobRegistry).
  pub locator: String,
  /// Decoded payload, `None` when the job was enqueued without one.
  pub payload: Option<Payload>,
  pub status: JobStatus,
  /// Failure message, only set once the job is `Errored`.
  pub error: Option<String>,
  pub queued_at: DateTime<Utc>,
}

/// A recurring job registered with the [`Scheduler`](crate::scheduler::Scheduler).
///
/// Entries live in memory for the scheduler's lifetime and are never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleEntry {
  pub cron: CronExpr,
  pub locator: String,
  /// Static payload handed to the job on every fire.
  pub payload: Option<Payload>,
}

impl ScheduleEntry {
  /// Parses `cron` and builds an entry without a payload.
  pub fn new(cron: &str, locator: &str) -> Result<Self, crate::error::CronError> {
    Ok(Self {
      cron: cron.parse()?,
      locator: locator.to_string(),
      payload: None,
    })
  }

  /// Attaches a payload passed to the job each time the entry fires.
  pub fn with_payload(mut self, payload: Payload) -> Self {
    self.payload = Some(payload);
    self
  }
}
