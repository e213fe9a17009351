use crate::job::JobId;

use thiserror::Error;

// --- Cron Errors ---

/// Errors produced while parsing a 5-field cron expression.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CronError {
  #[error("Cron expression must have 5 fields (minute hour day-of-month month day-of-week), found {0}")]
  FieldCount(usize),
  #[error("Invalid number '{value}' in {field} field")]
  InvalidNumber { field: &'static str, value: String },
  #[error("Value {value} is out of range for {field} field ({min}-{max})")]
  OutOfRange {
    field: &'static str,
    value: u32,
    min: u32,
    max: u32,
  },
  #[error("Range {start}-{end} in {field} field is reversed")]
  InvalidRange {
    field: &'static str,
    start: u32,
    end: u32,
  },
  #[error("Step in {field} field must be greater than zero")]
  ZeroStep { field: &'static str },
}

// --- Store Errors ---

/// Errors raised by a [`QueueStore`](crate::store::QueueStore) implementation.
#[derive(Error, Debug)]
pub enum StoreError {
  #[error("SQLite error: {0}")]
  Sqlite(#[from] rusqlite::Error),
  #[error("Payload serialization error: {0}")]
  Json(#[from] serde_json::Error),
  #[error("Stored payload of job {id} could not be decoded: {source}")]
  CorruptPayload {
    id: JobId,
    #[source]
    source: serde_json::Error,
  },
  /// A row whose columns could not be decoded. `raw_id` is the id text exactly
  /// as stored, which may not be a valid [`JobId`].
  #[error("Stored row '{raw_id}' could not be decoded: {reason}")]
  UnreadableRow { raw_id: String, reason: String },
  #[error("Job {0} not found in the queue table.")]
  JobNotFound(JobId),
  #[error("'{0}' is not a valid queue table name (use ASCII letters, digits and underscores).")]
  InvalidTable(String),
  #[error("Store task failed to complete: {0}")]
  TaskJoin(String),
}

// --- Build Errors ---

/// Errors that can occur while building a queue or scheduler.
#[derive(Error, Debug)]
pub enum BuildError {
  #[error("A queue store must be provided with `QueueBuilder::store`")]
  MissingStore,
  #[error("Queue store could not be prepared: {0}")]
  Store(#[from] StoreError),
  #[error("Schedule entry '{expression}' is not a valid cron expression: {source}")]
  InvalidCron {
    expression: String,
    #[source]
    source: CronError,
  },
}

// --- Enqueue Errors ---

/// Errors surfaced synchronously to the caller of `JobQueue::enqueue`.
/// When one of these is returned, no job row was created.
#[derive(Error, Debug)]
pub enum EnqueueError {
  #[error("Job could not be written to the queue store: {0}")]
  Store(#[from] StoreError),
  #[error("Job payload could not be serialized: {0}")]
  Serialize(#[source] serde_json::Error),
  #[error("Queue is shut down, job rejected.")]
  QueueShutdown,
}

// --- Job Errors ---

/// Failure of a single job execution, including failure to load it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
  #[error("No job registered for locator '{0}'")]
  UnknownLocator(String),
  #[error("Payload for '{locator}' has the wrong shape: {reason}")]
  InvalidPayload { locator: String, reason: String },
  #[error("{0}")]
  Failed(String),
}

impl JobError {
  /// Convenience constructor for job code reporting a failure.
  pub fn failed(message: impl Into<String>) -> Self {
    JobError::Failed(message.into())
  }
}

// --- Query Errors ---

/// Errors related to querying or commanding a running queue.
#[derive(Error, Debug)]
pub enum QueryError {
  #[error("Dispatcher command channel is closed (queue shut down or panicked).")]
  QueueShutdown,
  #[error("Dispatcher did not respond to the request.")]
  ResponseFailed,
  #[error("Store query failed: {0}")]
  Store(#[from] StoreError),
}

// --- Shutdown Errors ---

/// Errors related to the shutdown process of a queue or scheduler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
  #[error("Failed to send shutdown signal (already shut down or watch channel error).")]
  SignalFailed,
  #[error("Timed out waiting for coordinator and worker tasks to complete shutdown.")]
  Timeout,
  #[error("A worker or coordinator task panicked during the shutdown process.")]
  TaskPanic,
}
