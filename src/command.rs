use crate::error::StoreError;
use crate::job::{JobId, Payload};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

/// Commands sent from the `JobQueue` handle to the dispatcher task.
///
/// Requests that need an answer carry a `oneshot::Sender` for the reply.
#[derive(Debug)]
pub(crate) enum DispatcherCommand {
  /// A job was enqueued; dispatch it if the worker is idle.
  Wake,
  /// Report whether a job is currently in flight.
  GetState {
    responder: oneshot::Sender<DispatcherState>,
  },
  /// Run retention pruning inside the dispatcher's control flow.
  Prune {
    max_retained: usize,
    responder: oneshot::Sender<Result<usize, StoreError>>,
  },
}

/// The dispatcher's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
  /// No job in flight; the next trigger pulls the oldest pending row.
  Idle,
  /// The given job has been handed to the worker and has not replied yet.
  Busy(JobId),
}

/// Represents the requested shutdown mode. Sent via a `watch` channel.
/// `None` indicates normal operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Stop dispatching, let the in-flight job finish and record its result.
  Graceful,
  /// Stop immediately, aborting any in-flight job.
  Force,
}

/// Message sent from a coordinator (dispatcher or scheduler) to its worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
  pub id: JobId,
  pub locator: String,
  pub payload: Option<Payload>,
}

/// Message sent from a worker back to its coordinator once a job has finished.
///
/// Serialized with a `status` tag of `"success"` or `"error"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerReply {
  Success { id: JobId, result: Value },
  Error { id: JobId, error: String },
}

impl WorkerReply {
  pub fn id(&self) -> JobId {
    match self {
      WorkerReply::Success { id, .. } | WorkerReply::Error { id, .. } => *id,
    }
  }

  pub fn is_success(&self) -> bool {
    matches!(self, WorkerReply::Success { .. })
  }
}
