use crate::command::{ShutdownMode, WorkerReply, WorkerRequest};
use crate::metrics::ExecutionMetrics;
use crate::registry::JobRegistry;

#[cfg(feature = "job_context")]
use crate::job::context::{JobContext, CURRENT_JOB_CONTEXT};

use std::any::Any;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn, Instrument};

/// The isolated execution context owned by a coordinator.
///
/// A worker receives [`WorkerRequest`]s, resolves each locator through the
/// registry and runs the job on its own Tokio task, so a panicking job is
/// reported as a failure instead of unwinding into the coordinator. Every
/// request gets exactly one [`WorkerReply`] unless the worker is force-stopped.
///
/// The worker does not serialize requests itself: the queue dispatcher never
/// has more than one request outstanding, while the scheduler relies on runs
/// proceeding concurrently.
pub(crate) struct Worker {
  name: &'static str,
  registry: Arc<JobRegistry>,
  metrics: ExecutionMetrics,
  job_timeout: Option<Duration>,
  shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  request_rx: mpsc::Receiver<WorkerRequest>,
  reply_tx: mpsc::Sender<WorkerReply>,
}

impl Worker {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    name: &'static str,
    registry: Arc<JobRegistry>,
    metrics: ExecutionMetrics,
    job_timeout: Option<Duration>,
    shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
    request_rx: mpsc::Receiver<WorkerRequest>,
    reply_tx: mpsc::Sender<WorkerReply>,
  ) -> Self {
    Self {
      name,
      registry,
      metrics,
      job_timeout,
      shutdown_rx,
      request_rx,
      reply_tx,
    }
  }

  /// Runs the main loop until shutdown, or until the coordinator drops its
  /// request sender and all in-flight jobs have reported back.
  pub async fn run(mut self) {
    info!(worker = self.name, "Worker started. Waiting for jobs...");

    let mut in_flight: JoinSet<WorkerReply> = JoinSet::new();
    let mut accepting = true;
    let mut watching_shutdown = true;

    loop {
      if !accepting && in_flight.is_empty() {
        break;
      }

      tokio::select! {
          biased;

          changed = self.shutdown_rx.changed(), if watching_shutdown => {
              if changed.is_err() {
                  // Handle dropped without an explicit shutdown; the request
                  // channel closing will end the loop.
                  watching_shutdown = false;
                  continue;
              }
              match *self.shutdown_rx.borrow() {
                  Some(ShutdownMode::Force) => {
                      if !in_flight.is_empty() {
                          warn!(worker = self.name, in_flight = in_flight.len(), "Forced shutdown, aborting running jobs.");
                      }
                      in_flight.abort_all();
                      break;
                  }
                  Some(ShutdownMode::Graceful) => {
                      info!(worker = self.name, in_flight = in_flight.len(), "Worker received graceful shutdown signal.");
                      // Requests already handed over still run; recv yields None once they are drained.
                      self.request_rx.close();
                  }
                  None => {}
              }
          }

          Some(joined) = in_flight.join_next() => {
              self.send_reply(joined).await;
          }

          maybe_request = self.request_rx.recv(), if accepting => {
              match maybe_request {
                  Some(request) => self.start(&mut in_flight, request),
                  None => {
                      debug!(worker = self.name, "Request channel closed, draining in-flight jobs.");
                      accepting = false;
                  }
              }
          }
      }
    }

    info!(worker = self.name, "Worker task shutting down.");
  }

  fn start(&self, in_flight: &mut JoinSet<WorkerReply>, request: WorkerRequest) {
    let span = tracing::info_span!(
      "job_exec",
      worker = self.name,
      job_id = %request.id,
      locator = request.locator.as_str()
    );
    debug!(worker = self.name, job_id = %request.id, "Received job request.");
    in_flight.spawn(
      execute(
        self.registry.clone(),
        self.metrics.clone(),
        self.job_timeout,
        request,
      )
      .instrument(span),
    );
  }

  async fn send_reply(&self, joined: Result<WorkerReply, JoinError>) {
    let reply = match joined {
      Ok(reply) => reply,
      Err(e) => {
        // Only reachable if the execution wrapper itself was aborted.
        error!(worker = self.name, error = %e, "Job execution task ended without a reply.");
        return;
      }
    };
    let id = reply.id();
    if self.reply_tx.send(reply).await.is_err() {
      warn!(
          worker = self.name,
          job_id = %id,
          "Failed to send job reply to coordinator (coordinator likely shut down)."
      );
    }
  }
}

/// Aborts the wrapped task when dropped, so an aborted or timed-out
/// execution never leaves the job running in the background.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
  fn drop(&mut self) {
    self.0.abort();
  }
}

/// Resolves, runs and times one job, producing the reply for the coordinator.
async fn execute(
  registry: Arc<JobRegistry>,
  metrics: ExecutionMetrics,
  job_timeout: Option<Duration>,
  request: WorkerRequest,
) -> WorkerReply {
  let WorkerRequest {
    id,
    locator,
    payload,
  } = request;

  let job_fn = match registry.resolve(&locator) {
    Ok(job_fn) => job_fn,
    Err(e) => {
      warn!(error = %e, "Job could not be loaded.");
      return WorkerReply::Error {
        id,
        error: e.to_string(),
      };
    }
  };

  info!("Starting job execution.");
  let start = Instant::now();

  // Calling the job function happens inside the spawned task too, so a
  // panic before the first await is caught like any other.
  let job = async move { job_fn(payload).await };
  #[cfg(feature = "job_context")]
  let job = CURRENT_JOB_CONTEXT.scope(
    JobContext {
      job_id: id,
      locator: locator.clone(),
    },
    job,
  );
  let mut task = AbortOnDrop(tokio::spawn(job));

  let joined = match job_timeout {
    Some(limit) => match tokio::time::timeout(limit, &mut task.0).await {
      Ok(joined) => joined,
      Err(_) => {
        drop(task);
        metrics.execution_duration.record(start.elapsed());
        metrics.jobs_timed_out.fetch_add(1, AtomicOrdering::Relaxed);
        error!(timeout_ms = limit.as_millis(), "Job timed out and was aborted.");
        return WorkerReply::Error {
          id,
          error: format!("job timed out after {limit:?}"),
        };
      }
    },
    None => (&mut task.0).await,
  };

  let duration = start.elapsed();
  metrics.execution_duration.record(duration);

  let reply = match joined {
    Ok(Ok(result)) => WorkerReply::Success { id, result },
    Ok(Err(e)) => WorkerReply::Error {
      id,
      error: e.to_string(),
    },
    Err(join_error) if join_error.is_panic() => {
      metrics.jobs_panicked.fetch_add(1, AtomicOrdering::Relaxed);
      let message = panic_message(join_error.into_panic());
      error!(panic = %message, "Job function panicked!");
      WorkerReply::Error {
        id,
        error: format!("job panicked: {message}"),
      }
    }
    Err(_) => {
      warn!("Job task was cancelled during execution.");
      WorkerReply::Error {
        id,
        error: "job task was cancelled".to_string(),
      }
    }
  };

  info!(
    duration_ms = duration.as_millis(),
    outcome = if reply.is_success() { "Success" } else { "Fail" },
    "Finished job execution."
  );
  reply
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "unknown panic payload".to_string()
  }
}
