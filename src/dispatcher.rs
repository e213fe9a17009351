use crate::command::{DispatcherCommand, DispatcherState, ShutdownMode, WorkerReply, WorkerRequest};
use crate::error::StoreError;
use crate::job::JobId;
use crate::metrics::QueueMetrics;
use crate::store::QueueStore;

use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

/// Error recorded on rows that were `in_progress` when a dispatcher started.
pub const INTERRUPTED_MESSAGE: &str = "interrupted: dispatcher restarted before the job reported back";

/// Error recorded when the worker can no longer accept requests.
const WORKER_UNAVAILABLE_MESSAGE: &str = "worker unavailable";

/// The single task that moves queued jobs through their lifecycle.
///
/// It is the only writer of status transitions and never has more than one
/// job in flight: a job is dispatched only from [`DispatcherState::Idle`], and
/// every worker reply returns the dispatcher to `Idle` before the next row is
/// pulled.
///
/// A reply always clears busy. If the store refuses every attempt to record the
/// outcome, that row stays `in_progress` while the next one runs, until the
/// next startup releases it.
pub(crate) struct Dispatcher {
  store: Arc<dyn QueueStore>,
  metrics: QueueMetrics,
  max_retained: Option<usize>,
  cmd_rx: mpsc::Receiver<DispatcherCommand>,
  shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  request_tx: mpsc::Sender<WorkerRequest>,
  reply_rx: mpsc::Receiver<WorkerReply>,
  state: DispatcherState,
  shutting_down: Option<ShutdownMode>,
  commands_open: bool,
}

impl Dispatcher {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    store: Arc<dyn QueueStore>,
    metrics: QueueMetrics,
    max_retained: Option<usize>,
    cmd_rx: mpsc::Receiver<DispatcherCommand>,
    shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
    request_tx: mpsc::Sender<WorkerRequest>,
    reply_rx: mpsc::Receiver<WorkerReply>,
  ) -> Self {
    Self {
      store,
      metrics,
      max_retained,
      cmd_rx,
      shutdown_rx,
      request_tx,
      reply_rx,
      state: DispatcherState::Idle,
      shutting_down: None,
      commands_open: true,
    }
  }

  /// Releases rows left `in_progress` by a previous process and applies the
  /// retention cap. Runs once before the dispatcher task is spawned.
  ///
  /// Recovered rows are marked `errored`, not re-run: nothing is known about
  /// how far the interrupted job got.
  pub async fn prepare_store(
    store: &dyn QueueStore,
    metrics: &QueueMetrics,
    max_retained: Option<usize>,
  ) -> Result<(), StoreError> {
    store.initialize().await?;

    let recovered = store.fail_in_progress(INTERRUPTED_MESSAGE).await?;
    if recovered > 0 {
      metrics
        .jobs_recovered
        .fetch_add(recovered, AtomicOrdering::Relaxed);
      warn!(
        recovered,
        status = "errored",
        error = INTERRUPTED_MESSAGE,
        "Recovered jobs left in progress by a previous run."
      );
    }

    if let Some(max_retained) = max_retained {
      let deleted = store.prune_completed(max_retained).await?;
      record_prune(metrics, deleted, max_retained);
    }
    Ok(())
  }

  /// Runs the event loop until shutdown.
  pub async fn run(mut self) {
    info!(max_retained = ?self.max_retained, "Dispatcher started.");

    // Rows left pending by a previous run are drained without waiting for an enqueue.
    self.try_dispatch_next().await;

    loop {
      if self.shutting_down == Some(ShutdownMode::Graceful) && self.state == DispatcherState::Idle {
        info!("Graceful shutdown: no job in flight. Dispatcher exiting.");
        break;
      }

      tokio::select! {
          biased;

          Ok(()) = self.shutdown_rx.changed() => {
              let mode = *self.shutdown_rx.borrow();
              if let Some(mode) = mode {
                  if self.shutting_down != Some(mode) {
                      info!(?mode, state = ?self.state, "Dispatcher received shutdown signal.");
                      self.shutting_down = Some(mode);
                  }
                  if mode == ShutdownMode::Force {
                      if let DispatcherState::Busy(id) = self.state {
                          warn!(job_id = %id, "Forced shutdown with a job in flight; it stays in_progress until the next startup.");
                      }
                      break;
                  }
              }
          }

          maybe_reply = self.reply_rx.recv() => {
              match maybe_reply {
                  Some(reply) => self.handle_reply(reply).await,
                  None => {
                      error!("Worker reply channel closed unexpectedly. Dispatcher exiting.");
                      if let DispatcherState::Busy(id) = self.state {
                          self.record_errored(id, WORKER_UNAVAILABLE_MESSAGE).await;
                          self.state = DispatcherState::Idle;
                      }
                      break;
                  }
              }
          }

          maybe_cmd = self.cmd_rx.recv(), if self.commands_open => {
              match maybe_cmd {
                  Some(cmd) => self.handle_command(cmd).await,
                  None => {
                      self.commands_open = false;
                      if self.shutting_down.is_none() {
                          warn!("Command channel closed unexpectedly. Initiating graceful shutdown.");
                          self.shutting_down = Some(ShutdownMode::Graceful);
                      }
                  }
              }
          }
      }
    }

    info!("Dispatcher task shutting down.");
  }

  async fn handle_command(&mut self, cmd: DispatcherCommand) {
    match cmd {
      DispatcherCommand::Wake => {
        trace!("Wake received.");
        self.try_dispatch_next().await;
      }
      DispatcherCommand::GetState { responder } => {
        let _ = responder.send(self.state);
      }
      DispatcherCommand::Prune {
        max_retained,
        responder,
      } => {
        let result = self.prune(max_retained).await;
        let _ = responder.send(result);
      }
    }
  }

  /// Pulls the oldest pending row and hands it to the worker, if idle.
  async fn try_dispatch_next(&mut self) {
    // The watch value is checked directly: the worker may already have seen
    // the signal and closed its request channel.
    if self.state != DispatcherState::Idle
      || self.shutting_down.is_some()
      || self.shutdown_rx.borrow().is_some()
    {
      return;
    }

    loop {
      let job = match self.store.next_pending().await {
        Ok(Some(job)) => job,
        Ok(None) => {
          trace!("No pending jobs.");
          return;
        }
        Err(StoreError::CorruptPayload { id, source }) => {
          let message = format!("corrupt payload: {source}");
          error!(job_id = %id, error = %message, "Pending job has an unreadable payload.");
          if !self.record_errored(id, &message).await {
            // The row is still pending; fetching again would hit it again.
            return;
          }
          continue;
        }
        Err(StoreError::UnreadableRow { raw_id, reason }) => {
          let message = format!("unreadable row: {reason}");
          error!(raw_id = %raw_id, error = %message, "Pending job row could not be decoded.");
          if !self.record_unreadable(&raw_id, &message).await {
            return;
          }
          continue;
        }
        Err(e) => {
          self.metrics.store_errors.fetch_add(1, AtomicOrdering::Relaxed);
          error!(error = %e, "Failed to fetch the next pending job.");
          return;
        }
      };

      if let Err(e) = self.store.mark_in_progress(job.id).await {
        self.metrics.store_errors.fetch_add(1, AtomicOrdering::Relaxed);
        error!(job_id = %job.id, error = %e, "Failed to mark job in progress; not dispatching.");
        return;
      }

      self.state = DispatcherState::Busy(job.id);
      self
        .metrics
        .jobs_dispatched
        .fetch_add(1, AtomicOrdering::Relaxed);
      info!(
          job_id = %job.id,
          locator = %job.locator,
          status = "in_progress",
          "Dispatching job."
      );

      let id = job.id;
      let request = WorkerRequest {
        id,
        locator: job.locator,
        payload: job.payload,
      };
      if self.request_tx.send(request).await.is_err() {
        error!(job_id = %id, "Worker channel closed; job cannot run.");
        self.record_errored(id, WORKER_UNAVAILABLE_MESSAGE).await;
        self.state = DispatcherState::Idle;
      }
      return;
    }
  }

  /// Records a worker outcome, clears the busy state and moves on to the next row.
  async fn handle_reply(&mut self, reply: WorkerReply) {
    let id = reply.id();
    match self.state {
      DispatcherState::Busy(current) if current == id => {}
      DispatcherState::Busy(current) => {
        warn!(job_id = %id, in_flight = %current, "Reply does not match the in-flight job.");
      }
      DispatcherState::Idle => {
        warn!(job_id = %id, "Reply received while idle.");
      }
    }

    match reply {
      WorkerReply::Success { id, result } => {
        match self.store.mark_completed(id).await {
          Ok(()) => {
            self
              .metrics
              .jobs_completed
              .fetch_add(1, AtomicOrdering::Relaxed);
            info!(job_id = %id, status = "completed", %result, "Job completed.");
          }
          Err(e) => {
            self.metrics.store_errors.fetch_add(1, AtomicOrdering::Relaxed);
            error!(job_id = %id, error = %e, "Failed to record job completion.");
            // Leave the row terminal rather than in_progress next to the next job.
            self
              .record_errored(id, &format!("job completed but the result could not be recorded: {e}"))
              .await;
          }
        }
      }
      WorkerReply::Error { id, error } => {
        error!(job_id = %id, %error, "Job failed.");
        self.record_errored(id, &error).await;
      }
    }

    // Any reply clears busy, even if recording it failed.
    self.state = DispatcherState::Idle;

    if let Some(max_retained) = self.max_retained {
      if let Err(e) = self.prune(max_retained).await {
        error!(error = %e, max_retained, "Retention pruning failed.");
      }
    }

    self.try_dispatch_next().await;
  }

  /// Marks `id` errored. Returns whether the store accepted the transition.
  async fn record_errored(&self, id: JobId, message: &str) -> bool {
    match self.store.mark_errored(id, message).await {
      Ok(()) => {
        self.metrics.jobs_errored.fetch_add(1, AtomicOrdering::Relaxed);
        debug!(job_id = %id, status = "errored", error = message, "Job marked errored.");
        true
      }
      Err(e) => {
        self.metrics.store_errors.fetch_add(1, AtomicOrdering::Relaxed);
        error!(job_id = %id, error = %e, "Failed to mark job errored.");
        false
      }
    }
  }

  /// Same as [`record_errored`](Self::record_errored) for a row whose id did not decode.
  async fn record_unreadable(&self, raw_id: &str, message: &str) -> bool {
    match self.store.mark_errored_raw(raw_id, message).await {
      Ok(()) => {
        self.metrics.jobs_errored.fetch_add(1, AtomicOrdering::Relaxed);
        debug!(raw_id, status = "errored", error = message, "Unreadable row marked errored.");
        true
      }
      Err(e) => {
        self.metrics.store_errors.fetch_add(1, AtomicOrdering::Relaxed);
        error!(raw_id, error = %e, "Failed to mark unreadable row errored.");
        false
      }
    }
  }

  async fn prune(&self, max_retained: usize) -> Result<usize, StoreError> {
    match self.store.prune_completed(max_retained).await {
      Ok(deleted) => {
        record_prune(&self.metrics, deleted, max_retained);
        Ok(deleted)
      }
      Err(e) => {
        self.metrics.store_errors.fetch_add(1, AtomicOrdering::Relaxed);
        Err(e)
      }
    }
  }
}

fn record_prune(metrics: &QueueMetrics, deleted: usize, max_retained: usize) {
  if deleted > 0 {
    metrics.jobs_pruned.fetch_add(deleted, AtomicOrdering::Relaxed);
    info!(deleted, max_retained, "Pruned terminal jobs beyond the retention cap.");
  } else {
    trace!(max_retained, "Nothing to prune.");
  }
}
