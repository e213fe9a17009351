use crate::command::{DispatcherCommand, DispatcherState, ShutdownMode, WorkerReply, WorkerRequest};
use crate::dispatcher::Dispatcher;
use crate::error::{BuildError, EnqueueError, QueryError, ShutdownError};
use crate::job::{JobId, JobStatus, Payload, QueuedJob};
use crate::metrics::{QueueMetrics, QueueMetricsSnapshot};
use crate::registry::JobRegistry;
use crate::store::QueueStore;
use crate::worker::Worker;

use std::fmt;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Default bound of the handle → dispatcher command channel.
pub const DEFAULT_COMMAND_BUFFER: usize = 128;
/// The dispatcher never has more than one request outstanding.
const WORKER_CHANNEL_BOUND: usize = 1;

/// Builder for configuring and starting a [`JobQueue`].
///
/// # Example
///
/// ```no_run
/// use turnqueue::{JobQueue, JobRegistry, SqliteQueueStore};
/// use serde_json::json;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let mut registry = JobRegistry::new();
/// registry.register("mail/send", |_payload| async { Ok(json!("sent")) });
///
/// let queue = JobQueue::builder()
///     .store(SqliteQueueStore::open("jobs.db", "queued_jobs")?)
///     .registry(registry)
///     .max_retained(100)
///     .build()
///     .await?;
///
/// queue.enqueue("mail/send", Some(json!({ "to": "ops@example.com" }))).await?;
/// # Ok(())
/// # }
/// ```
pub struct QueueBuilder {
  store: Option<Arc<dyn QueueStore>>,
  registry: JobRegistry,
  max_retained: Option<usize>,
  job_timeout: Option<Duration>,
  command_buffer_size: usize,
}

impl Default for QueueBuilder {
  fn default() -> Self {
    Self {
      store: None,
      registry: JobRegistry::new(),
      max_retained: None,
      job_timeout: None,
      command_buffer_size: DEFAULT_COMMAND_BUFFER,
    }
  }
}

impl QueueBuilder {
  /// Creates a new builder with default settings.
  /// - `store`: Not set (required).
  /// - `registry`: Empty; every job fails as an unknown locator.
  /// - `max_retained`: Unbounded.
  /// - `job_timeout`: None.
  pub fn new() -> Self {
    Self::default()
  }

  /// Sets the store holding the queue table (required).
  pub fn store<S: QueueStore + 'static>(self, store: S) -> Self {
    self.shared_store(Arc::new(store))
  }

  /// Like [`store`](Self::store), for a store the caller keeps a handle to.
  pub fn shared_store(mut self, store: Arc<dyn QueueStore>) -> Self {
    self.store = Some(store);
    self
  }

  /// Sets the locator → function mapping used by the worker.
  pub fn registry(mut self, registry: JobRegistry) -> Self {
    self.registry = registry;
    self
  }

  /// Keeps at most `max` `completed`/`errored` rows, pruning the oldest after
  /// every finished job and once at startup.
  pub fn max_retained(mut self, max: usize) -> Self {
    self.max_retained = Some(max);
    self
  }

  /// Aborts a job that runs longer than `timeout` and records it as errored.
  ///
  /// Without a timeout, a job that never finishes keeps the queue busy forever.
  pub fn job_timeout(mut self, timeout: Duration) -> Self {
    self.job_timeout = Some(timeout);
    self
  }

  /// Sets the size of the internal buffer for commands (wakes, queries).
  pub fn command_buffer_size(mut self, size: usize) -> Self {
    self.command_buffer_size = size.max(1);
    self
  }

  /// Prepares the store and starts the queue.
  ///
  /// Creates the table if needed, marks rows left `in_progress` by a previous
  /// process as errored, applies the retention cap, then spawns the dispatcher
  /// and its worker. Pending rows from earlier runs start draining immediately.
  ///
  /// # Errors
  ///
  /// - [`BuildError::MissingStore`] if no store was configured.
  /// - [`BuildError::Store`] if preparing the store failed.
  pub async fn build(self) -> Result<JobQueue, BuildError> {
    let store = self.store.ok_or(BuildError::MissingStore)?;
    let metrics = QueueMetrics::new();

    Dispatcher::prepare_store(store.as_ref(), &metrics, self.max_retained).await?;

    if self.registry.locators().is_empty() {
      warn!("Queue built with an empty registry. Every job will fail.");
    }

    let (cmd_tx, cmd_rx) = mpsc::channel::<DispatcherCommand>(self.command_buffer_size);
    let (shutdown_tx, shutdown_rx) = watch::channel::<Option<ShutdownMode>>(None);
    let (request_tx, request_rx) = mpsc::channel::<WorkerRequest>(WORKER_CHANNEL_BOUND);
    let (reply_tx, reply_rx) = mpsc::channel::<WorkerReply>(WORKER_CHANNEL_BOUND);

    let worker = Worker::new(
      "queue",
      Arc::new(self.registry),
      metrics.execution.clone(),
      self.job_timeout,
      shutdown_rx.clone(),
      request_rx,
      reply_tx,
    );
    let worker_handle = tokio::spawn(worker.run());

    let dispatcher = Dispatcher::new(
      store.clone(),
      metrics.clone(),
      self.max_retained,
      cmd_rx,
      shutdown_rx,
      request_tx,
      reply_rx,
    );
    let dispatcher_handle = tokio::spawn(async move {
      dispatcher.run().await;
      info!("Dispatcher task finished.");
    });

    Ok(JobQueue {
      store,
      metrics,
      cmd_tx,
      shutdown_tx: Arc::new(shutdown_tx),
      dispatcher_handle: Arc::new(Mutex::new(Some(dispatcher_handle))),
      worker_handle: Arc::new(Mutex::new(Some(worker_handle))),
    })
  }
}

/// Handle to a running persistent job queue.
///
/// Jobs run one at a time, oldest first. Cloning the handle is cheap and all
/// clones talk to the same dispatcher.
#[derive(Clone)]
pub struct JobQueue {
  store: Arc<dyn QueueStore>,
  metrics: QueueMetrics,
  cmd_tx: mpsc::Sender<DispatcherCommand>,
  shutdown_tx: Arc<watch::Sender<Option<ShutdownMode>>>,
  dispatcher_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
  worker_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl fmt::Debug for JobQueue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JobQueue")
      .field("metrics", &self.metrics)
      .field("shutting_down", &*self.shutdown_tx.borrow())
      .finish_non_exhaustive()
  }
}

impl JobQueue {
  /// Returns a builder to configure and start a queue.
  pub fn builder() -> QueueBuilder {
    QueueBuilder::new()
  }

  /// Persists a `pending` job and wakes the dispatcher.
  ///
  /// Returns once the row is written; the job runs later, after every job
  /// enqueued before it.
  ///
  /// # Errors
  ///
  /// - [`EnqueueError::QueueShutdown`]: shutdown has been requested.
  /// - [`EnqueueError::Store`]: the row could not be written. No job exists.
  pub async fn enqueue(&self, locator: &str, payload: Option<Payload>) -> Result<JobId, EnqueueError> {
    if self.shutdown_tx.borrow().is_some() {
      return Err(EnqueueError::QueueShutdown);
    }

    let id = match self.store.enqueue(locator, payload).await {
      Ok(id) => id,
      Err(e) => {
        self
          .metrics
          .enqueue_failed
          .fetch_add(1, AtomicOrdering::Relaxed);
        error!(locator, error = %e, "Failed to enqueue job.");
        return Err(e.into());
      }
    };
    self
      .metrics
      .jobs_enqueued
      .fetch_add(1, AtomicOrdering::Relaxed);
    info!(job_id = %id, locator, status = "pending", "Job enqueued.");

    if self.cmd_tx.send(DispatcherCommand::Wake).await.is_err() {
      warn!(job_id = %id, "Dispatcher is not running; job stays pending until the next start.");
    }
    Ok(id)
  }

  /// Serializes `payload` to JSON and enqueues it.
  pub async fn enqueue_serialized<T: Serialize + ?Sized>(
    &self,
    locator: &str,
    payload: &T,
  ) -> Result<JobId, EnqueueError> {
    let value = serde_json::to_value(payload).map_err(EnqueueError::Serialize)?;
    self.enqueue(locator, Some(value)).await
  }

  /// Reads one job row.
  pub async fn get_job(&self, id: JobId) -> Result<Option<QueuedJob>, QueryError> {
    Ok(self.store.get(id).await?)
  }

  /// Lists rows in FIFO order, optionally only those in `status`.
  pub async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<QueuedJob>, QueryError> {
    Ok(self.store.list(status).await?)
  }

  /// Deletes the oldest terminal rows beyond `max_retained`, returning how
  /// many were removed. Runs inside the dispatcher, between jobs.
  ///
  /// # Errors
  ///
  /// - [`QueryError::QueueShutdown`]: Queue is not running.
  /// - [`QueryError::ResponseFailed`]: Dispatcher failed to respond.
  /// - [`QueryError::Store`]: The delete failed.
  pub async fn prune(&self, max_retained: usize) -> Result<usize, QueryError> {
    let (responder, response_rx) = oneshot::channel();
    let cmd = DispatcherCommand::Prune {
      max_retained,
      responder,
    };
    self
      .cmd_tx
      .send(cmd)
      .await
      .map_err(|_| QueryError::QueueShutdown)?;
    Ok(response_rx.await.map_err(|_| QueryError::ResponseFailed)??)
  }

  /// Reports whether a job is currently in flight.
  pub async fn dispatcher_state(&self) -> Result<DispatcherState, QueryError> {
    let (responder, response_rx) = oneshot::channel();
    self
      .cmd_tx
      .send(DispatcherCommand::GetState { responder })
      .await
      .map_err(|_| QueryError::QueueShutdown)?;
    response_rx.await.map_err(|_| QueryError::ResponseFailed)
  }

  pub fn metrics_snapshot(&self) -> QueueMetricsSnapshot {
    self.metrics.snapshot()
  }

  /// The store this queue reads and writes.
  pub fn store(&self) -> &Arc<dyn QueueStore> {
    &self.store
  }

  /// Stops dispatching, waits for the in-flight job (if any) to finish and
  /// records its result, then stops the worker.
  ///
  /// # Errors
  ///
  /// - [`ShutdownError::SignalFailed`]: The queue has already stopped.
  /// - [`ShutdownError::Timeout`]: Waiting for tasks exceeded the timeout.
  /// - [`ShutdownError::TaskPanic`]: The dispatcher or worker task panicked.
  pub async fn shutdown_graceful(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    info!("Initiating graceful queue shutdown...");
    self
      .shutdown_tx
      .send(Some(ShutdownMode::Graceful))
      .map_err(|_| ShutdownError::SignalFailed)?;
    self.await_shutdown(timeout).await
  }

  /// Stops immediately, aborting the in-flight job. Its row stays
  /// `in_progress` and is marked errored by the next [`QueueBuilder::build`].
  pub async fn shutdown_force(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    info!("Initiating forced queue shutdown...");
    self
      .shutdown_tx
      .send(Some(ShutdownMode::Force))
      .map_err(|_| ShutdownError::SignalFailed)?;
    self.await_shutdown(timeout).await
  }

  async fn await_shutdown(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    let mut tasks = Vec::with_capacity(2);
    if let Some(handle) = self.dispatcher_handle.lock().await.take() {
      tasks.push(("dispatcher", handle));
    }
    if let Some(handle) = self.worker_handle.lock().await.take() {
      tasks.push(("worker", handle));
    }
    await_tasks(tasks, timeout).await
  }
}

/// Joins coordinator and worker tasks, optionally bounded by `timeout`.
pub(crate) async fn await_tasks(
  tasks: Vec<(&'static str, JoinHandle<()>)>,
  timeout: Option<Duration>,
) -> Result<(), ShutdownError> {
  if tasks.is_empty() {
    warn!("No tasks found to await during shutdown.");
    return Ok(());
  }

  let joins = tasks.into_iter().map(|(name, handle)| async move {
    handle.await.map_err(|e| {
      error!(task = name, error = ?e, "Task panicked during shutdown.");
      ShutdownError::TaskPanic
    })
  });
  let join_all = try_join_all(joins);

  let result = match timeout {
    Some(limit) => match tokio::time::timeout(limit, join_all).await {
      Ok(joined) => joined.map(|_| ()),
      Err(_) => {
        error!(timeout = ?limit, "Shutdown timed out.");
        Err(ShutdownError::Timeout)
      }
    },
    None => join_all.await.map(|_| ()),
  };

  if result.is_ok() {
    info!("All tasks joined successfully.");
  }
  result
}
