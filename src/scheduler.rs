use crate::command::{ShutdownMode, WorkerReply, WorkerRequest};
use crate::cron::CronExpr;
use crate::error::{BuildError, ShutdownError};
use crate::job::{new_job_id, JobId, Payload, ScheduleEntry};
use crate::metrics::{SchedulerMetrics, SchedulerMetricsSnapshot};
use crate::queue::await_tasks;
use crate::registry::JobRegistry;
use crate::worker::Worker;

use std::collections::HashMap;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, DurationRound, Local, NaiveDateTime, TimeDelta, Timelike, Utc};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// Interval between ticks once the first one is aligned to a minute boundary.
pub const TICK_PERIOD: Duration = Duration::from_secs(60);
/// Bound of the scheduler → worker request channel.
const DEFAULT_REQUEST_BUFFER: usize = 128;

/// Which wall clock cron expressions are evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScheduleClock {
  /// The host's local time zone.
  #[default]
  Local,
  Utc,
}

impl ScheduleClock {
  /// Current wall-clock time, without zone, in this clock.
  pub fn now(&self) -> NaiveDateTime {
    match self {
      ScheduleClock::Local => Local::now().naive_local(),
      ScheduleClock::Utc => Utc::now().naive_utc(),
    }
  }
}

/// Time until the next whole minute: `60s - (seconds + millis)` of `now`.
///
/// Never zero, so a tick landing exactly on a boundary waits a full minute.
pub fn delay_until_next_minute<T: Timelike>(now: &T) -> Duration {
  // Leap seconds report nanoseconds past 1e9.
  let millis = (now.nanosecond() / 1_000_000).min(999);
  let elapsed = u64::from(now.second()) * 1_000 + u64::from(millis);
  Duration::from_millis(60_000 - elapsed)
}

/// Rounds `now` to the nearest minute to absorb timer jitter around the boundary.
pub fn round_to_minute(now: NaiveDateTime) -> NaiveDateTime {
  now.duration_round(TimeDelta::minutes(1)).unwrap_or(now)
}

/// Entries whose cron expression matches `now`, in registration order.
pub fn due_entries<'a, T: Datelike + Timelike>(
  entries: &'a [ScheduleEntry],
  now: &T,
) -> Vec<&'a ScheduleEntry> {
  entries.iter().filter(|entry| entry.cron.matches(now)).collect()
}

#[derive(Debug)]
enum EntryInput {
  Raw {
    cron: String,
    locator: String,
    payload: Option<Payload>,
  },
  Parsed(ScheduleEntry),
}

/// Builder for configuring and starting a [`Scheduler`].
///
/// # Example
///
/// ```no_run
/// use turnqueue::{JobRegistry, Scheduler};
/// use serde_json::json;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let mut registry = JobRegistry::new();
/// registry.register("reports/nightly", |_payload| async { Ok(json!(null)) });
///
/// let scheduler = Scheduler::builder()
///     .entry("30 2 * * *", "reports/nightly")
///     .registry(registry)
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct SchedulerBuilder {
  entries: Vec<EntryInput>,
  registry: JobRegistry,
  clock: ScheduleClock,
  job_timeout: Option<Duration>,
}

impl SchedulerBuilder {
  /// Creates a new builder with default settings.
  /// - No entries.
  /// - `clock`: [`ScheduleClock::Local`].
  /// - `job_timeout`: None.
  pub fn new() -> Self {
    Self::default()
  }

  /// Adds an entry running `locator` whenever `cron` matches. The expression
  /// is validated by [`build`](Self::build).
  pub fn entry(mut self, cron: &str, locator: &str) -> Self {
    self.entries.push(EntryInput::Raw {
      cron: cron.to_string(),
      locator: locator.to_string(),
      payload: None,
    });
    self
  }

  /// Adds an entry whose job receives `payload` on every fire.
  pub fn entry_with_payload(mut self, cron: &str, locator: &str, payload: Payload) -> Self {
    self.entries.push(EntryInput::Raw {
      cron: cron.to_string(),
      locator: locator.to_string(),
      payload: Some(payload),
    });
    self
  }

  /// Adds already-parsed entries.
  pub fn entries(mut self, entries: impl IntoIterator<Item = ScheduleEntry>) -> Self {
    self
      .entries
      .extend(entries.into_iter().map(EntryInput::Parsed));
    self
  }

  pub fn registry(mut self, registry: JobRegistry) -> Self {
    self.registry = registry;
    self
  }

  pub fn clock(mut self, clock: ScheduleClock) -> Self {
    self.clock = clock;
    self
  }

  /// Aborts a scheduled run that takes longer than `timeout`.
  pub fn job_timeout(mut self, timeout: Duration) -> Self {
    self.job_timeout = Some(timeout);
    self
  }

  /// Validates every entry and starts the scheduler loop and its worker.
  ///
  /// Must be called from within a Tokio runtime.
  ///
  /// # Errors
  ///
  /// Returns [`BuildError::InvalidCron`] for the first entry whose expression
  /// does not parse.
  pub fn build(self) -> Result<Scheduler, BuildError> {
    let entries = self
      .entries
      .into_iter()
      .map(|input| match input {
        EntryInput::Parsed(entry) => Ok(entry),
        EntryInput::Raw {
          cron,
          locator,
          payload,
        } => {
          let parsed = cron.parse::<CronExpr>().map_err(|source| BuildError::InvalidCron {
            expression: cron.clone(),
            source,
          })?;
          Ok(ScheduleEntry {
            cron: parsed,
            locator,
            payload,
          })
        }
      })
      .collect::<Result<Vec<_>, BuildError>>()?;

    for entry in &entries {
      if !self.registry.contains(&entry.locator) {
        warn!(locator = %entry.locator, cron = %entry.cron, "Scheduled locator is not registered; its runs will fail.");
      }
    }
    let entries = Arc::new(entries);

    let metrics = SchedulerMetrics::new();
    let (shutdown_tx, shutdown_rx) = watch::channel::<Option<ShutdownMode>>(None);
    let (request_tx, request_rx) = mpsc::channel::<WorkerRequest>(DEFAULT_REQUEST_BUFFER);
    let (reply_tx, reply_rx) = mpsc::channel::<WorkerReply>(DEFAULT_REQUEST_BUFFER);

    let worker = Worker::new(
      "scheduler",
      Arc::new(self.registry),
      metrics.execution.clone(),
      self.job_timeout,
      shutdown_rx.clone(),
      request_rx,
      reply_tx,
    );
    let worker_handle = tokio::spawn(worker.run());

    let schedule_loop = ScheduleLoop {
      entries: entries.clone(),
      clock: self.clock,
      metrics: metrics.clone(),
      shutdown_rx,
      request_tx: Some(request_tx),
      reply_rx,
      running: HashMap::new(),
    };
    let loop_handle = tokio::spawn(async move {
      schedule_loop.run().await;
      info!("Scheduler task finished.");
    });

    info!(entries = entries.len(), clock = ?self.clock, "Scheduler started.");

    Ok(Scheduler {
      entries,
      clock: self.clock,
      metrics,
      shutdown_tx: Arc::new(shutdown_tx),
      loop_handle: Arc::new(Mutex::new(Some(loop_handle))),
      worker_handle: Arc::new(Mutex::new(Some(worker_handle))),
    })
  }
}

/// Handle to a running cron scheduler.
///
/// Each minute, every entry whose expression matches the current minute is
/// handed to the scheduler's worker without waiting for earlier runs, so a
/// slow job never delays other entries or the next tick. Runs are not retried
/// and are independent of any [`JobQueue`](crate::queue::JobQueue).
///
/// Dropping every handle without calling a shutdown method leaves the
/// scheduler running until the runtime stops.
#[derive(Debug, Clone)]
pub struct Scheduler {
  entries: Arc<Vec<ScheduleEntry>>,
  clock: ScheduleClock,
  metrics: SchedulerMetrics,
  shutdown_tx: Arc<watch::Sender<Option<ShutdownMode>>>,
  loop_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
  worker_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Scheduler {
  pub fn builder() -> SchedulerBuilder {
    SchedulerBuilder::new()
  }

  pub fn entries(&self) -> &[ScheduleEntry] {
    &self.entries
  }

  pub fn clock(&self) -> ScheduleClock {
    self.clock
  }

  pub fn metrics_snapshot(&self) -> SchedulerMetricsSnapshot {
    self.metrics.snapshot()
  }

  /// Stops ticking and waits for runs already started to finish.
  ///
  /// A run that never finishes keeps this waiting; pass a `timeout` or use
  /// [`shutdown_force`](Self::shutdown_force) if jobs may hang.
  pub async fn shutdown(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    info!("Initiating graceful scheduler shutdown...");
    self
      .shutdown_tx
      .send(Some(ShutdownMode::Graceful))
      .map_err(|_| ShutdownError::SignalFailed)?;
    self.await_shutdown(timeout).await
  }

  /// Stops ticking and aborts every running job.
  pub async fn shutdown_force(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    info!("Initiating forced scheduler shutdown...");
    self
      .shutdown_tx
      .send(Some(ShutdownMode::Force))
      .map_err(|_| ShutdownError::SignalFailed)?;
    self.await_shutdown(timeout).await
  }

  async fn await_shutdown(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    let mut tasks = Vec::with_capacity(2);
    if let Some(handle) = self.loop_handle.lock().await.take() {
      tasks.push(("scheduler", handle));
    }
    if let Some(handle) = self.worker_handle.lock().await.take() {
      tasks.push(("worker", handle));
    }
    await_tasks(tasks, timeout).await
  }
}

/// The task that ticks once a minute and fires due entries.
struct ScheduleLoop {
  entries: Arc<Vec<ScheduleEntry>>,
  clock: ScheduleClock,
  metrics: SchedulerMetrics,
  shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  /// Dropped on graceful shutdown so the worker stops taking requests.
  request_tx: Option<mpsc::Sender<WorkerRequest>>,
  reply_rx: mpsc::Receiver<WorkerReply>,
  /// Locators of runs that have not reported back, for logging.
  running: HashMap<JobId, String>,
}

impl ScheduleLoop {
  async fn run(mut self) {
    let first_delay = delay_until_next_minute(&self.clock.now());
    debug!(delay_ms = first_delay.as_millis(), "Aligning first tick to the next minute.");
    let mut ticker = tokio::time::interval_at(Instant::now() + first_delay, TICK_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
      tokio::select! {
          biased;

          Ok(()) = self.shutdown_rx.changed() => {
              let mode = *self.shutdown_rx.borrow();
              match mode {
                  Some(ShutdownMode::Force) => {
                      info!(running = self.running.len(), "Forced shutdown, scheduler loop breaking.");
                      break;
                  }
                  Some(ShutdownMode::Graceful) => {
                      info!(running = self.running.len(), "Scheduler stopped ticking, waiting for running jobs.");
                      self.request_tx = None;
                  }
                  None => {}
              }
          }

          maybe_reply = self.reply_rx.recv() => {
              match maybe_reply {
                  Some(reply) => self.record_reply(reply),
                  None => {
                      // Worker exited and dropped its reply sender.
                      break;
                  }
              }
          }

          _ = ticker.tick(), if self.request_tx.is_some() => {
              self.tick();
          }
      }
    }

    info!("Scheduler task shutting down.");
  }

  fn tick(&mut self) {
    let now = round_to_minute(self.clock.now());
    self.metrics.ticks.fetch_add(1, AtomicOrdering::Relaxed);
    let due = due_entries(&self.entries, &now);
    trace!(%now, due = due.len(), "Tick.");

    let Some(request_tx) = &self.request_tx else {
      return;
    };
    for entry in due {
      let id = new_job_id();
      let request = WorkerRequest {
        id,
        locator: entry.locator.clone(),
        payload: entry.payload.clone(),
      };
      match request_tx.try_send(request) {
        Ok(()) => {
          self
            .metrics
            .entries_fired
            .fetch_add(1, AtomicOrdering::Relaxed);
          self.running.insert(id, entry.locator.clone());
          info!(run_id = %id, locator = %entry.locator, cron = %entry.cron, "Scheduled job fired.");
        }
        Err(e) => {
          error!(locator = %entry.locator, error = %e, "Failed to hand scheduled job to the worker; skipping this run.");
        }
      }
    }
  }

  fn record_reply(&mut self, reply: WorkerReply) {
    let locator = self
      .running
      .remove(&reply.id())
      .unwrap_or_else(|| "<unknown>".to_string());
    match reply {
      WorkerReply::Success { id, result } => {
        self
          .metrics
          .runs_succeeded
          .fetch_add(1, AtomicOrdering::Relaxed);
        info!(run_id = %id, %locator, %result, "Scheduled job succeeded.");
      }
      WorkerReply::Error { id, error } => {
        self.metrics.runs_failed.fetch_add(1, AtomicOrdering::Relaxed);
        error!(run_id = %id, %locator, %error, "Scheduled job failed.");
      }
    }
  }
}

