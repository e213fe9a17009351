use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// --- Simple Histogram Implementation ---

/// A basic concurrent histogram storing count and sum.
///
/// Uses `Relaxed` ordering; the counters are independent observations.
#[derive(Debug, Default)]
pub struct SimpleHistogram {
  count: AtomicUsize,
  sum_micros: AtomicUsize,
}

impl SimpleHistogram {
  /// Records a duration observation in the histogram.
  pub fn record(&self, duration: Duration) {
    self.count.fetch_add(1, Ordering::Relaxed);
    self.sum_micros.fetch_add(
      duration.as_micros().try_into().unwrap_or(usize::MAX),
      Ordering::Relaxed,
    );
  }

  pub fn get_count(&self) -> usize {
    self.count.load(Ordering::Relaxed)
  }

  /// Gets the total sum of durations recorded (in microseconds).
  pub fn get_sum_micros(&self) -> usize {
    self.sum_micros.load(Ordering::Relaxed)
  }

  /// Mean of the recorded durations, `None` before the first observation.
  pub fn mean(&self) -> Option<Duration> {
    mean_duration(self.get_count(), self.get_sum_micros())
  }
}

fn mean_duration(count: usize, sum_micros: usize) -> Option<Duration> {
  if count == 0 {
    None
  } else {
    Some(Duration::from_micros((sum_micros / count) as u64))
  }
}

// --- Worker-level execution counters ---

/// Counters updated by a worker for every job it runs.
///
/// Cloning only clones the `Arc`s, so the coordinator and its worker share
/// the same values.
#[derive(Debug, Clone, Default)]
pub struct ExecutionMetrics {
  /// Jobs whose task panicked.
  pub jobs_panicked: Arc<AtomicUsize>,
  /// Jobs aborted by the configured job timeout.
  pub jobs_timed_out: Arc<AtomicUsize>,
  /// Wall time spent executing jobs.
  pub execution_duration: Arc<SimpleHistogram>,
}

// --- Queue metrics ---

/// Counters for a [`JobQueue`](crate::queue::JobQueue).
#[derive(Debug, Clone, Default)]
pub struct QueueMetrics {
  /// Rows successfully written by `enqueue`.
  pub jobs_enqueued: Arc<AtomicUsize>,
  /// `enqueue` calls rejected by the store.
  pub enqueue_failed: Arc<AtomicUsize>,
  /// Jobs handed to the worker.
  pub jobs_dispatched: Arc<AtomicUsize>,
  /// Jobs recorded as `completed`.
  pub jobs_completed: Arc<AtomicUsize>,
  /// Jobs recorded as `errored`.
  pub jobs_errored: Arc<AtomicUsize>,
  /// Terminal rows deleted by retention pruning.
  pub jobs_pruned: Arc<AtomicUsize>,
  /// `in_progress` rows released at startup.
  pub jobs_recovered: Arc<AtomicUsize>,
  /// Store calls made by the dispatcher that failed.
  pub store_errors: Arc<AtomicUsize>,
  pub execution: ExecutionMetrics,
}

impl QueueMetrics {
  pub fn new() -> Self {
    Self::default()
  }

  /// Creates a snapshot of the current metric values.
  pub fn snapshot(&self) -> QueueMetricsSnapshot {
    let order = Ordering::Relaxed;
    QueueMetricsSnapshot {
      jobs_enqueued: self.jobs_enqueued.load(order),
      enqueue_failed: self.enqueue_failed.load(order),
      jobs_dispatched: self.jobs_dispatched.load(order),
      jobs_completed: self.jobs_completed.load(order),
      jobs_errored: self.jobs_errored.load(order),
      jobs_pruned: self.jobs_pruned.load(order),
      jobs_recovered: self.jobs_recovered.load(order),
      store_errors: self.store_errors.load(order),
      jobs_panicked: self.execution.jobs_panicked.load(order),
      jobs_timed_out: self.execution.jobs_timed_out.load(order),
      job_execution_duration_count: self.execution.execution_duration.get_count(),
      job_execution_duration_sum_micros: self.execution.execution_duration.get_sum_micros(),
    }
  }
}

/// A point-in-time copy of [`QueueMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueMetricsSnapshot {
  pub jobs_enqueued: usize,
  pub enqueue_failed: usize,
  pub jobs_dispatched: usize,
  pub jobs_completed: usize,
  pub jobs_errored: usize,
  pub jobs_pruned: usize,
  pub jobs_recovered: usize,
  pub store_errors: usize,
  pub jobs_panicked: usize,
  pub jobs_timed_out: usize,
  pub job_execution_duration_count: usize,
  pub job_execution_duration_sum_micros: usize,
}

impl QueueMetricsSnapshot {
  pub fn mean_execution_duration(&self) -> Option<Duration> {
    mean_duration(
      self.job_execution_duration_count,
      self.job_execution_duration_sum_micros,
    )
  }
}

// --- Scheduler metrics ---

/// Counters for a [`Scheduler`](crate::scheduler::Scheduler).
#[derive(Debug, Clone, Default)]
pub struct SchedulerMetrics {
  /// Minute ticks evaluated.
  pub ticks: Arc<AtomicUsize>,
  /// Entries that matched a tick and were sent to the worker.
  pub entries_fired: Arc<AtomicUsize>,
  /// Scheduled runs reported as successful.
  pub runs_succeeded: Arc<AtomicUsize>,
  /// Scheduled runs reported as failed.
  pub runs_failed: Arc<AtomicUsize>,
  pub execution: ExecutionMetrics,
}

impl SchedulerMetrics {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn snapshot(&self) -> SchedulerMetricsSnapshot {
    let order = Ordering::Relaxed;
    SchedulerMetricsSnapshot {
      ticks: self.ticks.load(order),
      entries_fired: self.entries_fired.load(order),
      runs_succeeded: self.runs_succeeded.load(order),
      runs_failed: self.runs_failed.load(order),
      jobs_panicked: self.execution.jobs_panicked.load(order),
      jobs_timed_out: self.execution.jobs_timed_out.load(order),
    }
  }
}

/// A point-in-time copy of [`SchedulerMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SchedulerMetricsSnapshot {
  pub ticks: usize,
  pub entries_fired: usize,
  pub runs_succeeded: usize,
  pub runs_failed: usize,
  pub jobs_panicked: usize,
  pub jobs_timed_out: usize,
}
