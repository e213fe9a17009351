use super::JobId;

/// Contextual information available to a running job via task-locals.
/// Accessible within a job function using `try_get_current_job_context()`
/// or the `job_context!()` macro when the `job_context` feature is enabled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobContext {
  /// Queue row id, or the run id generated by the scheduler for a cron fire.
  pub job_id: JobId,
  /// The locator the job was resolved from.
  pub locator: String,
}

tokio::task_local! {
    /// Provides access to the current `JobContext` within a job's execution scope.
    /// Set by the worker before the job future is polled.
    pub static CURRENT_JOB_CONTEXT: JobContext;
}

/// Attempts to retrieve the current `JobContext` for the executing job.
///
/// Returns `None` when called outside a job started by a queue or scheduler worker.
pub fn try_get_current_job_context() -> Option<JobContext> {
  CURRENT_JOB_CONTEXT.try_with(|ctx| ctx.clone()).ok()
}

/// Retrieves the current `JobContext`, panicking if called outside a
/// worker-managed job task.
///
/// Use `try_get_current_job_context()` for optional access.
#[macro_export]
macro_rules! job_context {
  () => {
    $crate::job::context::CURRENT_JOB_CONTEXT.with(|ctx| ctx.clone())
  };
}
