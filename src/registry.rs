//! Static locator → job function registration.
//!
//! A locator is the opaque string stored with a queued job (or declared by a
//! schedule entry). Workers resolve it here right before execution, so a
//! locator that was never registered surfaces as a failed job rather than a
//! failed enqueue.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::JobError;
use crate::job::{BoxedJobFn, JobResult, Payload};

/// Maps locators to the functions that run them.
#[derive(Default)]
pub struct JobRegistry {
  jobs: HashMap<String, Arc<BoxedJobFn>>,
}

impl JobRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers `f` under `locator`, receiving the raw payload.
  /// A later registration under the same locator replaces the earlier one.
  pub fn register<F, Fut>(&mut self, locator: &str, f: F) -> &mut Self
  where
    F: Fn(Option<Payload>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
  {
    let boxed: BoxedJobFn = Box::new(move |payload| Box::pin(f(payload)));
    self.jobs.insert(locator.to_string(), Arc::new(boxed));
    self
  }

  /// Registers `f` under `locator` with a typed payload.
  ///
  /// The payload is deserialized into `P` before `f` is called; a job
  /// enqueued without a payload is deserialized from `null`, so `P` may be
  /// `()` or an `Option<_>`. A shape mismatch fails the job with
  /// [`JobError::InvalidPayload`] without calling `f`.
  pub fn register_typed<P, F, Fut>(&mut self, locator: &str, f: F) -> &mut Self
  where
    P: DeserializeOwned + Send + 'static,
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
  {
    let f = Arc::new(f);
    let owned_locator = locator.to_string();
    self.register(locator, move |payload: Option<Payload>| {
      let f = f.clone();
      let locator = owned_locator.clone();
      async move {
        let typed = serde_json::from_value::<P>(payload.unwrap_or(Value::Null)).map_err(|e| {
          JobError::InvalidPayload {
            locator,
            reason: e.to_string(),
          }
        })?;
        f(typed).await
      }
    })
  }

  /// Looks up the function registered for `locator`.
  pub fn resolve(&self, locator: &str) -> Result<Arc<BoxedJobFn>, JobError> {
    self
      .jobs
      .get(locator)
      .cloned()
      .ok_or_else(|| JobError::UnknownLocator(locator.to_string()))
  }

  pub fn contains(&self, locator: &str) -> bool {
    self.jobs.contains_key(locator)
  }

  /// Registered locators, sorted.
  pub fn locators(&self) -> Vec<&str> {
    let mut locators: Vec<&str> = self.jobs.keys().map(String::as_str).collect();
    locators.sort_unstable();
    locators
  }
}

impl fmt::Debug for JobRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JobRegistry")
      .field("locators", &self.locators())
      .finish()
  }
}
