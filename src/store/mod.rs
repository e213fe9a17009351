//! Persistence of queued jobs.
//!
//! The dispatcher only talks to a [`QueueStore`]; [`SqliteQueueStore`] is the
//! production implementation and [`MemoryQueueStore`] keeps the same semantics
//! without a database.

mod memory;
mod sqlite;

pub use memory::MemoryQueueStore;
pub use sqlite::SqliteQueueStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::job::{JobId, JobStatus, Payload, QueuedJob};

/// Default table name used when none is configured.
pub const DEFAULT_TABLE: &str = "queued_jobs";

/// Persistence operations needed by the queue.
///
/// Status transitions are single updates keyed by id. Ordering for
/// [`next_pending`](QueueStore::next_pending), [`list`](QueueStore::list)
/// and pruning is `queued_at`, then `id`.
#[async_trait]
pub trait QueueStore: Send + Sync {
  /// Ensures the backing table exists. Safe to call repeatedly.
  async fn initialize(&self) -> Result<(), StoreError>;

  /// Inserts a `pending` row and returns its new id.
  async fn enqueue(&self, locator: &str, payload: Option<Payload>) -> Result<JobId, StoreError>;

  /// Oldest `pending` row, without changing its status.
  async fn next_pending(&self) -> Result<Option<QueuedJob>, StoreError>;

  async fn mark_in_progress(&self, id: JobId) -> Result<(), StoreError>;

  async fn mark_completed(&self, id: JobId) -> Result<(), StoreError>;

  async fn mark_errored(&self, id: JobId, message: &str) -> Result<(), StoreError>;

  /// Marks `errored` a row that [`next_pending`](QueueStore::next_pending)
  /// reported as [`StoreError::UnreadableRow`], addressing it by the id text
  /// as stored. Stores whose ids always decode can rely on the default.
  async fn mark_errored_raw(&self, raw_id: &str, message: &str) -> Result<(), StoreError> {
    let id = Uuid::parse_str(raw_id).map_err(|e| StoreError::UnreadableRow {
      raw_id: raw_id.to_string(),
      reason: format!("id: {e}"),
    })?;
    self.mark_errored(id, message).await
  }

  /// Deletes the oldest terminal rows so that at most `max_retained` remain.
  /// Returns the number of rows deleted.
  async fn prune_completed(&self, max_retained: usize) -> Result<usize, StoreError>;

  async fn get(&self, id: JobId) -> Result<Option<QueuedJob>, StoreError>;

  /// All rows (or only those in `status`) in FIFO order.
  async fn list(&self, status: Option<JobStatus>) -> Result<Vec<QueuedJob>, StoreError>;

  async fn count(&self, status: JobStatus) -> Result<usize, StoreError>;

  /// Marks every `in_progress` row `errored` with `message`. Used at startup
  /// to release rows orphaned by a previous process. Returns rows changed.
  async fn fail_in_progress(&self, message: &str) -> Result<usize, StoreError>;
}
