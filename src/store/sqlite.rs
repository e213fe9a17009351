use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;
use uuid::Uuid;

use super::{QueueStore, DEFAULT_TABLE};
use crate::error::StoreError;
use crate::job::{new_job_id, JobId, JobStatus, Payload, QueuedJob};

/// `queued_at` is written with microseconds so rows enqueued within the same
/// second still sort in insertion order. The format shares its prefix with
/// SQLite's `CURRENT_TIMESTAMP`, so rows inserted by other writers sort correctly too.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
const TIMESTAMP_PARSE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

const COLUMNS: &str = "id, locator, payload, status, error, queued_at";

/// [`QueueStore`] backed by a SQLite table.
///
/// The connection lives behind a mutex and every call runs on Tokio's
/// blocking pool, so awaiting the store never stalls the async runtime.
#[derive(Debug, Clone)]
pub struct SqliteQueueStore {
  conn: Arc<Mutex<Connection>>,
  table: Arc<str>,
}

impl SqliteQueueStore {
  /// Opens (or creates) the database file at `path`, using `table` for the queue.
  pub fn open(path: impl AsRef<Path>, table: &str) -> Result<Self, StoreError> {
    let conn = Connection::open(path)?;
    Self::from_connection(conn, table)
  }

  /// Opens a private in-memory database. Mostly useful for tests.
  pub fn open_in_memory(table: &str) -> Result<Self, StoreError> {
    Self::from_connection(Connection::open_in_memory()?, table)
  }

  /// Wraps an existing connection, e.g. one shared with the rest of the application.
  pub fn from_connection(conn: Connection, table: &str) -> Result<Self, StoreError> {
    validate_table_name(table)?;
    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
      table: Arc::from(table),
    })
  }

  /// In-memory store using [`DEFAULT_TABLE`].
  pub fn in_memory() -> Result<Self, StoreError> {
    Self::open_in_memory(DEFAULT_TABLE)
  }

  pub fn table(&self) -> &str {
    &self.table
  }

  /// Runs `f` with the locked connection on the blocking pool.
  async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
  where
    T: Send + 'static,
    F: FnOnce(&Connection, &str) -> Result<T, StoreError> + Send + 'static,
  {
    let conn = self.conn.clone();
    let table = self.table.clone();
    tokio::task::spawn_blocking(move || {
      let guard = conn.lock();
      f(&guard, &table)
    })
    .await
    .map_err(|e| StoreError::TaskJoin(e.to_string()))?
  }
}

fn validate_table_name(table: &str) -> Result<(), StoreError> {
  let mut chars = table.chars();
  let valid_start = chars
    .next()
    .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
  if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
    Ok(())
  } else {
    Err(StoreError::InvalidTable(table.to_string()))
  }
}

fn format_timestamp(at: DateTime<Utc>) -> String {
  at.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
  NaiveDateTime::parse_from_str(text, TIMESTAMP_PARSE_FORMAT).map(|naive| naive.and_utc())
}

/// Column values as stored, before decoding.
struct RawRow {
  id: String,
  locator: String,
  payload: Option<String>,
  status: String,
  error: Option<String>,
  queued_at: String,
}

impl RawRow {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      locator: row.get(1)?,
      payload: row.get(2)?,
      status: row.get(3)?,
      error: row.get(4)?,
      queued_at: row.get(5)?,
    })
  }

  fn unreadable(&self, reason: String) -> StoreError {
    StoreError::UnreadableRow {
      raw_id: self.id.clone(),
      reason,
    }
  }

  fn decode(self) -> Result<QueuedJob, StoreError> {
    let id = Uuid::parse_str(&self.id).map_err(|e| self.unreadable(format!("id: {e}")))?;
    let status = self
      .status
      .parse::<JobStatus>()
      .map_err(|e| self.unreadable(e))?;
    let queued_at = parse_timestamp(&self.queued_at)
      .map_err(|e| self.unreadable(format!("queued_at '{}': {e}", self.queued_at)))?;
    let payload = self
      .payload
      .as_deref()
      .map(serde_json::from_str::<Payload>)
      .transpose()
      .map_err(|source| StoreError::CorruptPayload { id, source })?;

    Ok(QueuedJob {
      id,
      locator: self.locator,
      payload,
      status,
      error: self.error,
      queued_at,
    })
  }
}

fn update_status(
  conn: &Connection,
  table: &str,
  id: JobId,
  status: JobStatus,
  error: Option<&str>,
) -> Result<(), StoreError> {
  let changed = conn.execute(
    &format!("UPDATE {table} SET status = ?1, error = ?2 WHERE id = ?3"),
    params![status.as_str(), error, id.to_string()],
  )?;
  if changed == 0 {
    return Err(StoreError::JobNotFound(id));
  }
  Ok(())
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
  async fn initialize(&self) -> Result<(), StoreError> {
    self
      .with_conn(|conn, table| {
        conn.execute_batch(&format!(
          "
          CREATE TABLE IF NOT EXISTS {table} (
              id          TEXT PRIMARY KEY,
              locator     TEXT NOT NULL,
              payload     TEXT,               -- JSON-encoded, NULL when absent
              status      TEXT NOT NULL DEFAULT 'pending',
              error       TEXT,
              queued_at   TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
          );

          CREATE INDEX IF NOT EXISTS {table}_status_queued_at
              ON {table} (status, queued_at, id);
          "
        ))?;
        debug!(%table, "Queue table ready.");
        Ok(())
      })
      .await
  }

  async fn enqueue(&self, locator: &str, payload: Option<Payload>) -> Result<JobId, StoreError> {
    let id = new_job_id();
    let payload_text = payload.as_ref().map(serde_json::to_string).transpose()?;
    let locator = locator.to_string();
    let queued_at = format_timestamp(Utc::now());

    self
      .with_conn(move |conn, table| {
        conn.execute(
          &format!(
            "INSERT INTO {table} (id, locator, payload, status, queued_at)
             VALUES (?1, ?2, ?3, 'pending', ?4)"
          ),
          params![id.to_string(), locator, payload_text, queued_at],
        )?;
        Ok(id)
      })
      .await
  }

  async fn next_pending(&self) -> Result<Option<QueuedJob>, StoreError> {
    self
      .with_conn(|conn, table| {
        let raw = conn
          .query_row(
            &format!(
              "SELECT {COLUMNS} FROM {table}
               WHERE status = 'pending'
               ORDER BY queued_at ASC, id ASC
               LIMIT 1"
            ),
            [],
            RawRow::from_row,
          )
          .optional()?;
        raw.map(RawRow::decode).transpose()
      })
      .await
  }

  async fn mark_in_progress(&self, id: JobId) -> Result<(), StoreError> {
    self
      .with_conn(move |conn, table| update_status(conn, table, id, JobStatus::InProgress, None))
      .await
  }

  async fn mark_completed(&self, id: JobId) -> Result<(), StoreError> {
    self
      .with_conn(move |conn, table| update_status(conn, table, id, JobStatus::Completed, None))
      .await
  }

  async fn mark_errored(&self, id: JobId, message: &str) -> Result<(), StoreError> {
    let message = message.to_string();
    self
      .with_conn(move |conn, table| {
        update_status(conn, table, id, JobStatus::Errored, Some(&message))
      })
      .await
  }

  async fn mark_errored_raw(&self, raw_id: &str, message: &str) -> Result<(), StoreError> {
    let raw_id = raw_id.to_string();
    let message = message.to_string();
    self
      .with_conn(move |conn, table| {
        let changed = conn.execute(
          &format!("UPDATE {table} SET status = 'errored', error = ?1 WHERE id = ?2"),
          params![message, raw_id],
        )?;
        if changed == 0 {
          return Err(StoreError::UnreadableRow {
            raw_id,
            reason: "row no longer exists".to_string(),
          });
        }
        Ok(())
      })
      .await
  }

  async fn prune_completed(&self, max_retained: usize) -> Result<usize, StoreError> {
    let max_retained = i64::try_from(max_retained).unwrap_or(i64::MAX);
    self
      .with_conn(move |conn, table| {
        let deleted = conn.execute(
          &format!(
            "DELETE FROM {table} WHERE id IN (
                SELECT id FROM {table}
                WHERE status IN ('completed', 'errored')
                ORDER BY queued_at ASC, id ASC
                LIMIT MAX(0, (SELECT COUNT(*) FROM {table}
                              WHERE status IN ('completed', 'errored')) - ?1)
            )"
          ),
          params![max_retained],
        )?;
        Ok(deleted)
      })
      .await
  }

  async fn get(&self, id: JobId) -> Result<Option<QueuedJob>, StoreError> {
    self
      .with_conn(move |conn, table| {
        let raw = conn
          .query_row(
            &format!("SELECT {COLUMNS} FROM {table} WHERE id = ?1"),
            params![id.to_string()],
            RawRow::from_row,
          )
          .optional()?;
        raw.map(RawRow::decode).transpose()
      })
      .await
  }

  async fn list(&self, status: Option<JobStatus>) -> Result<Vec<QueuedJob>, StoreError> {
    self
      .with_conn(move |conn, table| {
        let rows: Vec<RawRow> = match status {
          Some(status) => {
            let mut stmt = conn.prepare(&format!(
              "SELECT {COLUMNS} FROM {table} WHERE status = ?1 ORDER BY queued_at ASC, id ASC"
            ))?;
            let rows = stmt
              .query_map(params![status.as_str()], RawRow::from_row)?
              .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
          }
          None => {
            let mut stmt = conn.prepare(&format!(
              "SELECT {COLUMNS} FROM {table} ORDER BY queued_at ASC, id ASC"
            ))?;
            let rows = stmt
              .query_map([], RawRow::from_row)?
              .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
          }
        };
        rows.into_iter().map(RawRow::decode).collect()
      })
      .await
  }

  async fn count(&self, status: JobStatus) -> Result<usize, StoreError> {
    self
      .with_conn(move |conn, table| {
        let count: i64 = conn.query_row(
          &format!("SELECT COUNT(*) FROM {table} WHERE status = ?1"),
          params![status.as_str()],
          |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
      })
      .await
  }

  async fn fail_in_progress(&self, message: &str) -> Result<usize, StoreError> {
    let message = message.to_string();
    self
      .with_conn(move |conn, table| {
        let changed = conn.execute(
          &format!("UPDATE {table} SET status = 'errored', error = ?1 WHERE status = 'in_progress'"),
          params![message],
        )?;
        Ok(changed)
      })
      .await
  }
}
