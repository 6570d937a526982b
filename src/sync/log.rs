//! Durable log of write operations awaiting server confirmation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Serialize, Serializer};
use std::sync::Arc;

use crate::cache::{format_timestamp, parse_timestamp};
use crate::db::Database;
use crate::net::{Headers, HttpRequest};

/// Operation type for replayed HTTP requests.
pub const API_REQUEST: &str = "api-request";

/// A write queued while the network was unavailable.
///
/// Records are immutable; a retry produces a new record via [`SyncOperation::with_retry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOperation {
  pub id: i64,
  #[serde(rename = "type")]
  pub op_type: String,
  pub url: String,
  pub method: String,
  pub headers: Headers,
  #[serde(serialize_with = "serialize_payload")]
  pub payload: Option<Vec<u8>>,
  pub created_at: DateTime<Utc>,
  pub retry_count: u32,
  /// Exceeded the retry ceiling; kept for inspection, never replayed automatically
  pub dead_lettered: bool,
}

impl SyncOperation {
  /// The same operation after one more failed attempt.
  pub fn with_retry(&self) -> Self {
    Self {
      retry_count: self.retry_count + 1,
      ..self.clone()
    }
  }

  /// The same operation, excluded from automatic processing.
  pub fn into_dead_letter(self) -> Self {
    Self {
      dead_lettered: true,
      ..self
    }
  }

  /// Rebuild the original request.
  pub fn to_request(&self) -> Result<HttpRequest> {
    let url = url::Url::parse(&self.url)
      .map_err(|e| eyre!("Invalid URL in sync operation {}: {}", self.id, e))?;

    let mut request = HttpRequest::new(&self.method, url);
    request.headers = self.headers.clone();
    if let Some(payload) = &self.payload {
      request = request.with_body(payload.clone());
    }
    Ok(request)
  }
}

fn serialize_payload<S: Serializer>(payload: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
  match payload {
    Some(bytes) => s.serialize_some(&String::from_utf8_lossy(bytes)),
    None => s.serialize_none(),
  }
}

/// Fields supplied by the caller when queueing a write.
#[derive(Debug, Clone)]
pub struct NewOperation {
  pub op_type: String,
  pub url: String,
  pub method: String,
  pub headers: Headers,
  pub payload: Option<Vec<u8>>,
}

impl NewOperation {
  /// An `api-request` operation replaying `request` verbatim.
  pub fn api_request(request: &HttpRequest) -> Self {
    Self {
      op_type: API_REQUEST.to_string(),
      url: request.url.to_string(),
      method: request.method.clone(),
      headers: request.headers.clone(),
      payload: request.body.as_ref().map(|b| b.to_vec()),
    }
  }
}

/// SQLite-backed sync log.
#[derive(Clone)]
pub struct SyncLog {
  db: Arc<Database>,
}

const COLUMNS: &str =
  "id, op_type, url, method, headers, payload, created_at, retry_count, dead_lettered";

impl SyncLog {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  /// Append an operation with `retry_count = 0`.
  pub fn append(&self, op: NewOperation) -> Result<SyncOperation> {
    let conn = self.db.conn()?;
    let created_at = Utc::now();
    let headers = serde_json::to_string(&op.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT INTO sync_operations (op_type, url, method, headers, payload, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          op.op_type,
          op.url,
          op.method,
          headers,
          op.payload,
          format_timestamp(created_at),
        ],
      )
      .map_err(|e| eyre!("Failed to append sync operation: {}", e))?;

    Ok(SyncOperation {
      id: conn.last_insert_rowid(),
      op_type: op.op_type,
      url: op.url,
      method: op.method,
      headers: op.headers,
      payload: op.payload,
      created_at,
      retry_count: 0,
      dead_lettered: false,
    })
  }

  /// Operations eligible for replay, oldest first.
  pub fn pending(&self) -> Result<Vec<SyncOperation>> {
    self.select("WHERE dead_lettered = 0 ORDER BY created_at, id", params![])
  }

  /// Operations that exhausted their retries.
  pub fn dead_letters(&self) -> Result<Vec<SyncOperation>> {
    self.select("WHERE dead_lettered = 1 ORDER BY created_at, id", params![])
  }

  /// Every operation of a type, oldest first.
  pub fn by_type(&self, op_type: &str) -> Result<Vec<SyncOperation>> {
    self.select("WHERE op_type = ? ORDER BY created_at, id", params![op_type])
  }

  pub fn get(&self, id: i64) -> Result<Option<SyncOperation>> {
    let conn = self.db.conn()?;
    let sql = format!("SELECT {} FROM sync_operations WHERE id = ?", COLUMNS);
    let row = conn
      .query_row(&sql, params![id], read_row)
      .optional()
      .map_err(|e| eyre!("Failed to read sync operation {}: {}", id, e))?;

    row.map(RawOperation::into_operation).transpose()
  }

  /// Persist a new version of an existing record.
  pub fn replace(&self, op: &SyncOperation) -> Result<()> {
    let conn = self.db.conn()?;
    let updated = conn
      .execute(
        "UPDATE sync_operations SET retry_count = ?, dead_lettered = ? WHERE id = ?",
        params![op.retry_count, op.dead_lettered, op.id],
      )
      .map_err(|e| eyre!("Failed to update sync operation {}: {}", op.id, e))?;

    if updated == 0 {
      return Err(eyre!("Sync operation {} not found", op.id));
    }
    Ok(())
  }

  pub fn remove(&self, id: i64) -> Result<bool> {
    let conn = self.db.conn()?;
    let removed = conn
      .execute("DELETE FROM sync_operations WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove sync operation {}: {}", id, e))?;
    Ok(removed > 0)
  }

  /// Put a dead letter back in the queue with a fresh retry budget.
  pub fn requeue(&self, id: i64) -> Result<bool> {
    let conn = self.db.conn()?;
    let updated = conn
      .execute(
        "UPDATE sync_operations SET retry_count = 0, dead_lettered = 0
         WHERE id = ? AND dead_lettered = 1",
        params![id],
      )
      .map_err(|e| eyre!("Failed to requeue sync operation {}: {}", id, e))?;
    Ok(updated > 0)
  }

  pub fn purge_dead_letters(&self) -> Result<usize> {
    let conn = self.db.conn()?;
    let removed = conn
      .execute("DELETE FROM sync_operations WHERE dead_lettered = 1", [])
      .map_err(|e| eyre!("Failed to purge dead letters: {}", e))?;
    Ok(removed)
  }

  /// Counts of (pending, dead-lettered) operations.
  pub fn counts(&self) -> Result<(usize, usize)> {
    let conn = self.db.conn()?;
    let (pending, dead): (i64, i64) = conn
      .query_row(
        "SELECT COALESCE(SUM(dead_lettered = 0), 0), COALESCE(SUM(dead_lettered = 1), 0)
         FROM sync_operations",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .map_err(|e| eyre!("Failed to count sync operations: {}", e))?;
    Ok((pending as usize, dead as usize))
  }

  pub fn len(&self) -> Result<usize> {
    let (pending, dead) = self.counts()?;
    Ok(pending + dead)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  fn select(&self, clause: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<SyncOperation>> {
    let conn = self.db.conn()?;
    let sql = format!("SELECT {} FROM sync_operations {}", COLUMNS, clause);
    let mut stmt = conn
      .prepare(&sql)
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<RawOperation> = stmt
      .query_map(params, read_row)
      .map_err(|e| eyre!("Failed to query sync operations: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read sync operation: {}", e))?;

    rows.into_iter().map(RawOperation::into_operation).collect()
  }
}

struct RawOperation {
  id: i64,
  op_type: String,
  url: String,
  method: String,
  headers: String,
  payload: Option<Vec<u8>>,
  created_at: String,
  retry_count: u32,
  dead_lettered: bool,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawOperation> {
  Ok(RawOperation {
    id: row.get(0)?,
    op_type: row.get(1)?,
    url: row.get(2)?,
    method: row.get(3)?,
    headers: row.get(4)?,
    payload: row.get(5)?,
    created_at: row.get(6)?,
    retry_count: row.get(7)?,
    dead_lettered: row.get(8)?,
  })
}

impl RawOperation {
  fn into_operation(self) -> Result<SyncOperation> {
    let headers: Headers = serde_json::from_str(&self.headers)
      .map_err(|e| eyre!("Corrupt headers in sync operation {}: {}", self.id, e))?;
    let created_at = parse_timestamp(&self.created_at)
      .ok_or_else(|| eyre!("Bad timestamp in sync operation {}", self.id))?;

    Ok(SyncOperation {
      id: self.id,
      op_type: self.op_type,
      url: self.url,
      method: self.method,
      headers,
      payload: self.payload,
      created_at,
      retry_count: self.retry_count,
      dead_lettered: self.dead_lettered,
    })
  }
}
