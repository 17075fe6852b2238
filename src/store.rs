//! Request store: append-only log of captured exchanges.
use crate::codec;
use crate::errors::{Error, Result};
use crate::record::{CapturedRecord, EncodedRecord, RecordSummary, StoredRecord};
use async_trait::async_trait;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Storage backend for captured records
#[async_trait]
pub trait RequestStore: Send + Sync {
  /// Append a record and return its identifier.
  async fn insert(&self, record: EncodedRecord) -> Result<i64>;
  /// Fetch one record.
  async fn get(&self, id: i64) -> Result<Option<StoredRecord>>;
  /// Summaries of every record, newest first.
  async fn list(&self) -> Result<Vec<RecordSummary>>;
}

/// Store kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
  records: RwLock<Vec<StoredRecord>>,
}

impl MemoryStore {
  /// Create an empty store
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of stored records
  pub async fn len(&self) -> usize {
    self.records.read().await.len()
  }

  /// Whether nothing was recorded yet
  pub async fn is_empty(&self) -> bool {
    self.records.read().await.is_empty()
  }
}

#[async_trait]
impl RequestStore for MemoryStore {
  async fn insert(&self, record: EncodedRecord) -> Result<i64> {
    let mut records = self.records.write().await;
    let id = records.last().map(|r| r.id + 1).unwrap_or(1);
    records.push(StoredRecord { id, record });
    Ok(id)
  }

  async fn get(&self, id: i64) -> Result<Option<StoredRecord>> {
    let records = self.records.read().await;
    Ok(records.iter().find(|r| r.id == id).cloned())
  }

  async fn list(&self) -> Result<Vec<RecordSummary>> {
    let records = self.records.read().await;
    Ok(records.iter().rev().map(RecordSummary::from).collect())
  }
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS requests (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  method TEXT,
  path TEXT,
  get_params TEXT,
  headers TEXT,
  cookies TEXT,
  post_params TEXT,
  body TEXT,
  response_code INTEGER,
  response_headers TEXT,
  response_body TEXT,
  protocol TEXT
)";

/// Store backed by a SQLite file. Each call opens its own connection on the
/// blocking pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
  db_path: PathBuf,
}

impl SqliteStore {
  /// Open (creating if needed) the database at `db_path`.
  pub async fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
    let db_path = db_path.into();
    let path = db_path.clone();
    blocking(move || {
      if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
      }
      let conn = open_connection(&path)?;
      conn.execute_batch(SCHEMA)?;
      Ok(())
    })
    .await?;
    tracing::info!("request store at {}", db_path.display());
    Ok(Self { db_path })
  }

  /// database file
  pub fn db_path(&self) -> &Path {
    &self.db_path
  }
}

fn open_connection(path: &Path) -> Result<Connection> {
  let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
    | OpenFlags::SQLITE_OPEN_CREATE
    | OpenFlags::SQLITE_OPEN_NO_MUTEX;
  let conn = Connection::open_with_flags(path, flags)?;
  conn.pragma_update(None, "journal_mode", "WAL")?;
  conn.busy_timeout(std::time::Duration::from_secs(5))?;
  Ok(conn)
}

async fn blocking<T, F>(f: F) -> Result<T>
where
  F: FnOnce() -> Result<T> + Send + 'static,
  T: Send + 'static,
{
  tokio::task::spawn_blocking(f)
    .await
    .map_err(|e| Error::persistence(format!("store task failed: {}", e)))?
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRecord> {
  Ok(StoredRecord {
    id: row.get(0)?,
    record: EncodedRecord {
      method: row.get(1)?,
      path: row.get(2)?,
      get_params: row.get(3)?,
      headers: row.get(4)?,
      cookies: row.get(5)?,
      post_params: row.get(6)?,
      body: row.get(7)?,
      response_code: row.get(8)?,
      response_headers: row.get(9)?,
      response_body: row.get(10)?,
      protocol: row.get(11)?,
    },
  })
}

#[async_trait]
impl RequestStore for SqliteStore {
  async fn insert(&self, record: EncodedRecord) -> Result<i64> {
    let path = self.db_path.clone();
    blocking(move || {
      let conn = open_connection(&path)?;
      conn.execute(
        "INSERT INTO requests (method, path, get_params, headers, cookies, post_params, body, \
         response_code, response_headers, response_body, protocol) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
          record.method,
          record.path,
          record.get_params,
          record.headers,
          record.cookies,
          record.post_params,
          record.body,
          record.response_code,
          record.response_headers,
          record.response_body,
          record.protocol,
        ],
      )?;
      Ok(conn.last_insert_rowid())
    })
    .await
  }

  async fn get(&self, id: i64) -> Result<Option<StoredRecord>> {
    let path = self.db_path.clone();
    blocking(move || {
      let conn = open_connection(&path)?;
      let record = conn
        .query_row(
          "SELECT id, method, path, get_params, headers, cookies, post_params, body, \
           response_code, response_headers, response_body, protocol FROM requests WHERE id = ?1",
          params![id],
          row_to_record,
        )
        .optional()?;
      Ok(record)
    })
    .await
  }

  async fn list(&self) -> Result<Vec<RecordSummary>> {
    let path = self.db_path.clone();
    blocking(move || {
      let conn = open_connection(&path)?;
      let mut stmt = conn.prepare("SELECT id, method, path, headers FROM requests ORDER BY id DESC")?;
      let rows = stmt.query_map([], |row| {
        Ok(RecordSummary {
          id: row.get(0)?,
          method: row.get(1)?,
          path: row.get(2)?,
          headers: row.get(3)?,
        })
      })?;
      let summaries = rows.collect::<rusqlite::Result<Vec<_>>>()?;
      Ok(summaries)
    })
    .await
  }
}

/// Hands finished exchanges to the store. Capture is best-effort: failures
/// are logged and never reach the client path.
#[derive(Clone)]
pub struct Recorder {
  store: Arc<dyn RequestStore>,
}

impl Recorder {
  /// Wrap a store
  pub fn new(store: Arc<dyn RequestStore>) -> Self {
    Self { store }
  }

  /// The underlying store
  pub fn store(&self) -> Arc<dyn RequestStore> {
    self.store.clone()
  }

  /// Encode and insert; returns the id when the insert succeeded.
  pub async fn record(&self, record: &CapturedRecord) -> Option<i64> {
    let encoded = match codec::encode(record) {
      Ok(encoded) => encoded,
      Err(e) => {
        tracing::warn!("failed to encode {} {}: {}", record.method, record.path, e);
        return None;
      }
    };
    match self.store.insert(encoded).await {
      Ok(id) => {
        tracing::info!(
          "recorded #{} {} {} {} -> {}",
          id,
          record.protocol,
          record.method,
          record.path,
          record.status
        );
        Some(id)
      }
      Err(e) => {
        tracing::warn!("failed to persist {} {}: {}", record.method, record.path, e);
        None
      }
    }
  }
}
