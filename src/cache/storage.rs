//! Cache storage trait and SQLite implementation.

use chrono::DateTime;
use rusqlite::types::Value;
use std::path::{Path, PathBuf};

use super::key::Fingerprint;
use super::traits::CacheEntry;
use crate::client::{Reachability, Response};
use crate::db::SqliteConnection;
use crate::error::{Error, Result};

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync {
  /// Get the entry stored for a fingerprint.
  fn get(&self, key: &Fingerprint) -> Result<Option<CacheEntry>>;

  /// Store an entry, replacing any previous one for the same fingerprint.
  fn put(&self, key: &Fingerprint, path: &str, entry: &CacheEntry) -> Result<()>;

  /// Drop every entry recorded under `path`, whatever its parameters.
  fn remove_path(&self, path: &str) -> Result<usize>;

  /// Drop everything.
  fn clear(&self) -> Result<()>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn get(&self, _key: &Fingerprint) -> Result<Option<CacheEntry>> {
    Ok(None) // Always miss
  }

  fn put(&self, _key: &Fingerprint, _path: &str, _entry: &CacheEntry) -> Result<()> {
    Ok(()) // Discard
  }

  fn remove_path(&self, _path: &str) -> Result<usize> {
    Ok(0)
  }

  fn clear(&self) -> Result<()> {
    Ok(())
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  db: SqliteConnection,
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per request fingerprint (serialized JSON response)
CREATE TABLE IF NOT EXISTS response_cache (
    fingerprint TEXT PRIMARY KEY,
    path TEXT NOT NULL,
    response BLOB NOT NULL,
    stored_at INTEGER NOT NULL,
    reachability TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_response_cache_path ON response_cache(path);
"#;

impl SqliteStorage {
  /// Open (or create) a cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    Self::with_connection(SqliteConnection::open(path)?)
  }

  /// Open the per-identity cache under the user's data directory.
  pub fn open_default(identity: &str) -> Result<Self> {
    Self::open(&Self::default_path(identity)?)
  }

  /// A cache that lives only as long as this value.
  pub fn in_memory() -> Result<Self> {
    Self::with_connection(SqliteConnection::open_in_memory()?)
  }

  fn with_connection(db: SqliteConnection) -> Result<Self> {
    let storage = Self { db };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path for an identity hash.
  pub fn default_path(identity: &str) -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| Error::Config("Could not determine data directory".to_string()))?;

    let name: String = identity.chars().take(16).collect();
    Ok(data_dir.join("fauna").join(format!("cache-{}.db", name)))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .db
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| Error::CacheStore(format!("Failed to run cache migrations: {}", e)))
  }

  /// The underlying connection, e.g. for diagnostics.
  pub fn connection(&self) -> &SqliteConnection {
    &self.db
  }
}

impl CacheStorage for SqliteStorage {
  fn get(&self, key: &Fingerprint) -> Result<Option<CacheEntry>> {
    let rows = self.db.select(
      "SELECT response, stored_at, reachability FROM response_cache WHERE fingerprint = ?",
      &[Value::Text(key.to_string())],
    )?;

    let Some(row) = rows.into_iter().next() else {
      return Ok(None);
    };

    match row.as_slice() {
      [Value::Blob(data), Value::Integer(stored_at), Value::Text(reachability)] => {
        let response: Response = serde_json::from_slice(data)
          .map_err(|e| Error::CacheStore(format!("Failed to deserialize response: {}", e)))?;
        let stored_at = DateTime::from_timestamp_millis(*stored_at).ok_or_else(|| {
          Error::CacheStore(format!("Invalid stored_at timestamp {}", stored_at))
        })?;
        let reachability = Reachability::parse(reachability).unwrap_or_default();
        Ok(Some(CacheEntry {
          response,
          stored_at,
          reachability,
        }))
      }
      _ => Err(Error::CacheStore(format!(
        "Unexpected cache row shape for {}",
        key
      ))),
    }
  }

  fn put(&self, key: &Fingerprint, path: &str, entry: &CacheEntry) -> Result<()> {
    let data = serde_json::to_vec(&entry.response)
      .map_err(|e| Error::CacheStore(format!("Failed to serialize response: {}", e)))?;

    self.db.with_transaction(|tx| {
      tx.execute(
        "INSERT OR REPLACE INTO response_cache (fingerprint, path, response, stored_at, reachability)
         VALUES (?, ?, ?, ?, ?)",
        &[
          Value::Text(key.to_string()),
          Value::Text(path.to_string()),
          Value::Blob(data),
          Value::Integer(entry.stored_at.timestamp_millis()),
          Value::Text(entry.reachability.as_str().to_string()),
        ],
      )?;
      Ok(true)
    })?;

    Ok(())
  }

  fn remove_path(&self, path: &str) -> Result<usize> {
    let mut removed = 0;
    self.db.with_transaction(|tx| {
      removed = tx.execute(
        "DELETE FROM response_cache WHERE path = ?",
        &[Value::Text(path.to_string())],
      )?;
      Ok(true)
    })?;
    Ok(removed)
  }

  fn clear(&self) -> Result<()> {
    self.db.execute("DELETE FROM response_cache", &[])?;
    Ok(())
  }
}
