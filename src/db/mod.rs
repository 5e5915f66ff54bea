//! Transactional row store over SQLite.

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};

/// A row as returned by [`SqliteConnection::select`].
pub type Row = Vec<Value>;

/// SQLite connection wrapper for the response cache.
///
/// All access is serialized through an internal lock, so a single connection
/// may be shared between threads. After [`SqliteConnection::close`] every call
/// returns [`Error::StoreClosed`].
pub struct SqliteConnection {
  conn: Mutex<Option<Connection>>,
  last_error: Mutex<Option<String>>,
  path: Option<PathBuf>,
}

impl SqliteConnection {
  /// Open or create the database at `path`, creating parent directories.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        Error::CacheStore(format!("Failed to create cache directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      Error::CacheStore(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Ok(Self::from_connection(conn, Some(path.to_path_buf())))
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()?;
    Ok(Self::from_connection(conn, None))
  }

  fn from_connection(conn: Connection, path: Option<PathBuf>) -> Self {
    Self {
      conn: Mutex::new(Some(conn)),
      last_error: Mutex::new(None),
      path,
    }
  }

  pub fn path(&self) -> Option<&Path> {
    self.path.as_deref()
  }

  pub fn is_closed(&self) -> bool {
    self.lock().is_none()
  }

  fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
    self.conn.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn record<T>(&self, result: rusqlite::Result<T>) -> Result<T> {
    result.map_err(|e| {
      let message = e.to_string();
      *self
        .last_error
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Some(message.clone());
      Error::CacheStore(message)
    })
  }

  /// Run several statements separated by semicolons, without parameters.
  pub fn execute_batch(&self, sql: &str) -> Result<()> {
    let guard = self.lock();
    let conn = guard.as_ref().ok_or(Error::StoreClosed)?;
    self.record(conn.execute_batch(sql))
  }

  /// Run a query and collect every row.
  pub fn select(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
    let guard = self.lock();
    let conn = guard.as_ref().ok_or(Error::StoreClosed)?;
    self.record(select_rows(conn, sql, params))
  }

  /// Run a statement; returns the number of rows changed.
  pub fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
    let guard = self.lock();
    let conn = guard.as_ref().ok_or(Error::StoreClosed)?;
    self.record(conn.execute(sql, params_from_iter(params.iter())))
  }

  /// Run `block` inside a transaction.
  ///
  /// Commits when the block returns `Ok(true)`; rolls back on `Ok(false)` or
  /// an error. Returns whether the transaction committed.
  pub fn with_transaction<F>(&self, block: F) -> Result<bool>
  where
    F: FnOnce(&Transaction<'_>) -> Result<bool>,
  {
    let mut guard = self.lock();
    let conn = guard.as_mut().ok_or(Error::StoreClosed)?;
    let tx = self.record(conn.transaction())?;

    let outcome = block(&Transaction {
      conn: &tx,
      owner: self,
    });

    match outcome {
      Ok(true) => {
        self.record(tx.commit())?;
        Ok(true)
      }
      Ok(false) => {
        self.record(tx.rollback())?;
        Ok(false)
      }
      Err(e) => {
        if let Err(rollback) = tx.rollback() {
          tracing::warn!(error = %rollback, "rollback failed");
        }
        Err(e)
      }
    }
  }

  /// Rows changed by the most recent statement.
  pub fn rows_changed(&self) -> Result<u64> {
    let guard = self.lock();
    let conn = guard.as_ref().ok_or(Error::StoreClosed)?;
    Ok(conn.changes())
  }

  pub fn last_row_id(&self) -> Result<i64> {
    let guard = self.lock();
    let conn = guard.as_ref().ok_or(Error::StoreClosed)?;
    Ok(conn.last_insert_rowid())
  }

  /// Message of the most recent failed statement, for diagnostics.
  pub fn last_error_message(&self) -> Option<String> {
    self
      .last_error
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn close(&self) -> Result<()> {
    let conn = self.lock().take();
    match conn {
      Some(conn) => conn
        .close()
        .map_err(|(_, e)| Error::CacheStore(format!("Failed to close cache database: {}", e))),
      None => Ok(()),
    }
  }
}

/// Statements issued inside [`SqliteConnection::with_transaction`].
pub struct Transaction<'a> {
  conn: &'a Connection,
  owner: &'a SqliteConnection,
}

impl Transaction<'_> {
  pub fn select(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
    self.owner.record(select_rows(self.conn, sql, params))
  }

  pub fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
    self
      .owner
      .record(self.conn.execute(sql, params_from_iter(params.iter())))
  }

  pub fn rows_changed(&self) -> u64 {
    self.conn.changes()
  }

  pub fn last_row_id(&self) -> i64 {
    self.conn.last_insert_rowid()
  }
}

fn select_rows(conn: &Connection, sql: &str, params: &[Value]) -> rusqlite::Result<Vec<Row>> {
  let mut stmt = conn.prepare(sql)?;
  let columns = stmt.column_count();
  let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
    (0..columns).map(|i| row.get::<_, Value>(i)).collect()
  })?;
  rows.collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn store() -> SqliteConnection {
    let db = SqliteConnection::open_in_memory().unwrap();
    db.execute_batch("CREATE TABLE kv (k TEXT PRIMARY KEY, v INTEGER NOT NULL);")
      .unwrap();
    db
  }

  fn text(s: &str) -> Value {
    Value::Text(s.to_string())
  }

  #[test]
  fn test_execute_and_select() {
    let db = store();
    let changed = db
      .execute("INSERT INTO kv (k, v) VALUES (?, ?)", &[text("a"), Value::Integer(1)])
      .unwrap();
    assert_eq!(changed, 1);
    assert_eq!(db.rows_changed().unwrap(), 1);
    assert_eq!(db.last_row_id().unwrap(), 1);

    let rows = db.select("SELECT k, v FROM kv WHERE k = ?", &[text("a")]).unwrap();
    assert_eq!(rows, vec![vec![text("a"), Value::Integer(1)]]);
  }

  #[test]
  fn test_parameters_are_not_interpolated() {
    let db = store();
    let hostile = "x'); DROP TABLE kv; --";
    db.execute("INSERT INTO kv (k, v) VALUES (?, ?)", &[text(hostile), Value::Integer(1)])
      .unwrap();
    let rows = db.select("SELECT k FROM kv", &[]).unwrap();
    assert_eq!(rows, vec![vec![text(hostile)]]);
  }

  #[test]
  fn test_transaction_commit_and_rollback() {
    let db = store();

    let committed = db
      .with_transaction(|tx| {
        tx.execute("INSERT INTO kv (k, v) VALUES ('a', 1)", &[])?;
        Ok(true)
      })
      .unwrap();
    assert!(committed);

    let committed = db
      .with_transaction(|tx| {
        tx.execute("INSERT INTO kv (k, v) VALUES ('b', 2)", &[])?;
        Ok(false)
      })
      .unwrap();
    assert!(!committed);

    let failed = db.with_transaction(|tx| {
      tx.execute("INSERT INTO kv (k, v) VALUES ('c', 3)", &[])?;
      tx.execute("INSERT INTO kv (k, v) VALUES ('a', 9)", &[])?;
      Ok(true)
    });
    assert!(matches!(failed, Err(Error::CacheStore(_))));

    let rows = db.select("SELECT k FROM kv ORDER BY k", &[]).unwrap();
    assert_eq!(rows, vec![vec![text("a")]]);
  }

  #[test]
  fn test_last_error_message() {
    let db = store();
    assert!(db.last_error_message().is_none());
    assert!(db.select("SELECT * FROM missing", &[]).is_err());
    assert!(db
      .last_error_message()
      .is_some_and(|m| m.contains("missing")));
  }

  #[test]
  fn test_use_after_close() {
    let db = store();
    db.close().unwrap();
    assert!(db.is_closed());
    assert_eq!(db.select("SELECT 1", &[]), Err(Error::StoreClosed));
    assert_eq!(db.execute("DELETE FROM kv", &[]), Err(Error::StoreClosed));
    assert_eq!(db.with_transaction(|_| Ok(true)), Err(Error::StoreClosed));
    assert!(db.close().is_ok());
  }

  #[test]
  fn test_open_creates_parent_directories() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");
    let db = SqliteConnection::open(&path).unwrap();
    assert_eq!(db.path(), Some(path.as_path()));
    assert!(path.exists());
  }
}
