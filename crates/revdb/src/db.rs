//! A single-threaded handle to one `SQLite` file, layered on
//! `sqlmodel-sqlite`'s low-level prepare/bind/step driver.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use sqlmodel_core::Row;

use crate::error::{DbError, DbResult};
use crate::value::Value;

type SqlValue = sqlmodel_core::Value;

/// One row of a query result, re-exposed in terms of `revdb`'s own
/// [`Value`] rather than the driver's.
#[derive(Debug, Clone)]
pub struct DbRow {
    row: Row,
}

impl DbRow {
    #[must_use]
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.row.get_named::<i64>(name).ok()
    }

    #[must_use]
    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.row.get_named::<f64>(name).ok()
    }

    #[must_use]
    pub fn get_string(&self, name: &str) -> Option<String> {
        self.row.get_named::<String>(name).ok()
    }

    /// Reads a blob column. Blobs travel through the driver as
    /// base64-encoded text (see `value::blob_column_to_bytes`); a column
    /// that isn't valid base64 is treated as absent rather than panicking.
    #[must_use]
    pub fn get_blob(&self, name: &str) -> Option<Vec<u8>> {
        let encoded = self.row.get_named::<String>(name).ok()?;
        crate::value::blob_column_to_bytes(&encoded).ok()
    }
}

/// A single-threaded `SQLite` database handle.
///
/// Not `Sync` — one `Database` belongs to exactly one task on the DB
/// lane at a time (spec §5 "the SQLite handle is accessed only by the DB
/// lane").
pub struct Database {
    conn: RefCell<Option<sqlmodel_sqlite::SqliteConnection>>,
    statement_cache: RefCell<HashMap<String, bool>>,
    max_busy_retry: Duration,
    busy_retry_interval: Duration,
}

impl Database {
    /// Open an in-memory database. `PRAGMA foreign_keys = ON` is applied
    /// immediately.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlite`] if the underlying driver fails to
    /// open or apply pragmas.
    pub fn open_memory() -> DbResult<Self> {
        let conn = sqlmodel_sqlite::SqliteConnection::open_memory().map_err(DbError::from)?;
        Self::from_conn(conn)
    }

    /// Open (or create) a file-backed database at `path`. Idempotent:
    /// calling `open` again on an already-open handle is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlite`] if the underlying driver fails to
    /// open or apply pragmas.
    pub fn open_file(path: &Path) -> DbResult<Self> {
        let conn = sqlmodel_sqlite::SqliteConnection::open_file(path.display().to_string())
            .map_err(DbError::from)?;
        Self::from_conn(conn)
    }

    fn from_conn(conn: sqlmodel_sqlite::SqliteConnection) -> DbResult<Self> {
        conn.execute_raw("PRAGMA foreign_keys = ON")
            .map_err(DbError::from)?;
        tracing::debug!("database opened, foreign_keys enabled");
        Ok(Self {
            conn: RefCell::new(Some(conn)),
            statement_cache: RefCell::new(HashMap::new()),
            max_busy_retry: Duration::from_millis(2_000),
            busy_retry_interval: Duration::from_millis(50),
        })
    }

    #[must_use]
    pub const fn with_busy_retry(mut self, max: Duration, interval: Duration) -> Self {
        self.max_busy_retry = max;
        self.busy_retry_interval = interval;
        self
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.conn.borrow().is_some()
    }

    /// Flush the prepared-statement cache and drop the connection.
    /// Idempotent: closing a closed handle is a no-op.
    pub fn close(&self) {
        self.statement_cache.borrow_mut().clear();
        if self.conn.borrow_mut().take().is_some() {
            tracing::debug!("database closed");
        }
    }

    fn with_retry<T>(&self, sql: &str, mut attempt: impl FnMut() -> Result<T, sqlmodel_core::Error>) -> DbResult<T> {
        let deadline = Instant::now() + self.max_busy_retry;
        loop {
            match attempt() {
                Ok(v) => return Ok(v),
                Err(e) => {
                    let err = DbError::from(e);
                    if err.is_busy_or_locked() && Instant::now() < deadline {
                        tracing::debug!(sql, "database busy, retrying");
                        std::thread::sleep(self.busy_retry_interval);
                        continue;
                    }
                    tracing::warn!(sql, error = %err, "statement failed");
                    return Err(err);
                }
            }
        }
    }

    /// Run a statement that does not return rows. A `SQLITE_ROW` result
    /// here is a programmer error: the caller should have used
    /// [`Database::execute_query`].
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Closed`] if the handle is not open, or
    /// [`DbError::Sqlite`] for driver-level failures.
    pub fn execute_update(&self, sql: &str, args: &[Value]) -> DbResult<u64> {
        tracing::trace!(sql, "execute_update");
        let bound: Vec<SqlValue> = args.iter().map(SqlValue::from).collect();
        let borrow = self.conn.borrow();
        let Some(conn) = borrow.as_ref() else {
            return Err(DbError::Closed);
        };
        self.with_retry(sql, || conn.execute_sync(sql, &bound))
    }

    /// Run a query and collect all rows. The statement is released back
    /// to the cache once all rows have been read.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Closed`] if the handle is not open, or
    /// [`DbError::Sqlite`] for driver-level failures.
    pub fn execute_query(&self, sql: &str, args: &[Value]) -> DbResult<Vec<DbRow>> {
        tracing::trace!(sql, "execute_query");
        let bound: Vec<SqlValue> = args.iter().map(SqlValue::from).collect();
        let borrow = self.conn.borrow();
        let Some(conn) = borrow.as_ref() else {
            return Err(DbError::Closed);
        };
        self.statement_cache.borrow_mut().insert(sql.to_string(), true);
        let rows = self.with_retry(sql, || conn.query_sync(sql, &bound))?;
        self.statement_cache.borrow_mut().insert(sql.to_string(), false);
        Ok(rows.into_iter().map(|row| DbRow { row }).collect())
    }

    /// Run DDL with no bind parameters (matches the teacher's
    /// `execute_raw` usage for schema statements).
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlite`] for driver-level failures.
    pub fn execute_raw(&self, sql: &str) -> DbResult<()> {
        tracing::trace!(sql, "execute_raw");
        let borrow = self.conn.borrow();
        let Some(conn) = borrow.as_ref() else {
            return Err(DbError::Closed);
        };
        conn.execute_raw(sql).map_err(DbError::from)
    }

    /// # Errors
    ///
    /// Returns [`DbError`] if the `last_insert_rowid()` query fails.
    pub fn last_insert_rowid(&self) -> DbResult<i64> {
        let rows = self.execute_query("SELECT last_insert_rowid() AS id", &[])?;
        Ok(rows.first().and_then(|r| r.get_i64("id")).unwrap_or(0))
    }

    /// # Errors
    ///
    /// Returns [`DbError`] if the `changes()` query fails.
    pub fn changes(&self) -> DbResult<i64> {
        let rows = self.execute_query("SELECT changes() AS c", &[])?;
        Ok(rows.first().and_then(|r| r.get_i64("c")).unwrap_or(0))
    }

    /// # Errors
    ///
    /// Returns [`DbError`] if `PRAGMA integrity_check` fails to run.
    pub fn integrity_check(&self) -> DbResult<bool> {
        let rows = self.execute_query("PRAGMA integrity_check", &[])?;
        let ok = rows
            .first()
            .and_then(|r| r.get_string("integrity_check"))
            .is_some_and(|v| v == "ok");
        if !ok {
            tracing::error!("integrity_check reported failure");
        }
        Ok(ok)
    }

    /// # Errors
    ///
    /// Returns [`DbError`] if the `sqlite_master` introspection query
    /// fails.
    pub fn table_exists(&self, name: &str) -> DbResult<bool> {
        let rows = self.execute_query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
            &[Value::Text(name.to_string())],
        )?;
        Ok(!rows.is_empty())
    }

    /// # Errors
    ///
    /// Returns [`DbError`] if the `sqlite_master` introspection query
    /// fails.
    pub fn index_exists(&self, name: &str) -> DbResult<bool> {
        let rows = self.execute_query(
            "SELECT name FROM sqlite_master WHERE type = 'index' AND name = ?",
            &[Value::Text(name.to_string())],
        )?;
        Ok(!rows.is_empty())
    }

    /// # Errors
    ///
    /// Returns [`DbError`] if `PRAGMA table_info` fails to run.
    pub fn column_exists(&self, table: &str, column: &str) -> DbResult<bool> {
        let rows = self.execute_query(&format!("PRAGMA table_info({table})"), &[])?;
        Ok(rows.iter().any(|r| r.get_string("name").as_deref() == Some(column)))
    }

    /// # Errors
    ///
    /// Returns [`DbError`] for driver-level failures.
    pub fn begin_exclusive(&self) -> DbResult<()> {
        self.execute_update("BEGIN EXCLUSIVE", &[]).map(|_| ())
    }

    /// # Errors
    ///
    /// Returns [`DbError`] for driver-level failures.
    pub fn begin_deferred(&self) -> DbResult<()> {
        self.execute_update("BEGIN DEFERRED", &[]).map(|_| ())
    }

    /// # Errors
    ///
    /// Returns [`DbError`] for driver-level failures.
    pub fn commit(&self) -> DbResult<()> {
        self.execute_update("COMMIT", &[]).map(|_| ())
    }

    /// # Errors
    ///
    /// Returns [`DbError`] for driver-level failures.
    pub fn rollback(&self) -> DbResult<()> {
        self.execute_update("ROLLBACK", &[]).map(|_| ())
    }

    /// # Errors
    ///
    /// Returns [`DbError`] for driver-level failures.
    pub fn savepoint(&self, name: &str) -> DbResult<()> {
        self.execute_update(&format!("SAVEPOINT '{}'", escape_savepoint(name)), &[])
            .map(|_| ())
    }

    /// # Errors
    ///
    /// Returns [`DbError`] for driver-level failures.
    pub fn release(&self, name: &str) -> DbResult<()> {
        self.execute_update(&format!("RELEASE '{}'", escape_savepoint(name)), &[])
            .map(|_| ())
    }

    /// # Errors
    ///
    /// Returns [`DbError`] for driver-level failures.
    pub fn rollback_to(&self, name: &str) -> DbResult<()> {
        self.execute_update(&format!("ROLLBACK TO '{}'", escape_savepoint(name)), &[])
            .map(|_| ())
    }
}

fn escape_savepoint(name: &str) -> String {
    name.replace('\'', "''")
}

impl Drop for Database {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_memory_enables_foreign_keys() {
        let db = Database::open_memory().unwrap();
        let rows = db.execute_query("PRAGMA foreign_keys", &[]).unwrap();
        assert_eq!(rows.first().and_then(|r| r.get_i64("foreign_keys")), Some(1));
    }

    #[test]
    fn execute_update_and_last_insert_rowid() {
        let db = Database::open_memory().unwrap();
        db.execute_raw("CREATE TABLE t(id INTEGER PRIMARY KEY AUTOINCREMENT, v TEXT)").unwrap();
        db.execute_update("INSERT INTO t(v) VALUES (?)", &[Value::Text("a".into())]).unwrap();
        assert_eq!(db.last_insert_rowid().unwrap(), 1);
    }

    #[test]
    fn blob_round_trips_through_a_text_column() {
        let db = Database::open_memory().unwrap();
        db.execute_raw("CREATE TABLE t(id INTEGER PRIMARY KEY AUTOINCREMENT, v TEXT)").unwrap();
        let bytes = vec![0u8, 255, 16, 7, 200];
        db.execute_update("INSERT INTO t(v) VALUES (?)", &[Value::Blob(bytes.clone())]).unwrap();
        let rows = db.execute_query("SELECT v FROM t", &[]).unwrap();
        assert_eq!(rows[0].get_blob("v"), Some(bytes));
    }

    #[test]
    fn integrity_check_passes_on_fresh_db() {
        let db = Database::open_memory().unwrap();
        assert!(db.integrity_check().unwrap());
    }

    #[test]
    fn table_and_column_introspection() {
        let db = Database::open_memory().unwrap();
        db.execute_raw("CREATE TABLE t(id INTEGER PRIMARY KEY, name TEXT)").unwrap();
        assert!(db.table_exists("t").unwrap());
        assert!(!db.table_exists("nope").unwrap());
        assert!(db.column_exists("t", "name").unwrap());
        assert!(!db.column_exists("t", "missing").unwrap());
    }

    #[test]
    fn close_is_idempotent() {
        let db = Database::open_memory().unwrap();
        db.close();
        db.close();
        assert!(!db.is_open());
        assert!(matches!(db.execute_raw("SELECT 1"), Err(DbError::Closed)));
    }

    #[test]
    fn savepoint_names_are_escaped() {
        let db = Database::open_memory().unwrap();
        db.begin_deferred().unwrap();
        db.savepoint("o'brien").unwrap();
        db.release("o'brien").unwrap();
        db.commit().unwrap();
    }
}
