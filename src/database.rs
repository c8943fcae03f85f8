use std::path::Path;
use std::{fs, io};

use log::info;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension};

use crate::error::WebPulseError;
use crate::schema::{CREATE_SCHEMA_SQL, SCHEMA_VERSION};

const DB_FILENAME: &str = "webpulse.db";

/// Pooled handle to the webpulse database.
///
/// The pool is cheap to clone and share; every component receives a
/// `Database` (or a connection borrowed from one) as an explicit dependency
/// rather than reaching for ambient global state.
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

pub type DbConnection = PooledConnection<SqliteConnectionManager>;

impl Database {
    /// Open (or create) the database in the given folder and ensure the
    /// schema is current.
    pub fn open(db_folder: &Path) -> Result<Self, WebPulseError> {
        if !db_folder.exists() {
            fs::create_dir_all(db_folder)?;
        }
        if !db_folder.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("Database folder '{}' is not a directory", db_folder.display()),
            )
            .into());
        }

        let db_path = db_folder.join(DB_FILENAME);

        let manager = SqliteConnectionManager::file(&db_path).with_init(|c| {
            c.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
            )
        });

        let pool = Pool::builder().build(manager)?;

        let db = Database { pool };
        db.ensure_schema()?;

        info!("Database opened at: {}", db_path.display());
        Ok(db)
    }

    /// Borrow a connection from the pool.
    pub fn conn(&self) -> Result<DbConnection, WebPulseError> {
        Ok(self.pool.get()?)
    }

    /// Run `f` inside a BEGIN IMMEDIATE transaction.
    ///
    /// The immediate lock serializes writers up front, so status transitions
    /// and their audit events either land together or not at all.
    pub fn immediate_transaction<T, F>(conn: &Connection, f: F) -> Result<T, WebPulseError>
    where
        F: FnOnce(&Connection) -> Result<T, WebPulseError>,
    {
        conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(conn) {
            Ok(value) => {
                conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(err) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(err)
            }
        }
    }

    pub fn get_meta_value(conn: &Connection, key: &str) -> Result<Option<String>, WebPulseError> {
        let value = conn
            .query_row("SELECT value FROM meta WHERE key = ?", [key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn set_meta_value(conn: &Connection, key: &str, value: &str) -> Result<(), WebPulseError> {
        conn.execute(
            "INSERT INTO meta (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [key, value],
        )?;
        Ok(())
    }

    fn ensure_schema(&self) -> Result<(), WebPulseError> {
        let conn = self.conn()?;

        let table_exists: bool = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='meta'",
                [],
                |row| row.get::<_, i32>(0),
            )
            .map(|count| count > 0)
            .unwrap_or(false);

        if !table_exists {
            conn.execute_batch(CREATE_SCHEMA_SQL)?;
            Self::set_meta_value(&conn, "schema_version", SCHEMA_VERSION)?;
            return Ok(());
        }

        let stored_version = Self::get_meta_value(&conn, "schema_version")?;
        match stored_version.as_deref() {
            Some(SCHEMA_VERSION) => Ok(()),
            Some(other) => Err(WebPulseError::Error(format!(
                "Schema version mismatch: database has '{}', expected '{}'",
                other, SCHEMA_VERSION
            ))),
            None => Err(WebPulseError::Error("Schema version missing".to_string())),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_utils::test_db;
    use super::*;

    #[test]
    fn test_open_creates_schema() {
        let (_dir, db) = test_db();
        let conn = db.conn().unwrap();

        let version = Database::get_meta_value(&conn, "schema_version").unwrap();
        assert_eq!(version.as_deref(), Some(SCHEMA_VERSION));
    }

    #[test]
    fn test_reopen_existing_database() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let _db = Database::open(dir.path()).unwrap();
        }
        // Second open must accept the existing schema version
        let db = Database::open(dir.path()).unwrap();
        assert!(db.conn().is_ok());
    }

    #[test]
    fn test_meta_value_round_trip() {
        let (_dir, db) = test_db();
        let conn = db.conn().unwrap();

        assert_eq!(Database::get_meta_value(&conn, "missing").unwrap(), None);

        Database::set_meta_value(&conn, "k", "v1").unwrap();
        assert_eq!(
            Database::get_meta_value(&conn, "k").unwrap().as_deref(),
            Some("v1")
        );

        Database::set_meta_value(&conn, "k", "v2").unwrap();
        assert_eq!(
            Database::get_meta_value(&conn, "k").unwrap().as_deref(),
            Some("v2")
        );
    }

    #[test]
    fn test_immediate_transaction_rolls_back_on_error() {
        let (_dir, db) = test_db();
        let conn = db.conn().unwrap();

        let result: Result<(), WebPulseError> = Database::immediate_transaction(&conn, |c| {
            Database::set_meta_value(c, "tx_key", "tx_value")?;
            Err(WebPulseError::Error("boom".to_string()))
        });
        assert!(result.is_err());

        assert_eq!(Database::get_meta_value(&conn, "tx_key").unwrap(), None);
    }
}
