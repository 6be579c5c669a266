//! Database connection management
//!
//! A single SQLite connection guarded by a mutex. File databases run in WAL
//! mode; in-memory databases are used by tests and benchmarks.

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::Arc;

use super::migrations::run_migrations;
use super::queries;
use super::ChatStore;
use crate::error::Result;
use crate::types::{Chat, StorageConfig};

/// Storage engine wrapping SQLite
#[derive(Clone)]
pub struct Storage {
    config: StorageConfig,
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    /// Open or create a database with the given configuration
    pub fn open(config: StorageConfig) -> Result<Self> {
        let conn = Self::create_connection(&config)?;

        run_migrations(&conn)?;

        Ok(Self {
            config,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::open(StorageConfig::default())
    }

    fn create_connection(config: &StorageConfig) -> Result<Connection> {
        if config.db_path == ":memory:" {
            return Ok(Connection::open_in_memory()?);
        }

        if let Some(parent) = Path::new(&config.db_path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&config.db_path, flags)?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=30000;
            PRAGMA temp_store=MEMORY;
            "#,
        )?;

        Ok(conn)
    }

    /// Execute a function with the connection
    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Execute a function with a transaction
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Get the storage configuration
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Number of stored chats
    pub fn chat_count(&self) -> Result<i64> {
        self.with_connection(queries::count_chats)
    }
}

impl ChatStore for Storage {
    fn append(&self, content: &str) -> Result<Chat> {
        self.with_transaction(|conn| queries::create_chat(conn, content))
    }

    fn list(&self) -> Result<Vec<Chat>> {
        self.with_connection(queries::list_chats)
    }

    fn count(&self) -> Result<i64> {
        self.chat_count()
    }
}
