//! `DuckDB` connection pool management.
//!
//! All pooled connections are clones of one root connection, so they share a
//! single database instance (and therefore work for in-memory databases too).
//! Temporary relations stay private to the connection that created them.

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ::duckdb::Connection;

/// Where the database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    /// A database file on disk.
    File(PathBuf),
    /// A private in-memory database, discarded when the pool is dropped.
    InMemory,
}

struct PoolInner {
    location: DatabaseLocation,
    max_pool_size: usize,
    root: Mutex<Connection>,
    idle: Mutex<Vec<Connection>>,
}

/// A connection pool manager for `DuckDB` connections.
#[derive(Clone)]
pub struct DuckDbConnectionManager {
    inner: Arc<PoolInner>,
}

impl DuckDbConnectionManager {
    /// Open the database and create a pool around it.
    ///
    /// # Arguments
    /// * `location` - Database file or in-memory
    /// * `max_pool_size` - Maximum number of idle connections kept for reuse
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or configured.
    pub fn open(location: DatabaseLocation, max_pool_size: usize) -> Result<Self, ::duckdb::Error> {
        let root = match &location {
            DatabaseLocation::File(path) => Connection::open(path)?,
            DatabaseLocation::InMemory => Connection::open_in_memory()?,
        };
        configure_connection(&root)?;

        Ok(Self {
            inner: Arc::new(PoolInner {
                location,
                max_pool_size: max_pool_size.max(1),
                root: Mutex::new(root),
                idle: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Acquire a connection from the pool.
    ///
    /// # Errors
    /// Returns an error if a new connection cannot be cloned from the root
    /// connection or configured.
    ///
    /// # Panics
    /// Panics if a pool mutex is poisoned (indicating a previous panic while
    /// holding the lock).
    pub fn acquire(&self) -> Result<PooledConnection, ::duckdb::Error> {
        let idle = self
            .inner
            .idle
            .lock()
            .expect("duckdb connection pool mutex poisoned")
            .pop();

        let connection = match idle {
            Some(connection) => connection,
            None => {
                let root = self
                    .inner
                    .root
                    .lock()
                    .expect("duckdb root connection mutex poisoned");
                let connection = root.try_clone()?;
                drop(root);
                configure_connection(&connection)?;
                connection
            }
        };

        Ok(PooledConnection {
            pool: Arc::clone(&self.inner),
            connection: Some(connection),
        })
    }

    /// Get the path to the database file, if the database is file-backed.
    #[must_use]
    pub fn db_path(&self) -> Option<&Path> {
        match &self.inner.location {
            DatabaseLocation::File(path) => Some(path.as_path()),
            DatabaseLocation::InMemory => None,
        }
    }
}

/// A pooled connection that returns to the pool when dropped.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    connection: Option<Connection>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.connection
            .as_ref()
            .expect("pooled connection unexpectedly missing")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection
            .as_mut()
            .expect("pooled connection unexpectedly missing")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };

        let mut idle = self
            .pool
            .idle
            .lock()
            .expect("duckdb connection pool mutex poisoned");
        if idle.len() < self.pool.max_pool_size {
            idle.push(connection);
        }
    }
}

/// Configure a database connection with appropriate settings.
///
/// # Errors
/// Returns an error if configuration SQL fails to execute.
fn configure_connection(connection: &Connection) -> Result<(), ::duckdb::Error> {
    connection.execute_batch("PRAGMA disable_progress_bar;")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pooled_connections_share_one_in_memory_database() {
        let manager = DuckDbConnectionManager::open(DatabaseLocation::InMemory, 2).expect("open");

        let writer = manager.acquire().expect("writer");
        let reader = manager.acquire().expect("reader");
        writer
            .execute_batch("CREATE TABLE shared (id INTEGER); INSERT INTO shared VALUES (1), (2);")
            .expect("create");

        let count: i64 = reader
            .query_row("SELECT COUNT(*) FROM shared", [], |row| row.get(0))
            .expect("count");
        assert_eq!(count, 2);
        assert!(manager.db_path().is_none());
    }

    #[test]
    fn released_connection_is_reused() {
        let manager = DuckDbConnectionManager::open(DatabaseLocation::InMemory, 1).expect("open");

        {
            let connection = manager.acquire().expect("acquire");
            connection
                .execute_batch("CREATE TEMP TABLE scratch_marker (id INTEGER);")
                .expect("temp table");
        }

        // Temp relations are connection-local, so seeing it proves reuse.
        let connection = manager.acquire().expect("acquire again");
        let count: i64 = connection
            .query_row(
                "SELECT COUNT(*) FROM duckdb_tables() WHERE temporary AND table_name = 'scratch_marker'",
                [],
                |row| row.get(0),
            )
            .expect("lookup");
        assert_eq!(count, 1);
    }
}
