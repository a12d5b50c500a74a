pub mod migration;
pub mod ops;
pub mod schema;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, Transaction};
use shipr_core::error::ShiprError;

/// Open (or create) the shipr database at the given path and run migrations.
pub fn open_db(path: &Path) -> anyhow::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    migration::run_migrations(&conn)?;
    Ok(conn)
}

/// Open an in-memory database for testing.
pub fn open_memory_db() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    migration::run_migrations(&conn)?;
    Ok(conn)
}

/// Shared handle to the activity store.
///
/// The connection sits behind a mutex; callers get it only for the duration
/// of a synchronous closure, so the lock is never held across an `.await`.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    pub fn open(path: &Path) -> Result<Self, ShiprError> {
        open_db(path).map(Self::new).map_err(database_error)
    }

    pub fn open_memory() -> Result<Self, ShiprError> {
        open_memory_db().map(Self::new).map_err(database_error)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, ShiprError> {
        self.conn
            .lock()
            .map_err(|_| ShiprError::Database("store lock poisoned".to_string()))
    }

    /// Run `f` against the connection.
    pub fn read<T>(
        &self,
        f: impl FnOnce(&Connection) -> anyhow::Result<T>,
    ) -> Result<T, ShiprError> {
        let conn = self.lock()?;
        f(&conn).map_err(database_error)
    }

    /// Run `f` inside a transaction, committing only if it succeeds.
    pub fn write<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> anyhow::Result<T>,
    ) -> Result<T, ShiprError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(|e| database_error(e.into()))?;
        let value = f(&tx).map_err(database_error)?;
        tx.commit().map_err(|e| database_error(e.into()))?;
        Ok(value)
    }
}

fn database_error(err: anyhow::Error) -> ShiprError {
    ShiprError::Database(format!("{err:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_rolls_back_on_error() {
        let store = Store::open_memory().unwrap();
        let result: Result<(), ShiprError> = store.write(|tx| {
            tx.execute(
                "INSERT INTO teams (id, tenant_id, name) VALUES ('t1', 'acme', 'core')",
                [],
            )?;
            anyhow::bail!("abort")
        });
        assert!(matches!(result, Err(ShiprError::Database(_))));

        let count: i64 = store
            .read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM teams", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("shipr.db")).unwrap();
        let version: i64 = store
            .read(|conn| {
                Ok(conn.query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(version, 1);
    }
}
