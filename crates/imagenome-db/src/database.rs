//! libSQL database handle.
//!
//! A single embedded connection is shared behind an async mutex: writes are
//! serialized, and each store method holds the lock for its whole
//! transaction so no other statement interleaves with it.

use std::path::Path;

use libsql::{params, Connection};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::{DbError, Result};
use crate::schema;

pub struct Database {
    #[allow(dead_code)]
    db: libsql::Database,
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database file at `path` and apply migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let db = libsql::Builder::new_local(path).build().await?;
        let database = Self::from_db(db)?;
        database.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(database)
    }

    /// Fresh in-memory database, used by tests and dry runs.
    pub async fn open_in_memory() -> Result<Self> {
        let db = libsql::Builder::new_local(":memory:").build().await?;
        let database = Self::from_db(db)?;
        database.run_migrations().await?;
        Ok(database)
    }

    fn from_db(db: libsql::Database) -> Result<Self> {
        let conn = db.connect()?;
        Ok(Self { db, conn: Mutex::new(conn) })
    }

    /// Exclusive access to the connection.
    pub(crate) async fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    async fn schema_version(&self) -> u32 {
        let conn = self.conn().await;
        match conn.query("SELECT MAX(version) FROM schema_migrations", params![]).await {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<i64>(0).map(|v| v as u32).unwrap_or(0),
                _ => 0,
            },
            // Table does not exist yet.
            Err(_) => 0,
        }
    }

    async fn run_migrations(&self) -> Result<()> {
        let current = self.schema_version().await;
        let conn = self.conn().await;
        for migration in schema::all_migrations() {
            if migration.version <= current {
                continue;
            }
            info!(version = migration.version, description = migration.description, "Applying migration");
            conn.execute_batch(migration.sql)
                .await
                .map_err(|e| DbError::Migration { version: migration.version, message: e.to_string() })?;
        }
        debug!(from = current, "Schema up to date");
        Ok(())
    }
}
