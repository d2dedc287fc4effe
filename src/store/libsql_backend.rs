//! libSQL backend: durable `RegistrationStore` implementation.
//!
//! Supports local file and in-memory databases. Schema changes go through
//! the version-tracked migrations below.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::store::traits::RegistrationStore;
use crate::types::{UnitId, Version};

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "worker_registrations",
    sql: r#"
        CREATE TABLE IF NOT EXISTS worker_registrations (
            unit_id TEXT PRIMARY KEY,
            version TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
    "#,
}];

/// libSQL registration store.
pub struct LibSqlRegistrationStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlRegistrationStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db)?;
        store.run_migrations().await?;
        info!(path = %path.display(), "Registration store opened");
        Ok(store)
    }

    /// Create an in-memory database.
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to create in-memory database: {e}")))?;

        let store = Self::from_database(db)?;
        store.run_migrations().await?;
        Ok(store)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            (),
        )
        .await
        .map_err(|e| StoreError::Migration(format!("Failed to create _migrations table: {e}")))?;

        let current_version = self.current_schema_version().await?;

        for migration in MIGRATIONS {
            if migration.version > current_version {
                info!(
                    version = migration.version,
                    name = migration.name,
                    "Applying migration"
                );
                conn.execute_batch(migration.sql).await.map_err(|e| {
                    StoreError::Migration(format!(
                        "Migration V{} ({}) failed: {e}",
                        migration.version, migration.name
                    ))
                })?;
                conn.execute(
                    "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
                    params![migration.version, migration.name],
                )
                .await
                .map_err(|e| {
                    StoreError::Migration(format!(
                        "Failed to record migration V{}: {e}",
                        migration.version
                    ))
                })?;
            }
        }

        Ok(())
    }

    /// Highest applied migration version, or 0 if none.
    pub async fn current_schema_version(&self) -> Result<i64, StoreError> {
        let mut rows = self
            .conn()
            .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
            .await
            .map_err(|e| StoreError::Migration(format!("Failed to query migration version: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row.get::<i64>(0).map_err(|e| {
                StoreError::Migration(format!("Failed to parse migration version: {e}"))
            }),
            Ok(None) => Ok(0),
            Err(e) => Err(StoreError::Migration(format!(
                "Failed to read migration version: {e}"
            ))),
        }
    }
}

#[async_trait]
impl RegistrationStore for LibSqlRegistrationStore {
    async fn read_version(&self, unit: &UnitId) -> Result<Option<Version>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT version FROM worker_registrations WHERE unit_id = ?1",
                params![unit.as_str()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("read_version: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let raw: String = row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("read_version row parse: {e}")))?;
                match raw.parse::<Version>() {
                    Ok(version) => Ok(Some(version)),
                    Err(e) => {
                        warn!(unit = %unit, stored = %raw, "Ignoring unparsable stored version: {}", e);
                        Ok(None)
                    }
                }
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("read_version: {e}"))),
        }
    }

    async fn write_version(&self, unit: &UnitId, version: &Version) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO worker_registrations (unit_id, version, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(unit_id) DO UPDATE SET version = excluded.version,
                                                    updated_at = excluded.updated_at",
                params![unit.as_str(), version.to_string(), now],
            )
            .await
            .map_err(|e| StoreError::Query(format!("write_version: {e}")))?;
        Ok(())
    }

    async fn clear(&self, unit: &UnitId) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "DELETE FROM worker_registrations WHERE unit_id = ?1",
                params![unit.as_str()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("clear: {e}")))?;
        Ok(())
    }
}
