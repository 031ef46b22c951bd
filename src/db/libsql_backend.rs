//! libSQL backend for the `InstanceStore` trait.
//!
//! Embedded SQLite-compatible file; no server needed. In-memory libSQL
//! databases are connection-local, so tests use a temp file instead.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};

use crate::db::InstanceStore;
use crate::error::DatabaseError;
use crate::registry::{Instance, InstanceStatus};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS instances (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    version TEXT NOT NULL,
    host_port INTEGER NOT NULL,
    status TEXT NOT NULL,
    data_path TEXT NOT NULL,
    created_at TEXT NOT NULL,
    cleanup_pending INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_instances_name ON instances (name);
CREATE INDEX IF NOT EXISTS idx_instances_status ON instances (status);
";

/// Explicit column list (matches positional access in `row_to_instance`).
const INSTANCE_COLUMNS: &str =
    "id, name, version, host_port, status, data_path, created_at, cleanup_pending";

/// libSQL database backend.
pub struct LibSqlBackend {
    db: Arc<LibSqlDatabase>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {}", e))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {}", e)))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Create a new connection to the database.
    ///
    /// Sets `PRAGMA busy_timeout = 5000` on every connection so concurrent
    /// writers wait instead of failing with "database is locked".
    pub async fn connect(&self) -> Result<Connection, DatabaseError> {
        let conn = self
            .db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {}", e)))?;
        conn.query("PRAGMA busy_timeout = 5000", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to set busy_timeout: {}", e)))?;
        Ok(conn)
    }
}

/// Parse a stored timestamp. RFC 3339 is the write format; naive SQLite
/// `datetime()` output is accepted too.
fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(ndt.and_utc());
    }
    Err(format!("unparseable timestamp: {:?}", s))
}

/// RFC 3339 with millisecond precision.
fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn get_text(row: &libsql::Row, idx: i32) -> String {
    row.get::<String>(idx).unwrap_or_default()
}

fn get_i64(row: &libsql::Row, idx: i32) -> i64 {
    row.get::<i64>(idx).unwrap_or(0)
}

fn row_to_instance(row: &libsql::Row) -> Result<Instance, DatabaseError> {
    let id = get_text(row, 0);
    let corrupt = |reason: String| DatabaseError::Corrupt {
        id: id.clone(),
        reason,
    };

    let host_port = u16::try_from(get_i64(row, 3))
        .map_err(|_| corrupt(format!("host_port {} out of range", get_i64(row, 3))))?;
    let status: InstanceStatus = get_text(row, 4).parse().map_err(&corrupt)?;
    let created_at = parse_timestamp(&get_text(row, 6)).map_err(&corrupt)?;

    Ok(Instance {
        id: id.clone(),
        name: get_text(row, 1),
        version: get_text(row, 2),
        host_port,
        status,
        data_path: PathBuf::from(get_text(row, 5)),
        created_at,
        cleanup_pending: get_i64(row, 7) != 0,
    })
}

#[async_trait]
impl InstanceStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.query("PRAGMA journal_mode=WAL", ())
            .await
            .map_err(|e| DatabaseError::Migration(format!("Failed to enable WAL mode: {}", e)))?;
        conn.execute_batch(SCHEMA)
            .await
            .map_err(|e| DatabaseError::Migration(format!("libSQL migration failed: {}", e)))?;
        Ok(())
    }

    async fn upsert_instance(&self, instance: &Instance) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            r#"
                INSERT INTO instances (
                    id, name, version, host_port, status, data_path, created_at, cleanup_pending
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT (id) DO UPDATE SET
                    name = excluded.name,
                    version = excluded.version,
                    host_port = excluded.host_port,
                    status = excluded.status,
                    data_path = excluded.data_path,
                    cleanup_pending = excluded.cleanup_pending
                "#,
            params![
                instance.id.as_str(),
                instance.name.as_str(),
                instance.version.as_str(),
                instance.host_port as i64,
                instance.status.as_str(),
                instance.data_path.to_string_lossy().to_string(),
                fmt_ts(&instance.created_at),
                instance.cleanup_pending as i64,
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }

    async fn update_status(
        &self,
        id: &str,
        status: InstanceStatus,
        cleanup_pending: bool,
    ) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                "UPDATE instances SET status = ?2, cleanup_pending = ?3 WHERE id = ?1",
                params![id, status.as_str(), cleanup_pending as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(changed > 0)
    }

    async fn get_instance(&self, id: &str) -> Result<Option<Instance>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {} FROM instances WHERE id = ?1", INSTANCE_COLUMNS),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => Ok(Some(row_to_instance(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_active_by_name(&self, name: &str) -> Result<Option<Instance>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {} FROM instances WHERE name = ?1 AND status != 'removed' \
                     ORDER BY created_at DESC LIMIT 1",
                    INSTANCE_COLUMNS
                ),
                params![name],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => Ok(Some(row_to_instance(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_instances(&self) -> Result<Vec<Instance>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {} FROM instances ORDER BY created_at DESC",
                    INSTANCE_COLUMNS
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        let mut instances = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            instances.push(row_to_instance(&row)?);
        }
        Ok(instances)
    }
}
