//! Schema versions.
//!
//! Migrations are applied in order, forward only, each exactly once. The
//! `schema_versions` table is the ledger of what has been applied.

use crate::error::{StoreError, StoreResult};
use chrono::Utc;
use rusqlite::{params, Connection};

/// Ordered schema migrations; version N is `MIGRATIONS[N - 1]`.
const MIGRATIONS: &[&str] = &[
    // 1: catalog and migration state
    "CREATE TABLE batches (
        name TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        data TEXT NOT NULL
    );
    CREATE TABLE instances (
        uuid TEXT PRIMARY KEY,
        source TEXT NOT NULL,
        batch TEXT,
        migration_status TEXT NOT NULL,
        data TEXT NOT NULL
    );
    CREATE INDEX idx_instances_batch ON instances(batch);
    CREATE INDEX idx_instances_source ON instances(source);
    CREATE TABLE queue (
        instance_uuid TEXT PRIMARY KEY REFERENCES instances(uuid),
        batch_name TEXT NOT NULL REFERENCES batches(name),
        migration_status TEXT NOT NULL,
        secret_token TEXT NOT NULL UNIQUE,
        data TEXT NOT NULL
    );
    CREATE INDEX idx_queue_batch ON queue(batch_name);
    CREATE TABLE sources (
        name TEXT PRIMARY KEY,
        data TEXT NOT NULL
    );
    CREATE TABLE targets (
        name TEXT PRIMARY KEY,
        data TEXT NOT NULL
    );
    CREATE TABLE networks (
        identifier TEXT NOT NULL,
        location TEXT NOT NULL,
        source TEXT NOT NULL,
        data TEXT NOT NULL,
        PRIMARY KEY (identifier, location)
    );
    CREATE INDEX idx_networks_source ON networks(source);",
    // 2: artifact catalog
    "CREATE TABLE artifacts (
        uuid TEXT PRIMARY KEY,
        artifact_type TEXT NOT NULL,
        data TEXT NOT NULL
    );
    CREATE INDEX idx_artifacts_type ON artifacts(artifact_type);",
    // 3: tokens ever issued, so a token is never handed out twice
    "CREATE TABLE issued_tokens (
        token TEXT PRIMARY KEY,
        instance_uuid TEXT NOT NULL
    );",
];

/// Latest schema version known to this build.
pub fn latest_version() -> usize {
    MIGRATIONS.len()
}

/// Returns the highest applied version, 0 for a fresh database.
pub fn current_version(conn: &Connection) -> StoreResult<usize> {
    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_versions",
        [],
        |row| row.get(0),
    )?;
    Ok(version as usize)
}

/// Brings the database up to [`latest_version`].
///
/// Each migration runs in its own transaction together with its ledger row.
pub fn apply(conn: &mut Connection) -> StoreResult<usize> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_versions (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
        [],
    )?;

    let current = current_version(conn)?;
    if current > latest_version() {
        return Err(StoreError::Schema {
            version: current,
            message: format!(
                "database is newer than this build (latest known version {})",
                latest_version()
            ),
        });
    }

    for (index, sql) in MIGRATIONS.iter().enumerate().skip(current) {
        let version = index + 1;
        let tx = conn.transaction()?;
        tx.execute_batch(sql).map_err(|e| StoreError::Schema {
            version,
            message: e.to_string(),
        })?;
        tx.execute(
            "INSERT INTO schema_versions (version, applied_at) VALUES (?1, ?2)",
            params![version as i64, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        tracing::info!(version, "Applied schema migration");
    }

    Ok(latest_version())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(apply(&mut conn).unwrap(), latest_version());
        assert_eq!(apply(&mut conn).unwrap(), latest_version());

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_versions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows as usize, latest_version());
    }

    #[test]
    fn test_newer_database_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO schema_versions (version, applied_at) VALUES (?1, 'later')",
            params![latest_version() as i64 + 1],
        )
        .unwrap();

        assert!(matches!(apply(&mut conn), Err(StoreError::Schema { .. })));
    }
}
