//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.
//! On first run against a database that still carries the legacy
//! `lead_status` table, its rows are imported into `stage_cache`.

use libsql::Connection;

use crate::error::StoreError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "stage_cache",
        sql: r#"
            CREATE TABLE IF NOT EXISTS stage_cache (
                tenant_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                stage TEXT NOT NULL CHECK (stage IN ('new', 'engaged', 'hot')),
                watermark INTEGER NOT NULL DEFAULT 0 CHECK (watermark >= 0),
                last_author_is_tenant INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (tenant_id, conversation_id)
            );
            CREATE INDEX IF NOT EXISTS idx_stage_cache_stage
                ON stage_cache(tenant_id, stage);
        "#,
    },
    Migration {
        version: 2,
        name: "stage_cache_recency_index",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_stage_cache_updated
                ON stage_cache(tenant_id, updated_at DESC);
        "#,
    },
    Migration {
        version: 3,
        name: "stage_cache_rfc3339_timestamps",
        sql: r#"
            UPDATE stage_cache
               SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', updated_at)
             WHERE updated_at NOT LIKE '%T%'
               AND strftime('%Y-%m-%dT%H:%M:%fZ', updated_at) IS NOT NULL;
        "#,
    },
];

/// Copies legacy rows, mapping free-text stage labels onto the three stages.
/// Timestamps are rewritten as RFC 3339 so they sort with native rows.
/// Existing `stage_cache` rows win.
const IMPORT_LEAD_STATUS: &str = r#"
    INSERT OR IGNORE INTO stage_cache
        (tenant_id, conversation_id, stage, watermark, last_author_is_tenant, updated_at)
    SELECT
        instance_id,
        chatid,
        CASE
            WHEN lower(trim(stage)) LIKE 'contato%' THEN 'new'
            WHEN lower(stage) LIKE '%quente%' OR lower(stage) LIKE '%hot%' THEN 'hot'
            WHEN lower(trim(stage)) IN ('lead', 'lead_qualificado', 'engaged') THEN 'engaged'
            ELSE 'new'
        END,
        MAX(COALESCE(last_msg_ts, 0), 0),
        CASE WHEN last_from_me THEN 1 ELSE 0 END,
        COALESCE(strftime('%Y-%m-%dT%H:%M:%fZ', updated_at), strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
    FROM lead_status
    WHERE COALESCE(instance_id, '') <> '' AND COALESCE(chatid, '') <> ''
"#;

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
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

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
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
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    if current_version == 0 && table_exists(conn, "lead_status").await? {
        let imported = conn
            .execute(IMPORT_LEAD_STATUS, ())
            .await
            .map_err(|e| StoreError::Migration(format!("Failed to import lead_status: {e}")))?;
        tracing::info!(rows = imported, "Imported legacy lead_status rows");
    }

    let version = get_current_version(conn).await?;
    tracing::info!("Database migrations complete (at V{version})");

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, StoreError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| StoreError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| StoreError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                StoreError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

async fn table_exists(conn: &Connection, name: &str) -> Result<bool, StoreError> {
    let mut rows = conn
        .query(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
            libsql::params![name],
        )
        .await
        .map_err(|e| StoreError::Query(format!("Failed to check for table {name}: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| StoreError::Query(format!("Failed to read table check: {e}")))?;

    match row {
        Some(row) => {
            let count: i64 = row.get(0).unwrap_or(0);
            Ok(count > 0)
        }
        None => Ok(false),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| StoreError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
