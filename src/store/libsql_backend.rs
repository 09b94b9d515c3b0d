//! libSQL backend: async `StageStore` implementation.
//!
//! Supports local file and in-memory databases. The watermark merge runs
//! inside a single `INSERT … ON CONFLICT DO UPDATE`, so concurrent
//! classification passes for one conversation cannot lose an update.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::params::Params;
use libsql::{Connection, Database as LibSqlDatabase, Value, params};
use tracing::{debug, info, warn};

use crate::config::StageConfig;
use crate::error::StoreError;
use crate::stage::model::{ConversationRecord, Stage};
use crate::store::keys::KeyCanonicalizer;
use crate::store::migrations;
use crate::store::traits::{DEFAULT_BATCH_LIMIT, StageStore, validate_conversation, validate_tenant};

/// Default per-operation time budget.
const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(2);

/// Keys per `IN (…)` query; keeps well under SQLite's bound-parameter limit.
const FETCH_CHUNK: usize = 500;

const RECORD_COLUMNS: &str =
    "tenant_id, conversation_id, stage, watermark, last_author_is_tenant, updated_at";

/// libSQL stage cache.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStageStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    keys: KeyCanonicalizer,
    batch_limit: usize,
    op_timeout: Duration,
}

impl LibSqlStageStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Stage cache opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Unavailable(format!("Failed to create in-memory database: {e}"))
            })?;

        Self::from_database(db).await
    }

    /// Open the database named by `config` and apply its key, batch and timeout settings.
    pub async fn from_config(config: &StageConfig) -> Result<Self, StoreError> {
        Ok(Self::new_local(&config.db_path)
            .await?
            .with_keys(KeyCanonicalizer::new(config.routing_suffix.clone()))
            .with_batch_limit(config.batch_limit)
            .with_timeout(config.store_timeout))
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Unavailable(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;

        Ok(Self {
            db: Arc::new(db),
            conn,
            keys: KeyCanonicalizer::default(),
            batch_limit: DEFAULT_BATCH_LIMIT,
            op_timeout: DEFAULT_OP_TIMEOUT,
        })
    }

    pub fn with_keys(mut self, keys: KeyCanonicalizer) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run a store operation under the per-operation time budget.
    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(op, timeout_ms = self.op_timeout.as_millis() as u64, "Store operation timed out");
                Err(StoreError::Timeout(self.op_timeout))
            }
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Classify a libsql failure: connection-level and busy/locked/IO failures
/// are transient, everything else is a query error.
fn map_err(op: &str, e: libsql::Error) -> StoreError {
    const SQLITE_BUSY: i32 = 5;
    const SQLITE_LOCKED: i32 = 6;
    const SQLITE_IOERR: i32 = 10;
    const SQLITE_CANTOPEN: i32 = 14;

    match &e {
        libsql::Error::ConnectionFailed(_) => StoreError::Unavailable(format!("{op}: {e}")),
        libsql::Error::SqliteFailure(code, _)
            if matches!(
                *code & 0xff,
                SQLITE_BUSY | SQLITE_LOCKED | SQLITE_IOERR | SQLITE_CANTOPEN
            ) =>
        {
            StoreError::Unavailable(format!("{op}: {e}"))
        }
        _ => StoreError::Query(format!("{op}: {e}")),
    }
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    // SQLite datetime() output, as found in databases predating V3
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn watermark_to_db(watermark: u64) -> Result<i64, StoreError> {
    i64::try_from(watermark)
        .map_err(|_| StoreError::InvalidInput(format!("watermark {watermark} out of range")))
}

/// Map a libsql Row to a ConversationRecord.
///
/// Column order matches RECORD_COLUMNS.
fn row_to_record(row: &libsql::Row) -> Result<ConversationRecord, StoreError> {
    let corrupt = |e: libsql::Error| StoreError::Corrupt(e.to_string());

    let tenant_id: String = row.get(0).map_err(corrupt)?;
    let conversation_id: String = row.get(1).map_err(corrupt)?;
    let stage_str: String = row.get(2).map_err(corrupt)?;
    let watermark: i64 = row.get(3).map_err(corrupt)?;
    let last_author: i64 = row.get(4).map_err(corrupt)?;
    let updated_str: String = row.get(5).map_err(corrupt)?;

    let stage = stage_str.parse::<Stage>().map_err(StoreError::Corrupt)?;
    let watermark = u64::try_from(watermark)
        .map_err(|_| StoreError::Corrupt(format!("negative watermark {watermark}")))?;

    Ok(ConversationRecord {
        tenant_id,
        conversation_id,
        stage,
        watermark,
        last_author_is_tenant: last_author != 0,
        updated_at: parse_datetime(&updated_str),
    })
}

async fn collect_records(mut rows: libsql::Rows, op: &str) -> Result<Vec<ConversationRecord>, StoreError> {
    let mut out = Vec::new();
    while let Some(row) = rows.next().await.map_err(|e| map_err(op, e))? {
        out.push(row_to_record(&row)?);
    }
    Ok(out)
}

// ── StageStore impl ─────────────────────────────────────────────────

#[async_trait]
impl StageStore for LibSqlStageStore {
    fn keys(&self) -> &KeyCanonicalizer {
        &self.keys
    }

    fn batch_limit(&self) -> usize {
        self.batch_limit
    }

    async fn fetch_rows(
        &self,
        tenant_id: &str,
        keys: &[String],
    ) -> Result<Vec<ConversationRecord>, StoreError> {
        validate_tenant(tenant_id)?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        self.bounded("fetch_rows", async {
            let mut out = Vec::new();
            for chunk in keys.chunks(FETCH_CHUNK) {
                let placeholders = (0..chunk.len())
                    .map(|i| format!("?{}", i + 2))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!(
                    "SELECT {RECORD_COLUMNS} FROM stage_cache
                     WHERE tenant_id = ?1 AND conversation_id IN ({placeholders})"
                );

                let mut values = Vec::with_capacity(chunk.len() + 1);
                values.push(Value::Text(tenant_id.to_string()));
                values.extend(chunk.iter().map(|k| Value::Text(k.clone())));

                let rows = self
                    .conn()
                    .query(&sql, Params::Positional(values))
                    .await
                    .map_err(|e| map_err("fetch_rows", e))?;
                out.extend(collect_records(rows, "fetch_rows").await?);
            }
            Ok(out)
        })
        .await
    }

    async fn upsert_row(
        &self,
        tenant_id: &str,
        key: &str,
        stage: Stage,
        watermark: u64,
        last_author_is_tenant: bool,
    ) -> Result<ConversationRecord, StoreError> {
        validate_tenant(tenant_id)?;
        validate_conversation(key)?;
        let watermark = watermark_to_db(watermark)?;
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);

        let record = self
            .bounded("upsert", async {
                let sql = format!(
                    "INSERT INTO stage_cache ({RECORD_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT (tenant_id, conversation_id) DO UPDATE SET
                         stage = excluded.stage,
                         watermark = MAX(stage_cache.watermark, excluded.watermark),
                         last_author_is_tenant = excluded.last_author_is_tenant,
                         updated_at = excluded.updated_at
                     RETURNING {RECORD_COLUMNS}"
                );
                let mut rows = self
                    .conn()
                    .query(
                        &sql,
                        params![
                            tenant_id,
                            key,
                            stage.as_str(),
                            watermark,
                            last_author_is_tenant as i64,
                            now.as_str()
                        ],
                    )
                    .await
                    .map_err(|e| map_err("upsert", e))?;

                match rows.next().await.map_err(|e| map_err("upsert", e))? {
                    Some(row) => row_to_record(&row),
                    None => Err(StoreError::Query("upsert: no row returned".into())),
                }
            })
            .await?;

        debug!(
            tenant_id,
            conversation_id = %record.conversation_id,
            stage = %record.stage,
            watermark = record.watermark,
            "Stage upserted"
        );
        Ok(record)
    }

    async fn stage_counts(&self, tenant_id: &str) -> Result<BTreeMap<Stage, u64>, StoreError> {
        validate_tenant(tenant_id)?;

        self.bounded("stage_counts", async {
            let mut rows = self
                .conn()
                .query(
                    "SELECT stage, COUNT(*) FROM stage_cache WHERE tenant_id = ?1 GROUP BY stage",
                    params![tenant_id],
                )
                .await
                .map_err(|e| map_err("stage_counts", e))?;

            let mut counts: BTreeMap<Stage, u64> = Stage::ALL.iter().map(|s| (*s, 0)).collect();
            while let Some(row) = rows.next().await.map_err(|e| map_err("stage_counts", e))? {
                let stage_str: String = row.get(0).map_err(|e| StoreError::Corrupt(e.to_string()))?;
                let count: i64 = row.get(1).map_err(|e| StoreError::Corrupt(e.to_string()))?;
                let stage = stage_str.parse::<Stage>().map_err(StoreError::Corrupt)?;
                counts.insert(stage, count.max(0) as u64);
            }
            Ok(counts)
        })
        .await
    }

    async fn list_by_stage(
        &self,
        tenant_id: &str,
        stage: Stage,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ConversationRecord>, StoreError> {
        validate_tenant(tenant_id)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);

        self.bounded("list_by_stage", async {
            let sql = format!(
                "SELECT {RECORD_COLUMNS} FROM stage_cache
                 WHERE tenant_id = ?1 AND stage = ?2
                 ORDER BY updated_at DESC, conversation_id ASC
                 LIMIT ?3 OFFSET ?4"
            );
            let rows = self
                .conn()
                .query(&sql, params![tenant_id, stage.as_str(), limit, offset])
                .await
                .map_err(|e| map_err("list_by_stage", e))?;
            collect_records(rows, "list_by_stage").await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    async fn test_store() -> LibSqlStageStore {
        LibSqlStageStore::new_memory().await.unwrap()
    }

    /// Plant a row verbatim, bypassing canonicalization.
    async fn plant(store: &LibSqlStageStore, tenant: &str, key: &str, stage: Stage, updated_at: &str) {
        store
            .conn()
            .execute(
                "INSERT INTO stage_cache (tenant_id, conversation_id, stage, watermark, last_author_is_tenant, updated_at)
                 VALUES (?1, ?2, ?3, 7, 0, ?4)",
                params![tenant, key, stage.as_str(), updated_at],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn upsert_inserts_then_merges() {
        let store = test_store().await;

        let first = store
            .upsert("t1", "5511999999999", Stage::Engaged, 100, false)
            .await
            .unwrap();
        assert_eq!(first.conversation_id, "5511999999999@s.whatsapp.net");
        assert_eq!(first.watermark, 100);

        let second = store
            .upsert("t1", "5511999999999", Stage::Hot, 40, true)
            .await
            .unwrap();
        assert_eq!(second.watermark, 100);
        assert_eq!(second.stage, Stage::Hot);
        assert!(second.last_author_is_tenant);
        assert!(second.updated_at >= first.updated_at);
    }

    #[tokio::test]
    async fn downgrade_is_accepted() {
        let store = test_store().await;
        store.upsert("t1", "c1", Stage::Hot, 1, true).await.unwrap();
        let rec = store.upsert("t1", "c1", Stage::Engaged, 2, true).await.unwrap();
        assert_eq!(rec.stage, Stage::Engaged);
    }

    #[tokio::test]
    async fn get_finds_both_spellings() {
        let store = test_store().await;
        store
            .upsert("t1", "5511988887777@s.whatsapp.net", Stage::New, 3, false)
            .await
            .unwrap();

        let bare = store.get("t1", "5511988887777").await.unwrap().unwrap();
        assert_eq!(bare.conversation_id, "5511988887777@s.whatsapp.net");
        assert!(store.get("t1", "5511900000000").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_resolves_drift_by_recency() {
        let store = test_store().await;
        plant(&store, "t1", "551177", Stage::Hot, "2026-03-01T10:00:00.000000Z").await;
        plant(&store, "t1", "551177@s.whatsapp.net", Stage::New, "2026-02-01T10:00:00.000000Z").await;

        let rec = store.get("t1", "551177").await.unwrap().unwrap();
        assert_eq!(rec.stage, Stage::Hot);

        // the newer spelling keeps receiving writes
        let written = store.upsert("t1", "551177", Stage::Engaged, 9, false).await.unwrap();
        assert_eq!(written.conversation_id, "551177");
    }

    #[tokio::test]
    async fn suffixed_id_reaches_legacy_bare_row() {
        let store = test_store().await;
        plant(&store, "t1", "5522", Stage::Hot, "2025-06-01T10:00:00.000Z").await;

        let rec = store.get("t1", "5522@s.whatsapp.net").await.unwrap().unwrap();
        assert_eq!(rec.conversation_id, "5522");

        let written = store
            .upsert("t1", "5522@s.whatsapp.net", Stage::Engaged, 3, false)
            .await
            .unwrap();
        assert_eq!(written.conversation_id, "5522");

        let counts = store.stage_counts("t1").await.unwrap();
        assert_eq!(counts[&Stage::Engaged], 1);
        assert_eq!(counts.values().sum::<u64>(), 1);
    }

    #[tokio::test]
    async fn slow_operation_becomes_timeout() {
        let store = test_store().await.with_timeout(Duration::from_millis(20));
        let res: Result<(), StoreError> = store
            .bounded("slow", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        let err = res.unwrap_err();
        assert!(matches!(err, StoreError::Timeout(d) if d == Duration::from_millis(20)));
        assert!(err.is_transient());

        let fast = store.bounded("fast", async { Ok(7) }).await.unwrap();
        assert_eq!(fast, 7);
    }

    #[tokio::test]
    async fn get_many_omits_missing_and_merges_drift() {
        let store = test_store().await;
        store.upsert("t1", "A", Stage::Engaged, 1, false).await.unwrap();
        store.upsert("t1", "C", Stage::Hot, 1, true).await.unwrap();
        plant(&store, "t1", "5500", Stage::New, "2026-01-01T00:00:00.000000Z").await;
        plant(&store, "t1", "5500@s.whatsapp.net", Stage::Hot, "2026-05-01T00:00:00.000000Z").await;

        let ids: Vec<String> = ["A", "B", "C", "5500", "5500@s.whatsapp.net", "A"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let recs = store.get_many("t1", &ids).await.unwrap();
        let got: Vec<_> = recs
            .iter()
            .map(|r| (r.conversation_id.as_str(), r.stage))
            .collect();
        assert_eq!(
            got,
            vec![
                ("A", Stage::Engaged),
                ("C", Stage::Hot),
                ("5500@s.whatsapp.net", Stage::Hot),
            ]
        );
    }

    #[tokio::test]
    async fn get_many_rejects_oversized_batches() {
        let store = test_store().await.with_batch_limit(10);
        let ids: Vec<String> = (0..11).map(|i| format!("c{i}")).collect();
        let err = store.get_many("t1", &ids).await.unwrap_err();
        assert!(err.is_invalid_input());
    }

    #[tokio::test]
    async fn get_many_handles_more_keys_than_one_chunk() {
        let store = test_store().await;
        for i in 0..600 {
            store
                .upsert("t1", &format!("55{i:08}"), Stage::New, i, false)
                .await
                .unwrap();
        }
        let ids: Vec<String> = (0..600).map(|i| format!("55{i:08}")).collect();
        let recs = store.get_many("t1", &ids).await.unwrap();
        assert_eq!(recs.len(), 600);
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let store = test_store().await;
        store.upsert("t1", "c1", Stage::Hot, 5, true).await.unwrap();
        store.upsert("t2", "c1", Stage::New, 1, false).await.unwrap();

        assert_eq!(store.get("t1", "c1").await.unwrap().unwrap().stage, Stage::Hot);
        assert_eq!(store.get("t2", "c1").await.unwrap().unwrap().stage, Stage::New);
        assert!(store.get("t3", "c1").await.unwrap().is_none());

        let counts = store.stage_counts("t1").await.unwrap();
        assert_eq!(counts[&Stage::Hot], 1);
        assert_eq!(counts[&Stage::New], 0);
    }

    #[tokio::test]
    async fn empty_ids_rejected() {
        let store = test_store().await;
        let err = store.upsert("t1", "", Stage::New, 0, false).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidInput(_)));
        let err = store.upsert("", "c1", Stage::New, 0, false).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn watermark_beyond_i64_rejected() {
        let store = test_store().await;
        let err = store
            .upsert("t1", "c1", Stage::New, u64::MAX, false)
            .await
            .unwrap_err();
        assert!(err.is_invalid_input());
    }

    #[tokio::test]
    async fn concurrent_upserts_keep_max_watermark() {
        let store = Arc::new(test_store().await);
        // create the row first so every task resolves the same key
        store.upsert("t1", "c1", Stage::New, 0, false).await.unwrap();

        let mut handles = Vec::new();
        for wm in [5_u64, 90, 12, 77, 3, 64, 41] {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.upsert("t1", "c1", Stage::Engaged, wm, false).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let rec = store.get("t1", "c1").await.unwrap().unwrap();
        assert_eq!(rec.watermark, 90);
    }

    #[tokio::test]
    async fn list_by_stage_orders_and_pages() {
        let store = test_store().await;
        plant(&store, "t1", "a", Stage::Engaged, "2026-01-01T00:00:00.000000Z").await;
        plant(&store, "t1", "b", Stage::Engaged, "2026-01-03T00:00:00.000000Z").await;
        plant(&store, "t1", "c", Stage::Engaged, "2026-01-02T00:00:00.000000Z").await;
        plant(&store, "t2", "d", Stage::Engaged, "2026-01-04T00:00:00.000000Z").await;

        let page = store.list_by_stage("t1", Stage::Engaged, 2, 0).await.unwrap();
        let ids: Vec<_> = page.iter().map(|r| r.conversation_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);

        let tail = store.list_by_stage("t1", Stage::Engaged, 2, 2).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].conversation_id, "a");
    }

    #[tokio::test]
    async fn on_disk_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("stages.db");
        {
            let store = LibSqlStageStore::new_local(&path).await.unwrap();
            store.upsert("t1", "c1", Stage::Hot, 8, true).await.unwrap();
        }
        let reopened = LibSqlStageStore::new_local(&path).await.unwrap();
        let rec = reopened.get("t1", "c1").await.unwrap().unwrap();
        assert_eq!(rec.stage, Stage::Hot);
        assert_eq!(rec.watermark, 8);
    }

    #[test]
    fn parses_both_datetime_formats() {
        let a = parse_datetime("2026-01-02T03:04:05.000006Z");
        let b = parse_datetime("2026-01-02 03:04:05");
        assert_eq!(a.timestamp(), b.timestamp());
        assert_eq!(parse_datetime("garbage"), DateTime::<Utc>::MIN_UTC);
    }
}
