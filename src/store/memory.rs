//! In-memory `StageStore` for tests and embedded use.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::stage::model::{ConversationRecord, Stage};
use crate::store::keys::KeyCanonicalizer;
use crate::store::traits::{DEFAULT_BATCH_LIMIT, StageStore, validate_conversation, validate_tenant};

type RowKey = (String, String);

/// Process-local stage cache. The write lock makes each upsert atomic.
pub struct InMemoryStageStore {
    rows: RwLock<HashMap<RowKey, ConversationRecord>>,
    keys: KeyCanonicalizer,
    batch_limit: usize,
}

impl InMemoryStageStore {
    pub fn new() -> Self {
        Self::with_keys(KeyCanonicalizer::default())
    }

    pub fn with_keys(keys: KeyCanonicalizer) -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            keys,
            batch_limit: DEFAULT_BATCH_LIMIT,
        }
    }

    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit;
        self
    }

    /// Insert a row verbatim, bypassing canonicalization and merging.
    /// Used to load legacy rows (including drifted spellings).
    pub async fn seed(&self, record: ConversationRecord) {
        let key = (record.tenant_id.clone(), record.conversation_id.clone());
        self.rows.write().await.insert(key, record);
    }

    /// Total physical rows across all tenants.
    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

impl Default for InMemoryStageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StageStore for InMemoryStageStore {
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
        let rows = self.rows.read().await;
        Ok(keys
            .iter()
            .filter_map(|k| rows.get(&(tenant_id.to_string(), k.clone())))
            .cloned()
            .collect())
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

        let mut rows = self.rows.write().await;
        let now = Utc::now();
        let record = rows
            .entry((tenant_id.to_string(), key.to_string()))
            .and_modify(|rec| {
                rec.stage = stage;
                rec.watermark = rec.watermark.max(watermark);
                rec.last_author_is_tenant = last_author_is_tenant;
                rec.updated_at = now;
            })
            .or_insert_with(|| ConversationRecord {
                tenant_id: tenant_id.to_string(),
                conversation_id: key.to_string(),
                stage,
                watermark,
                last_author_is_tenant,
                updated_at: now,
            });
        Ok(record.clone())
    }

    async fn stage_counts(&self, tenant_id: &str) -> Result<BTreeMap<Stage, u64>, StoreError> {
        validate_tenant(tenant_id)?;
        let mut counts: BTreeMap<Stage, u64> = Stage::ALL.iter().map(|s| (*s, 0)).collect();
        let rows = self.rows.read().await;
        for rec in rows.values().filter(|r| r.tenant_id == tenant_id) {
            *counts.entry(rec.stage).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn list_by_stage(
        &self,
        tenant_id: &str,
        stage: Stage,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ConversationRecord>, StoreError> {
        validate_tenant(tenant_id)?;
        let rows = self.rows.read().await;
        let mut matching: Vec<&ConversationRecord> = rows
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.stage == stage)
            .collect();
        matching.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.conversation_id.cmp(&b.conversation_id))
        });
        Ok(matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}
