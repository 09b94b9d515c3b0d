//! `StageStore` trait: the tenant-scoped stage cache interface.
//!
//! Backends implement a handful of exact-key primitives; the provided
//! methods layer key canonicalization and drift handling on top, so every
//! backend resolves spellings the same way.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use tracing::warn;

use crate::error::StoreError;
use crate::stage::model::{ConversationRecord, Stage};
use crate::store::keys::{KeyCanonicalizer, most_recent};

/// Largest `get_many` batch accepted by default.
pub const DEFAULT_BATCH_LIMIT: usize = 2000;

/// Backend-agnostic stage cache.
///
/// Every method takes `tenant_id`; there is no way to read or write
/// across tenants.
#[async_trait]
pub trait StageStore: Send + Sync {
    /// Canonicalizer shared by all key-resolving operations.
    fn keys(&self) -> &KeyCanonicalizer;

    /// Maximum distinct ids per `get_many` call.
    fn batch_limit(&self) -> usize {
        DEFAULT_BATCH_LIMIT
    }

    // ── Backend primitives ──────────────────────────────────────────

    /// Rows stored under exactly these keys.
    async fn fetch_rows(
        &self,
        tenant_id: &str,
        keys: &[String],
    ) -> Result<Vec<ConversationRecord>, StoreError>;

    /// Single atomic insert-or-update under exactly `key`.
    ///
    /// The watermark is merged as `max(old, new)` inside the backend; stage
    /// and authorship are overwritten.
    async fn upsert_row(
        &self,
        tenant_id: &str,
        key: &str,
        stage: Stage,
        watermark: u64,
        last_author_is_tenant: bool,
    ) -> Result<ConversationRecord, StoreError>;

    /// Number of stored rows per stage. Every stage is present, possibly 0.
    async fn stage_counts(&self, tenant_id: &str) -> Result<BTreeMap<Stage, u64>, StoreError>;

    /// Rows in `stage`, most recently updated first.
    async fn list_by_stage(
        &self,
        tenant_id: &str,
        stage: Stage,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ConversationRecord>, StoreError>;

    // ── Canonicalizing operations ───────────────────────────────────

    /// Look up a conversation under every spelling of its id.
    ///
    /// `Ok(None)` means "not classified yet", not a failure.
    async fn get(
        &self,
        tenant_id: &str,
        conversation_id: &str,
    ) -> Result<Option<ConversationRecord>, StoreError> {
        validate_tenant(tenant_id)?;
        validate_conversation(conversation_id)?;

        let forms = self.keys().lookup_forms(conversation_id);
        let rows = self.fetch_rows(tenant_id, &forms).await?;
        if rows.len() > 1 {
            warn!(
                tenant_id,
                conversation_id,
                rows = rows.len(),
                "Drifted duplicate rows for one conversation, using most recent"
            );
        }
        Ok(most_recent(&rows).cloned())
    }

    /// Batched `get`. Ids without a record are omitted from the result.
    async fn get_many(
        &self,
        tenant_id: &str,
        ids: &[String],
    ) -> Result<Vec<ConversationRecord>, StoreError> {
        validate_tenant(tenant_id)?;

        let mut seen = HashSet::new();
        let requested: Vec<&str> = ids
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty() && seen.insert(*id))
            .collect();

        let limit = self.batch_limit();
        if requested.len() > limit {
            return Err(StoreError::BatchTooLarge {
                requested: requested.len(),
                limit,
            });
        }
        if requested.is_empty() {
            return Ok(Vec::new());
        }

        let keys = self.keys();
        let mut forms: Vec<String> = Vec::with_capacity(requested.len() * 2);
        let mut form_seen = HashSet::new();
        for id in &requested {
            for form in keys.lookup_forms(id) {
                if form_seen.insert(form.clone()) {
                    forms.push(form);
                }
            }
        }

        let rows = self.fetch_rows(tenant_id, &forms).await?;

        let mut groups: HashMap<&str, Vec<ConversationRecord>> = HashMap::new();
        for row in &rows {
            groups
                .entry(keys.logical_key(&row.conversation_id))
                .or_default()
                .push(row.clone());
        }

        let mut emitted = HashSet::new();
        let mut out = Vec::with_capacity(groups.len());
        for id in requested {
            let logical = keys.logical_key(id);
            if !emitted.insert(logical) {
                continue;
            }
            if let Some(best) = groups.get(logical).and_then(|g| most_recent(g)) {
                out.push(best.clone());
            }
        }
        Ok(out)
    }

    /// Storage key for `raw_id`: the existing spelling if any row exists,
    /// else the preferred spelling.
    async fn resolve_storage_key(
        &self,
        tenant_id: &str,
        raw_id: &str,
    ) -> Result<String, StoreError> {
        validate_tenant(tenant_id)?;
        validate_conversation(raw_id)?;

        let forms = self.keys().lookup_forms(raw_id);
        let rows = self.fetch_rows(tenant_id, &forms).await?;
        Ok(self.keys().resolve_with(raw_id, &rows))
    }

    /// Insert or update the record for a conversation.
    ///
    /// Classifier-derived and manual writes are treated alike: stage and
    /// authorship are last-writer-wins, the watermark never decreases.
    async fn upsert(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        stage: Stage,
        watermark: u64,
        last_author_is_tenant: bool,
    ) -> Result<ConversationRecord, StoreError> {
        let key = self.resolve_storage_key(tenant_id, conversation_id).await?;
        self.upsert_row(tenant_id, &key, stage, watermark, last_author_is_tenant)
            .await
    }
}

pub(crate) fn validate_tenant(tenant_id: &str) -> Result<(), StoreError> {
    if tenant_id.trim().is_empty() {
        return Err(StoreError::InvalidInput("tenant_id is empty".into()));
    }
    Ok(())
}

pub(crate) fn validate_conversation(conversation_id: &str) -> Result<(), StoreError> {
    if conversation_id.trim().is_empty() {
        return Err(StoreError::InvalidInput("conversation_id is empty".into()));
    }
    Ok(())
}
