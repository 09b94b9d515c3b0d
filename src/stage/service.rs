//! Stage service: the request path tying gate, classifier and store together.
//!
//! 1. Read the cached record (transient store errors count as "absent")
//! 2. Gate: if the observed signal is not newer, return the cached stage
//! 3. Optionally reuse a stage computed moments ago (memo TTL)
//! 4. Fetch messages from the collaborator under the classify timeout;
//!    on failure or timeout fall back to whatever is cached
//! 5. Classify and upsert

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::StageConfig;
use crate::error::{ConfigError, StoreError};
use crate::stage::gate::needs_reclassify;
use crate::stage::model::{ConversationRecord, Message, Signal, Stage};
use crate::stage::rules::{PhraseLists, StageClassifier};
use crate::store::{LibSqlStageStore, StageStore};
use crate::store::traits::{validate_conversation, validate_tenant};

/// Memo entries kept before stale ones are swept.
const MEMO_SWEEP_THRESHOLD: usize = 1024;

/// Supplies the ordered transcript of a conversation on demand.
///
/// Implemented by the messaging collaborator; this crate never fetches
/// messages itself.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn fetch_messages(
        &self,
        tenant_id: &str,
        conversation_id: &str,
    ) -> anyhow::Result<Vec<Message>>;
}

/// How a stage request was answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The cached record was current.
    Cached(ConversationRecord),
    /// Messages were fetched, classified and the result stored.
    Classified(ConversationRecord),
    /// A stage computed within the memo TTL was reused and stored.
    Memoized(ConversationRecord),
    /// Reclassification was needed but the message source failed or timed
    /// out; this is the last cached record.
    Stale(ConversationRecord),
    /// Classified, but the store was unreachable so nothing was written.
    Unpersisted(Stage),
    /// Nothing cached and the message source failed.
    Unknown,
}

impl Resolution {
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Resolution::Cached(r)
            | Resolution::Classified(r)
            | Resolution::Memoized(r)
            | Resolution::Stale(r) => Some(r.stage),
            Resolution::Unpersisted(stage) => Some(*stage),
            Resolution::Unknown => None,
        }
    }

    /// Stage for display; unknown conversations show as `New`.
    pub fn stage_or_new(&self) -> Stage {
        self.stage().unwrap_or(Stage::New)
    }

    pub fn record(&self) -> Option<&ConversationRecord> {
        match self {
            Resolution::Cached(r)
            | Resolution::Classified(r)
            | Resolution::Memoized(r)
            | Resolution::Stale(r) => Some(r),
            Resolution::Unpersisted(_) | Resolution::Unknown => None,
        }
    }
}

type MemoKey = (String, String);

pub struct StageService {
    store: Arc<dyn StageStore>,
    classifier: RwLock<Arc<StageClassifier>>,
    classify_timeout: Duration,
    memo_ttl: Duration,
    memo: RwLock<HashMap<MemoKey, (Instant, Stage)>>,
}

impl StageService {
    pub fn new(store: Arc<dyn StageStore>, classifier: StageClassifier) -> Self {
        let defaults = StageConfig::default();
        Self {
            store,
            classifier: RwLock::new(Arc::new(classifier)),
            classify_timeout: defaults.classify_timeout,
            memo_ttl: defaults.memo_ttl,
            memo: RwLock::new(HashMap::new()),
        }
    }

    /// Build with phrase lists and timing taken from `config`.
    pub fn from_config(store: Arc<dyn StageStore>, config: &StageConfig) -> Result<Self, ConfigError> {
        let lists = config.load_phrases()?;
        Ok(Self::new(store, StageClassifier::new(&lists))
            .with_classify_timeout(config.classify_timeout)
            .with_memo_ttl(config.memo_ttl))
    }

    /// Open the libSQL store named by `config` and build a service over it.
    pub async fn open(config: &StageConfig) -> crate::error::Result<Self> {
        let store = LibSqlStageStore::from_config(config).await?;
        let service = Self::from_config(Arc::new(store), config)?;
        info!(db_path = %config.db_path.display(), "Stage service ready");
        Ok(service)
    }

    pub fn with_classify_timeout(mut self, timeout: Duration) -> Self {
        self.classify_timeout = timeout;
        self
    }

    pub fn with_memo_ttl(mut self, ttl: Duration) -> Self {
        self.memo_ttl = ttl;
        self
    }

    pub fn store(&self) -> &Arc<dyn StageStore> {
        &self.store
    }

    /// Swap in new phrase lists; in-flight classifications finish on the old ones.
    pub async fn reload_phrases(&self, lists: &PhraseLists) {
        let next = Arc::new(StageClassifier::new(lists));
        *self.classifier.write().await = next;
        info!(
            hot_hints = lists.hot_hints.len(),
            negative_guards = lists.negative_guards.len(),
            engagement_patterns = lists.engagement_patterns.len(),
            "Phrase lists reloaded"
        );
    }

    /// Classify with the current phrase lists. No I/O.
    pub async fn classify(&self, messages: &[Message]) -> Stage {
        let classifier = Arc::clone(&*self.classifier.read().await);
        classifier.classify(messages)
    }

    /// Gate check against the store.
    pub async fn should_reclassify(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        signal: Signal,
    ) -> Result<bool, StoreError> {
        crate::stage::gate::should_reclassify(
            self.store.as_ref(),
            tenant_id,
            conversation_id,
            signal.watermark,
            signal.author_is_tenant,
        )
        .await
    }

    /// Answer "what stage is this conversation in", reclassifying only when
    /// the signal says the cache is behind.
    ///
    /// Only invalid input and non-transient store failures are errors;
    /// an unreachable store or a slow message source degrade to
    /// [`Resolution::Stale`], [`Resolution::Unpersisted`] or [`Resolution::Unknown`].
    pub async fn resolve(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        signal: Signal,
        source: &dyn MessageSource,
    ) -> Result<Resolution, StoreError> {
        validate_tenant(tenant_id)?;
        validate_conversation(conversation_id)?;

        let cached = match self.store.get(tenant_id, conversation_id).await {
            Ok(rec) => rec,
            Err(e) if e.is_transient() => {
                warn!(tenant_id, conversation_id, error = %e, "Stage cache read failed, treating as absent");
                None
            }
            Err(e) => return Err(e),
        };

        if let Some(rec) = &cached {
            if !needs_reclassify(Some(rec), &signal) {
                debug!(tenant_id, conversation_id, stage = %rec.stage, "Cached stage is current");
                return Ok(Resolution::Cached(rec.clone()));
            }
        }

        let memo_key = self.memo_key(tenant_id, conversation_id);
        if let Some(stage) = self.memo_hit(&memo_key).await {
            debug!(tenant_id, conversation_id, stage = %stage, "Reusing recently computed stage");
            let watermark = signal.watermark.unwrap_or(0);
            let author = signal
                .author_is_tenant
                .or(cached.as_ref().map(|r| r.last_author_is_tenant))
                .unwrap_or(false);
            return self
                .persist(tenant_id, conversation_id, stage, watermark, author)
                .await
                .map(|outcome| outcome.map_or(Resolution::Unpersisted(stage), Resolution::Memoized));
        }

        let fetched =
            tokio::time::timeout(self.classify_timeout, source.fetch_messages(tenant_id, conversation_id))
                .await;
        let messages = match fetched {
            Ok(Ok(messages)) => messages,
            Ok(Err(e)) => {
                warn!(tenant_id, conversation_id, error = %e, "Message fetch failed, serving cached stage");
                return Ok(fallback(cached));
            }
            Err(_) => {
                warn!(
                    tenant_id,
                    conversation_id,
                    timeout_ms = self.classify_timeout.as_millis() as u64,
                    "Message fetch timed out, serving cached stage"
                );
                return Ok(fallback(cached));
            }
        };

        let stage = self.classify(&messages).await;
        let latest = messages.iter().max_by_key(|m| m.timestamp);
        let watermark = signal
            .watermark
            .or_else(|| latest.map(|m| m.timestamp.max(0) as u64))
            .unwrap_or(0);
        let author = signal
            .author_is_tenant
            .or_else(|| latest.map(|m| m.author_is_tenant))
            .unwrap_or(false);

        debug!(
            tenant_id,
            conversation_id,
            messages = messages.len(),
            stage = %stage,
            watermark,
            "Conversation classified"
        );

        self.remember(memo_key, stage).await;

        self.persist(tenant_id, conversation_id, stage, watermark, author)
            .await
            .map(|outcome| outcome.map_or(Resolution::Unpersisted(stage), Resolution::Classified))
    }

    /// Manual (human) stage override. Store failures are propagated.
    pub async fn set_stage(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        stage: Stage,
        watermark: u64,
        last_author_is_tenant: bool,
    ) -> Result<ConversationRecord, StoreError> {
        let record = self
            .store
            .upsert(tenant_id, conversation_id, stage, watermark, last_author_is_tenant)
            .await?;
        self.forget(&self.memo_key(tenant_id, conversation_id)).await;
        info!(
            tenant_id,
            conversation_id = %record.conversation_id,
            stage = %record.stage,
            "Stage set manually"
        );
        Ok(record)
    }

    /// Manual override from a free-text label (see [`Stage::from_label`]).
    pub async fn set_stage_label(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        label: &str,
        watermark: u64,
        last_author_is_tenant: bool,
    ) -> Result<ConversationRecord, StoreError> {
        self.set_stage(
            tenant_id,
            conversation_id,
            Stage::from_label(label),
            watermark,
            last_author_is_tenant,
        )
        .await
    }

    /// Read-only view of one conversation: `New` when absent or when the
    /// store is unreachable.
    pub async fn view_stage(&self, tenant_id: &str, conversation_id: &str) -> Result<Stage, StoreError> {
        match self.store.get(tenant_id, conversation_id).await {
            Ok(rec) => Ok(rec.map_or(Stage::New, |r| r.stage)),
            Err(e) if e.is_transient() => {
                warn!(tenant_id, conversation_id, error = %e, "Stage view degraded to new");
                Ok(Stage::New)
            }
            Err(e) => Err(e),
        }
    }

    /// Read-only view of many conversations keyed by the ids as given.
    pub async fn view_stages(
        &self,
        tenant_id: &str,
        ids: &[String],
    ) -> Result<HashMap<String, Stage>, StoreError> {
        let records = match self.store.get_many(tenant_id, ids).await {
            Ok(records) => records,
            Err(e) if e.is_transient() => {
                warn!(tenant_id, ids = ids.len(), error = %e, "Stage view degraded to new");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let keys = self.store.keys();
        let by_logical: HashMap<&str, Stage> = records
            .iter()
            .map(|r| (keys.logical_key(&r.conversation_id), r.stage))
            .collect();

        Ok(ids
            .iter()
            .filter(|id| !id.trim().is_empty())
            .map(|id| {
                let stage = by_logical
                    .get(keys.logical_key(id))
                    .copied()
                    .unwrap_or(Stage::New);
                (id.clone(), stage)
            })
            .collect())
    }

    /// Funnel counts for a tenant.
    pub async fn stage_counts(&self, tenant_id: &str) -> Result<BTreeMap<Stage, u64>, StoreError> {
        self.store.stage_counts(tenant_id).await
    }

    /// One page of a funnel column.
    pub async fn list_by_stage(
        &self,
        tenant_id: &str,
        stage: Stage,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ConversationRecord>, StoreError> {
        self.store.list_by_stage(tenant_id, stage, limit, offset).await
    }

    // ── internals ───────────────────────────────────────────────────

    /// Upsert on the request path: transient failures yield `Ok(None)`.
    async fn persist(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        stage: Stage,
        watermark: u64,
        author: bool,
    ) -> Result<Option<ConversationRecord>, StoreError> {
        match self
            .store
            .upsert(tenant_id, conversation_id, stage, watermark, author)
            .await
        {
            Ok(rec) => Ok(Some(rec)),
            Err(e) if e.is_transient() => {
                warn!(tenant_id, conversation_id, error = %e, "Stage computed but not stored");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn memo_key(&self, tenant_id: &str, conversation_id: &str) -> MemoKey {
        (
            tenant_id.to_string(),
            self.store.keys().logical_key(conversation_id).to_string(),
        )
    }

    async fn memo_hit(&self, key: &MemoKey) -> Option<Stage> {
        if self.memo_ttl.is_zero() {
            return None;
        }
        let memo = self.memo.read().await;
        memo.get(key)
            .filter(|(at, _)| at.elapsed() <= self.memo_ttl)
            .map(|(_, stage)| *stage)
    }

    async fn remember(&self, key: MemoKey, stage: Stage) {
        if self.memo_ttl.is_zero() {
            return;
        }
        let mut memo = self.memo.write().await;
        if memo.len() >= MEMO_SWEEP_THRESHOLD {
            let ttl = self.memo_ttl;
            memo.retain(|_, (at, _)| at.elapsed() <= ttl);
        }
        memo.insert(key, (Instant::now(), stage));
    }

    async fn forget(&self, key: &MemoKey) {
        if self.memo_ttl.is_zero() {
            return;
        }
        self.memo.write().await.remove(key);
    }
}

fn fallback(cached: Option<ConversationRecord>) -> Resolution {
    match cached {
        Some(rec) => Resolution::Stale(rec),
        None => Resolution::Unknown,
    }
}
