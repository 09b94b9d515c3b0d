//! Reclassification gate: decides whether a cached stage is still current.

use tracing::debug;

use crate::error::StoreError;
use crate::stage::model::{ConversationRecord, Signal};
use crate::store::StageStore;

/// Pure decision over an already-loaded record.
///
/// Reclassify when there is no record, when the observed watermark is
/// strictly newer, or when the observed authorship flag differs.
pub fn needs_reclassify(record: Option<&ConversationRecord>, signal: &Signal) -> bool {
    let Some(rec) = record else {
        return true;
    };
    if signal.watermark.is_some_and(|w| w > rec.watermark) {
        return true;
    }
    if signal
        .author_is_tenant
        .is_some_and(|a| a != rec.last_author_is_tenant)
    {
        return true;
    }
    false
}

/// Read the cached record and apply [`needs_reclassify`]. Performs no writes.
pub async fn should_reclassify(
    store: &dyn StageStore,
    tenant_id: &str,
    conversation_id: &str,
    observed_watermark: Option<u64>,
    observed_author_is_tenant: Option<bool>,
) -> Result<bool, StoreError> {
    let record = store.get(tenant_id, conversation_id).await?;
    let signal = Signal {
        watermark: observed_watermark,
        author_is_tenant: observed_author_is_tenant,
    };
    let verdict = needs_reclassify(record.as_ref(), &signal);
    debug!(
        tenant_id,
        conversation_id,
        cached = record.is_some(),
        reclassify = verdict,
        "Gate decision"
    );
    Ok(verdict)
}
