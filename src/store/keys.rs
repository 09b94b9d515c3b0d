//! Conversation key canonicalization.
//!
//! A conversation may be addressed by its bare numeric id (`5511999999999`)
//! or by the same id with the routing-domain suffix
//! (`5511999999999@s.whatsapp.net`). Both spell one conversation.

use crate::stage::model::ConversationRecord;

/// Default routing-domain suffix appended to bare numeric ids.
pub const DEFAULT_ROUTING_SUFFIX: &str = "@s.whatsapp.net";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCanonicalizer {
    suffix: String,
}

impl KeyCanonicalizer {
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
        }
    }

    /// Every spelling under which `raw_id` may be stored.
    ///
    /// Purely numeric ids expand to `[bare, bare + suffix]`; anything else
    /// (already suffixed, group ids, free text) is returned as-is.
    pub fn canonical_forms(&self, raw_id: &str) -> Vec<String> {
        let raw = raw_id.trim();
        if is_numeric(raw) {
            vec![raw.to_string(), format!("{raw}{}", self.suffix)]
        } else {
            vec![raw.to_string()]
        }
    }

    /// Spellings to read when looking up `raw_id`.
    ///
    /// The canonical forms, plus the bare spelling when `raw_id` is a
    /// suffixed numeric id, since legacy rows may be stored bare.
    pub fn lookup_forms(&self, raw_id: &str) -> Vec<String> {
        let mut forms = self.canonical_forms(raw_id);
        let bare = self.logical_key(raw_id);
        if bare != raw_id.trim() {
            forms.push(bare.to_string());
        }
        forms
    }

    /// The key a fresh record for `raw_id` should be written under.
    pub fn preferred_key(&self, raw_id: &str) -> String {
        let raw = raw_id.trim();
        if is_numeric(raw) {
            format!("{raw}{}", self.suffix)
        } else {
            raw.to_string()
        }
    }

    /// Suffix-stripped identity shared by all spellings of one conversation.
    pub fn logical_key<'a>(&self, key: &'a str) -> &'a str {
        let key = key.trim();
        match key.strip_suffix(self.suffix.as_str()) {
            Some(bare) if is_numeric(bare) => bare,
            _ => key,
        }
    }

    /// Pick the storage key given the rows already stored under any form.
    ///
    /// An existing key is never migrated to another spelling.
    pub fn resolve_with(&self, raw_id: &str, existing: &[ConversationRecord]) -> String {
        match most_recent(existing) {
            Some(rec) => rec.conversation_id.clone(),
            None => self.preferred_key(raw_id),
        }
    }
}

impl Default for KeyCanonicalizer {
    fn default() -> Self {
        Self::new(DEFAULT_ROUTING_SUFFIX)
    }
}

/// Newest row by `updated_at`; ties go to the longer (suffixed) spelling.
pub fn most_recent(rows: &[ConversationRecord]) -> Option<&ConversationRecord> {
    rows.iter().max_by(|a, b| {
        a.updated_at
            .cmp(&b.updated_at)
            .then_with(|| a.conversation_id.len().cmp(&b.conversation_id.len()))
    })
}

fn is_numeric(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}
