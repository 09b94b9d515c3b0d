//! Core data model: funnel stages, transcript messages, cached records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse sales-funnel stage of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Nothing tenant-authored has matched yet.
    New,
    /// The tenant is actively qualifying the contact.
    Engaged,
    /// The tenant announced a handoff to a human/sales team.
    Hot,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::New, Stage::Engaged, Stage::Hot];

    /// Canonical storage label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::New => "new",
            Stage::Engaged => "engaged",
            Stage::Hot => "hot",
        }
    }

    /// Funnel position, NEW < ENGAGED < HOT. Informational only: writes never merge by rank.
    pub fn rank(&self) -> u8 {
        match self {
            Stage::New => 0,
            Stage::Engaged => 1,
            Stage::Hot => 2,
        }
    }

    /// Lenient parse for human-entered and legacy labels.
    ///
    /// Unknown labels fall back to `New`.
    pub fn from_label(label: &str) -> Stage {
        let s = label.trim().to_lowercase();
        if s.starts_with("contato") {
            Stage::New
        } else if s.contains("quente") || s.contains("hot") {
            Stage::Hot
        } else if s == "lead" || s == "lead_qualificado" || s == "engaged" {
            Stage::Engaged
        } else {
            Stage::New
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Stage::New),
            "engaged" => Ok(Stage::Engaged),
            "hot" => Ok(Stage::Hot),
            other => Err(format!("unknown stage: {other}")),
        }
    }
}

/// One transcript message as handed over by the messaging collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Sent by the tenant's own side (the business), not the customer.
    pub author_is_tenant: bool,
    pub text: Option<String>,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

impl Message {
    pub fn new(author_is_tenant: bool, text: impl Into<String>, timestamp: i64) -> Self {
        Self {
            author_is_tenant,
            text: Some(text.into()),
            timestamp,
        }
    }
}

/// The persisted unit of the stage cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub tenant_id: String,
    /// Storage key, one spelling of the conversation id.
    pub conversation_id: String,
    pub stage: Stage,
    /// Latest message signal already reflected in `stage`. Never decreases.
    pub watermark: u64,
    pub last_author_is_tenant: bool,
    pub updated_at: DateTime<Utc>,
}

/// What a caller observed about a conversation since it last asked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Signal {
    pub watermark: Option<u64>,
    pub author_is_tenant: Option<bool>,
}

impl Signal {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn watermark(watermark: u64) -> Self {
        Self {
            watermark: Some(watermark),
            author_is_tenant: None,
        }
    }

    pub fn with_author(mut self, author_is_tenant: bool) -> Self {
        self.author_is_tenant = Some(author_is_tenant);
        self
    }
}
