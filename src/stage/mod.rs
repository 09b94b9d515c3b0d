//! Conversation stage engine.
//!
//! A conversation moves through three stages as the tenant's side of the
//! chat progresses: `New` (nothing meaningful said yet), `Engaged` (the
//! tenant is collecting details) and `Hot` (the tenant is handing the lead
//! to a human). Stages are derived from tenant-authored messages only and
//! cached per conversation alongside a watermark, so a request only pays for
//! reclassification when something new has happened.

pub mod gate;
pub mod model;
pub mod normalize;
pub mod rules;
pub mod service;
pub mod transcript;

pub use gate::{needs_reclassify, should_reclassify};
pub use model::{ConversationRecord, Message, Signal, Stage};
pub use normalize::normalize;
pub use rules::{PhraseLists, StageClassifier};
pub use service::{MessageSource, Resolution, StageService};
pub use transcript::messages_from_payload;
