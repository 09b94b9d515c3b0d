//! Lead stage: classify WhatsApp conversations into sales stages and keep
//! a per-tenant cache of the result.

pub mod config;
pub mod error;
pub mod stage;
pub mod store;

pub use config::StageConfig;
pub use error::{ConfigError, Error, Result, StoreError};
pub use stage::{Message, Resolution, Signal, Stage, StageService};
pub use store::{InMemoryStageStore, LibSqlStageStore, StageStore};
