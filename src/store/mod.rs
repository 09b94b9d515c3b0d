//! Persistence layer: the per-tenant stage cache.

pub mod keys;
pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use keys::KeyCanonicalizer;
pub use libsql_backend::LibSqlStageStore;
pub use memory::InMemoryStageStore;
pub use traits::StageStore;
