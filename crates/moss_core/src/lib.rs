//! Core domain logic for the moss capsule store.
//! This crate is the single source of truth for capsule invariants.

pub mod config;
pub mod db;
pub mod error;
pub mod lint;
pub mod logging;
pub mod model;
pub mod repo;
pub mod search;
pub mod service;

pub use config::{ConfigError, StoreConfig};
pub use db::{open_db, open_db_in_memory, DbError};
pub use error::{CapsuleError, CapsuleResult, ErrorCode};
pub use lint::{ContentValidator, LintReport, SectionValidator, REQUIRED_SECTIONS};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError, LoggingOptions};
pub use model::address::{resolve_address, Address, AddressError, CapsuleRef};
pub use model::capsule::{
    Capsule, CapsuleDraft, CapsuleSummary, FetchKey, Lifecycle, Pagination, TextMetrics,
};
pub use model::id::{CapsuleId, IdGenerator, UuidV7Generator};
pub use repo::capsule_repo::{
    BulkUpdateFields, CapsuleFilter, CapsuleListQuery, CapsuleRepository, RepoError, RepoResult,
    SqliteCapsuleRepository, UpsertOutcome,
};
pub use search::fts::{SearchError, SearchHit, SearchPage, SearchQuery};
pub use service::capsule_service::{
    BulkOutcome, CapsulePatch, CapsuleService, FetchManyItem, ItemError, ListPage, StoreRequest,
};
pub use service::collision::{
    CapsuleSnapshot, ImportErrorCode, ImportMode, ImportRecordError, ImportResult, StoreMode,
    StoreOutcome,
};
pub use service::compose::{
    ComposeFormat, ComposePart, ComposeRequest, ComposeResult, ComposeStoreTarget,
};
pub use service::transfer::{ExportHeader, ExportSummary, PathGuard, StrictPathGuard};
pub use tokio_util::sync::CancellationToken;

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
