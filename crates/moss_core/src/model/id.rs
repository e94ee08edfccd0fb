//! Capsule identifier contract.
//!
//! IDs are UUIDv7: globally unique and sortable by creation time.

use uuid::Uuid;

/// Stable identifier of one capsule across its whole lifetime.
pub type CapsuleId = Uuid;

/// Supplies fresh capsule identifiers.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> CapsuleId;
}

/// Default generator producing time-ordered UUIDv7 values.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidV7Generator;

impl IdGenerator for UuidV7Generator {
    fn next_id(&self) -> CapsuleId {
        Uuid::now_v7()
    }
}

/// Parses the textual form of a capsule ID.
pub fn parse_capsule_id(value: &str) -> Option<CapsuleId> {
    Uuid::parse_str(value.trim()).ok()
}
