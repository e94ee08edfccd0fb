//! Capsule domain model.
//!
//! # Responsibility
//! - Define the canonical capsule record and its tombstone lifecycle.
//! - Own address normalization and resolution shared by every entry point.
//! - Define the identifier contract used for new capsules.
//!
//! # Invariants
//! - Every capsule is identified by a stable, time-ordered `CapsuleId`.
//! - Deletion is a tombstone (`Lifecycle::Deleted`) until purge.

pub mod address;
pub mod capsule;
pub mod id;
