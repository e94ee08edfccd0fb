//! Repository layer for capsule persistence.
//!
//! # Responsibility
//! - Define the identity-store contract used by services.
//! - Isolate SQLite query details from collision and compose orchestration.
//!
//! # Invariants
//! - Repository APIs return semantic errors (`NotFound`,
//!   `NameAlreadyExists`) in addition to DB transport errors.
//! - Repositories borrow a connection or transaction; callers own
//!   transaction boundaries.

pub mod capsule_repo;
