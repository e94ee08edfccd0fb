//! Capsule use-case services.
//!
//! # Responsibility
//! - Orchestrate repository calls into store, import, compose and transfer
//!   use cases.
//! - Keep CLI and other front ends decoupled from storage details.

pub mod capsule_service;
pub mod collision;
pub mod compose;
pub mod transfer;
