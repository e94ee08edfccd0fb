//! Capsule record, lifecycle and derived projections.
//!
//! # Responsibility
//! - Define the persisted capsule shape and its public projections
//!   (`CapsuleSummary`, `FetchKey`).
//! - Derive text metrics from capsule text.
//!
//! # Invariants
//! - `capsule_chars` and `tokens_estimate` are recomputed from
//!   `capsule_text` and never accepted from callers.
//! - `title` defaults to the raw name and stays `None` for unnamed capsules
//!   without an explicit title.
//! - `(workspace_norm, name_norm)` is unique among active capsules only.

use crate::model::address::{normalize, AddressError, DEFAULT_WORKSPACE};
use crate::model::id::CapsuleId;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Tombstone state of a capsule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Lifecycle {
    Active,
    /// Soft-deleted at the given epoch milliseconds; the name slot is free.
    Deleted { at: i64 },
}

impl Lifecycle {
    /// Maps the nullable `deleted_at` column into a lifecycle state.
    pub fn from_deleted_at(deleted_at: Option<i64>) -> Self {
        match deleted_at {
            Some(at) => Self::Deleted { at },
            None => Self::Active,
        }
    }

    pub fn deleted_at(self) -> Option<i64> {
        match self {
            Self::Active => None,
            Self::Deleted { at } => Some(at),
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Character and token counts derived from capsule text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextMetrics {
    pub chars: i64,
    pub tokens_estimate: i64,
}

/// Measures capsule text.
///
/// `chars` counts Unicode scalar values; tokens use the 4-chars-per-token
/// heuristic rounded up.
pub fn measure_text(text: &str) -> TextMetrics {
    let chars = i64::try_from(text.chars().count()).unwrap_or(i64::MAX);
    TextMetrics {
        chars,
        tokens_estimate: chars.saturating_add(3) / 4,
    }
}

/// Externally-facing key used to re-locate a capsule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FetchKey {
    ByName {
        moss_capsule: String,
        moss_workspace: String,
    },
    ById {
        moss_id: String,
    },
}

/// Canonical persisted capsule record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capsule {
    pub id: CapsuleId,
    pub workspace_raw: String,
    pub workspace_norm: String,
    pub name_raw: Option<String>,
    pub name_norm: Option<String>,
    pub title: Option<String>,
    pub capsule_text: String,
    pub capsule_chars: i64,
    pub tokens_estimate: i64,
    pub tags: Vec<String>,
    pub source: Option<String>,
    pub run_id: Option<String>,
    pub phase: Option<String>,
    pub role: Option<String>,
    /// Epoch milliseconds.
    pub created_at: i64,
    /// Epoch milliseconds; strictly increases on every mutation.
    pub updated_at: i64,
    pub lifecycle: Lifecycle,
}

impl Capsule {
    pub fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    /// Returns the by-name key for named capsules and the by-ID key otherwise.
    pub fn fetch_key(&self) -> FetchKey {
        match self.name_norm.as_ref() {
            Some(name) => FetchKey::ByName {
                moss_capsule: name.clone(),
                moss_workspace: self.workspace_norm.clone(),
            },
            None => FetchKey::ById {
                moss_id: self.id.to_string(),
            },
        }
    }

    /// Replaces capsule text and recomputes the derived metrics.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.capsule_text = text.into();
        let metrics = measure_text(&self.capsule_text);
        self.capsule_chars = metrics.chars;
        self.tokens_estimate = metrics.tokens_estimate;
    }

    pub fn summary(&self) -> CapsuleSummary {
        CapsuleSummary {
            id: self.id,
            workspace: self.workspace_norm.clone(),
            name: self.name_norm.clone(),
            title: self.title.clone(),
            capsule_chars: self.capsule_chars,
            tokens_estimate: self.tokens_estimate,
            tags: self.tags.clone(),
            source: self.source.clone(),
            run_id: self.run_id.clone(),
            phase: self.phase.clone(),
            role: self.role.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.lifecycle.deleted_at(),
            fetch_key: self.fetch_key(),
        }
    }
}

/// Text-free projection of a capsule used by list, search and bulk results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsuleSummary {
    pub id: CapsuleId,
    pub workspace: String,
    pub name: Option<String>,
    pub title: Option<String>,
    pub capsule_chars: i64,
    pub tokens_estimate: i64,
    pub tags: Vec<String>,
    pub source: Option<String>,
    pub run_id: Option<String>,
    pub phase: Option<String>,
    pub role: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
    pub fetch_key: FetchKey,
}

/// Pagination metadata computed from the filtered result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
    pub has_more: bool,
    pub total: u64,
}

impl Pagination {
    pub fn new(limit: u32, offset: u32, returned: usize, total: u64) -> Self {
        let seen = u64::from(offset).saturating_add(returned as u64);
        Self {
            limit,
            offset,
            has_more: seen < total,
            total,
        }
    }
}

/// Caller-supplied fields for a new capsule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsuleDraft {
    #[serde(default)]
    pub workspace: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    pub text: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

impl CapsuleDraft {
    /// Builds an active capsule with the given identity and timestamp.
    ///
    /// # Errors
    /// - `AddressError::Invalid` when a name was supplied but normalizes to
    ///   an empty string.
    pub fn into_capsule(self, id: CapsuleId, now_ms: i64) -> Result<Capsule, AddressError> {
        let workspace_raw = match self.workspace.trim() {
            "" => DEFAULT_WORKSPACE.to_string(),
            trimmed => trimmed.to_string(),
        };
        let workspace_norm = normalize(&workspace_raw);
        if workspace_norm.is_empty() {
            return Err(AddressError::Invalid("workspace must not be blank".to_string()));
        }

        let name_raw = self
            .name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());
        let name_norm = name_raw.as_deref().map(normalize);

        let title = non_blank(self.title).or_else(|| name_raw.clone());
        let metrics = measure_text(&self.text);

        Ok(Capsule {
            id,
            workspace_raw,
            workspace_norm,
            name_raw,
            name_norm,
            title,
            capsule_text: self.text,
            capsule_chars: metrics.chars,
            tokens_estimate: metrics.tokens_estimate,
            tags: normalize_tags(&self.tags),
            source: non_blank(self.source),
            run_id: non_blank(self.run_id),
            phase: non_blank(self.phase),
            role: non_blank(self.role),
            created_at: now_ms,
            updated_at: now_ms,
            lifecycle: Lifecycle::Active,
        })
    }
}

/// Normalizes one tag: trimmed and lowercased, `None` when blank.
pub fn normalize_tag(tag: &str) -> Option<String> {
    let trimmed = tag.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

/// Normalizes tags, dropping blanks and later duplicates.
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        if let Some(value) = normalize_tag(tag) {
            if !normalized.contains(&value) {
                normalized.push(value);
            }
        }
    }
    normalized
}

/// Current wall clock in epoch milliseconds.
pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|inner| inner.trim().to_string())
        .filter(|inner| !inner.is_empty())
}
