//! Bundling of several capsules into one document.
//!
//! # Responsibility
//! - Validate compose requests.
//! - Read every referenced capsule inside one read transaction.
//! - Filter sections and assemble markdown or JSON bundles under a budget.
//!
//! # Invariants
//! - Compose is all-or-nothing: one bad ref fails the whole call.
//! - Part order follows ref order.
//! - JSON bundles are never persisted.

use crate::error::{CapsuleError, CapsuleResult};
use crate::lint::sections::filter_sections;
use crate::model::address::CapsuleRef;
use crate::model::capsule::{measure_text, FetchKey};
use crate::model::id::CapsuleId;
use crate::repo::capsule_repo::{CapsuleRepository, SqliteCapsuleRepository};
use crate::service::collision::StoreMode;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tokio_util::sync::CancellationToken;

pub const COMPOSE_MAX_REFS: usize = 50;

const PART_SEPARATOR: &str = "\n\n---\n\n";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComposeFormat {
    #[default]
    Markdown,
    Json,
}

impl FromStr for ComposeFormat {
    type Err = CapsuleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "markdown" | "md" => Ok(Self::Markdown),
            "json" => Ok(Self::Json),
            other => Err(CapsuleError::InvalidRequest(format!(
                "unsupported compose format `{other}`; expected markdown|json"
            ))),
        }
    }
}

/// Where a composed bundle is saved as a new capsule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeStoreTarget {
    #[serde(default)]
    pub workspace: String,
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub mode: StoreMode,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub allow_thin: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeRequest {
    pub refs: Vec<CapsuleRef>,
    #[serde(default)]
    pub format: ComposeFormat,
    /// Section headings to keep; empty keeps whole capsules.
    #[serde(default)]
    pub sections: Vec<String>,
    #[serde(default)]
    pub store: Option<ComposeStoreTarget>,
}

impl ComposeRequest {
    pub fn validate(&self) -> CapsuleResult<()> {
        if self.refs.is_empty() || self.refs.len() > COMPOSE_MAX_REFS {
            return Err(CapsuleError::InvalidRequest(format!(
                "compose takes 1 to {COMPOSE_MAX_REFS} refs, got {}",
                self.refs.len()
            )));
        }
        if self.store.is_some() && self.format == ComposeFormat::Json {
            return Err(CapsuleError::InvalidRequest(
                "json bundles cannot be stored; use markdown".to_string(),
            ));
        }
        if let Some(target) = self.store.as_ref() {
            if target.name.trim().is_empty() {
                return Err(CapsuleError::InvalidRequest(
                    "compose store target requires a name".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// One capsule contribution to a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposePart {
    pub id: CapsuleId,
    pub fetch_key: FetchKey,
    pub title: Option<String>,
    pub name: Option<String>,
    pub text: String,
    pub chars: i64,
}

impl ComposePart {
    fn heading(&self) -> String {
        self.title
            .clone()
            .or_else(|| self.name.clone())
            .unwrap_or_else(|| self.id.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComposeResult {
    pub format: ComposeFormat,
    pub bundle: String,
    pub parts: Vec<ComposePart>,
    pub chars: i64,
    pub tokens_estimate: i64,
    /// Set when the bundle was persisted.
    pub stored: Option<FetchKey>,
}

/// Reads and filters parts for `request` through `conn`.
///
/// `conn` is expected to be a read transaction so every part comes from one
/// snapshot. Checks `cancel` once per ref.
pub(crate) fn collect_parts(
    conn: &Connection,
    request: &ComposeRequest,
    max_chars: i64,
    cancel: &CancellationToken,
) -> CapsuleResult<Vec<ComposePart>> {
    let repo = SqliteCapsuleRepository::new(conn);
    let mut parts = Vec::with_capacity(request.refs.len());
    let mut running_chars: i64 = 0;

    for capsule_ref in &request.refs {
        if cancel.is_cancelled() {
            return Err(CapsuleError::Cancelled);
        }
        let address = capsule_ref.resolve()?;
        let capsule = repo.get(&address, false)?;

        let text = if request.sections.is_empty() {
            capsule.capsule_text.clone()
        } else {
            match filter_sections(&capsule.capsule_text, &request.sections) {
                Some(filtered) => filtered,
                None => continue,
            }
        };
        let chars = measure_text(&text).chars;
        running_chars = running_chars.saturating_add(chars);
        if running_chars > max_chars {
            return Err(CapsuleError::ComposeTooLarge {
                chars: running_chars,
                max_chars,
            });
        }

        parts.push(ComposePart {
            id: capsule.id,
            fetch_key: capsule.fetch_key(),
            title: capsule.title.clone(),
            name: capsule.name_raw.clone(),
            text,
            chars,
        });
    }

    Ok(parts)
}

/// Formats parts and enforces the bundle budget.
pub(crate) fn assemble(
    parts: &[ComposePart],
    format: ComposeFormat,
    max_chars: i64,
) -> CapsuleResult<String> {
    let bundle = match format {
        ComposeFormat::Markdown => parts
            .iter()
            .map(|part| format!("## {}\n\n{}", part.heading(), part.text.trim_end()))
            .collect::<Vec<_>>()
            .join(PART_SEPARATOR),
        ComposeFormat::Json => {
            serde_json::to_string_pretty(parts).map_err(CapsuleError::internal)?
        }
    };

    let chars = measure_text(&bundle).chars;
    if chars > max_chars {
        return Err(CapsuleError::ComposeTooLarge { chars, max_chars });
    }
    Ok(bundle)
}
