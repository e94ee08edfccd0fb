//! Address normalization and resolution.
//!
//! # Responsibility
//! - Turn free-form `(id | workspace + name)` input into one canonical
//!   [`Address`].
//!
//! # Invariants
//! - `normalize` is idempotent.
//! - An ID combined with a name or workspace is always ambiguous.
//! - Resolution is pure: no storage access.

use crate::model::id::{parse_capsule_id, CapsuleId};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Workspace used when a by-name address omits one.
pub const DEFAULT_WORKSPACE: &str = "default";

/// Canonical capsule address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    ById {
        id: CapsuleId,
    },
    ByName {
        workspace_norm: String,
        name_norm: String,
    },
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ById { id } => write!(f, "id={id}"),
            Self::ByName {
                workspace_norm,
                name_norm,
            } => write!(f, "workspace={workspace_norm} name={name_norm}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// Both an ID and a name/workspace were supplied.
    Ambiguous,
    /// Input cannot address any capsule.
    Invalid(String),
}

impl Display for AddressError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ambiguous => write!(f, "address by id or by name+workspace, not both"),
            Self::Invalid(message) => write!(f, "{message}"),
        }
    }
}

impl Error for AddressError {}

/// Serializable capsule reference as accepted by batch APIs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsuleRef {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl CapsuleRef {
    pub fn by_id(id: impl ToString) -> Self {
        Self {
            id: Some(id.to_string()),
            ..Self::default()
        }
    }

    pub fn by_name(workspace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: None,
            workspace: Some(workspace.into()),
            name: Some(name.into()),
        }
    }

    pub fn resolve(&self) -> Result<Address, AddressError> {
        resolve_address(
            self.id.as_deref().unwrap_or(""),
            self.workspace.as_deref().unwrap_or(""),
            self.name.as_deref().unwrap_or(""),
        )
    }
}

/// Trims, lowercases and collapses internal whitespace to single spaces.
pub fn normalize(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Resolves raw address input.
///
/// # Errors
/// - `Ambiguous` when `id` is set together with `workspace` or `name`.
/// - `Invalid` when neither `id` nor `name` is set, the ID is malformed, or
///   the name normalizes to an empty string.
pub fn resolve_address(id: &str, workspace: &str, name: &str) -> Result<Address, AddressError> {
    let id = id.trim();
    let workspace = workspace.trim();
    let name = name.trim();

    if !id.is_empty() {
        if !workspace.is_empty() || !name.is_empty() {
            return Err(AddressError::Ambiguous);
        }
        let parsed = parse_capsule_id(id)
            .ok_or_else(|| AddressError::Invalid(format!("malformed capsule id `{id}`")))?;
        return Ok(Address::ById { id: parsed });
    }

    if name.is_empty() {
        return Err(AddressError::Invalid(
            "either id or name is required".to_string(),
        ));
    }

    let workspace_norm = match normalize(workspace) {
        value if value.is_empty() => DEFAULT_WORKSPACE.to_string(),
        value => value,
    };
    let name_norm = normalize(name);
    if name_norm.is_empty() {
        return Err(AddressError::Invalid("name must not be blank".to_string()));
    }

    Ok(Address::ByName {
        workspace_norm,
        name_norm,
    })
}

#[cfg(test)]
mod tests {
    use super::{normalize, resolve_address, Address, AddressError, CapsuleRef};
    use uuid::Uuid;

    #[test]
    fn id_with_name_or_workspace_is_ambiguous() {
        let id = Uuid::now_v7().to_string();
        assert_eq!(
            resolve_address(&id, "", "auth"),
            Err(AddressError::Ambiguous)
        );
        assert_eq!(
            resolve_address(&id, "work", ""),
            Err(AddressError::Ambiguous)
        );
    }

    #[test]
    fn missing_id_and_name_is_invalid() {
        assert!(matches!(
            resolve_address("", "work", "   "),
            Err(AddressError::Invalid(_))
        ));
        assert!(matches!(
            resolve_address("", "", ""),
            Err(AddressError::Invalid(_))
        ));
    }

    #[test]
    fn malformed_id_is_invalid() {
        assert!(matches!(
            resolve_address("abc", "", ""),
            Err(AddressError::Invalid(_))
        ));
    }

    #[test]
    fn by_name_defaults_workspace_and_normalizes() {
        let address = resolve_address("", "", "  Auth \t Flow ").unwrap();
        assert_eq!(
            address,
            Address::ByName {
                workspace_norm: "default".to_string(),
                name_norm: "auth flow".to_string(),
            }
        );
    }

    #[test]
    fn normalize_is_idempotent() {
        for raw in ["  Mixed   CASE\tname ", "already normal", "ÄÖ  Ü", ""] {
            let once = normalize(raw);
            assert_eq!(normalize(&once), once);
        }
    }

    #[test]
    fn capsule_ref_routes_through_resolver() {
        let id = Uuid::now_v7();
        assert_eq!(
            CapsuleRef::by_id(id).resolve().unwrap(),
            Address::ById { id }
        );
        let ambiguous = CapsuleRef {
            id: Some(id.to_string()),
            workspace: None,
            name: Some("x".to_string()),
        };
        assert_eq!(ambiguous.resolve(), Err(AddressError::Ambiguous));
    }
}
