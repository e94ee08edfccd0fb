//! Stable error contract for capsule operations.
//!
//! # Responsibility
//! - Map layer errors (`AddressError`, `RepoError`, `SearchError`,
//!   `DbError`) into one caller-facing taxonomy.
//! - Expose stable string codes.
//!
//! # Invariants
//! - `Internal` never leaks storage details through `Display`; details go to
//!   the log.

use crate::db::DbError;
use crate::model::address::AddressError;
use crate::repo::capsule_repo::RepoError;
use crate::search::fts::SearchError;
use log::error;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Stable, serializable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequest,
    NotFound,
    AmbiguousAddressing,
    NameAlreadyExists,
    CapsuleTooLarge,
    CapsuleTooThin,
    ComposeTooLarge,
    Internal,
    Cancelled,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::NotFound => "NOT_FOUND",
            Self::AmbiguousAddressing => "AMBIGUOUS_ADDRESSING",
            Self::NameAlreadyExists => "NAME_ALREADY_EXISTS",
            Self::CapsuleTooLarge => "CAPSULE_TOO_LARGE",
            Self::CapsuleTooThin => "CAPSULE_TOO_THIN",
            Self::ComposeTooLarge => "COMPOSE_TOO_LARGE",
            Self::Internal => "INTERNAL",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type CapsuleResult<T> = Result<T, CapsuleError>;

/// Caller-facing error for capsule operations.
#[derive(Debug)]
pub enum CapsuleError {
    /// Malformed input, bad query syntax or bad enum value.
    InvalidRequest(String),
    NotFound(String),
    AmbiguousAddressing,
    NameAlreadyExists {
        workspace: String,
        name: String,
    },
    CapsuleTooLarge {
        chars: i64,
        max_chars: i64,
    },
    CapsuleTooThin {
        missing: Vec<String>,
    },
    ComposeTooLarge {
        chars: i64,
        max_chars: i64,
    },
    Cancelled,
    /// Unexpected storage or encoding failure; detail is for logs only.
    Internal(String),
}

impl CapsuleError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::AmbiguousAddressing => ErrorCode::AmbiguousAddressing,
            Self::NameAlreadyExists { .. } => ErrorCode::NameAlreadyExists,
            Self::CapsuleTooLarge { .. } => ErrorCode::CapsuleTooLarge,
            Self::CapsuleTooThin { .. } => ErrorCode::CapsuleTooThin,
            Self::ComposeTooLarge { .. } => ErrorCode::ComposeTooLarge,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    pub(crate) fn internal(detail: impl Display) -> Self {
        let detail = detail.to_string();
        error!("event=internal_error module=core status=error error={detail}");
        Self::Internal(detail)
    }
}

impl Display for CapsuleError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidRequest(message) => write!(f, "invalid request: {message}"),
            Self::NotFound(what) => write!(f, "capsule not found: {what}"),
            Self::AmbiguousAddressing => {
                write!(f, "address a capsule by id or by name+workspace, not both")
            }
            Self::NameAlreadyExists { workspace, name } => write!(
                f,
                "an active capsule named `{name}` already exists in workspace `{workspace}`"
            ),
            Self::CapsuleTooLarge { chars, max_chars } => write!(
                f,
                "capsule is {chars} chars; the limit is {max_chars}"
            ),
            Self::CapsuleTooThin { missing } => write!(
                f,
                "capsule is missing required sections: {}",
                missing.join(", ")
            ),
            Self::ComposeTooLarge { chars, max_chars } => write!(
                f,
                "composed bundle is {chars} chars; the limit is {max_chars}"
            ),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::Internal(_) => write!(f, "internal error"),
        }
    }
}

impl Error for CapsuleError {}

impl From<AddressError> for CapsuleError {
    fn from(value: AddressError) -> Self {
        match value {
            AddressError::Ambiguous => Self::AmbiguousAddressing,
            AddressError::Invalid(message) => Self::InvalidRequest(message),
        }
    }
}

impl From<RepoError> for CapsuleError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::NotFound(address) => Self::NotFound(address.to_string()),
            RepoError::NameAlreadyExists { workspace, name } => {
                Self::NameAlreadyExists { workspace, name }
            }
            RepoError::InvalidRequest(message) => Self::InvalidRequest(message),
            other @ (RepoError::Db(_) | RepoError::IdCollision(_) | RepoError::InvalidData(_)) => {
                Self::internal(other)
            }
        }
    }
}

impl From<SearchError> for CapsuleError {
    fn from(value: SearchError) -> Self {
        match value {
            SearchError::InvalidQuery { message, .. } => Self::InvalidRequest(message),
            other => Self::internal(other),
        }
    }
}

impl From<DbError> for CapsuleError {
    fn from(value: DbError) -> Self {
        Self::internal(value)
    }
}

impl From<rusqlite::Error> for CapsuleError {
    fn from(value: rusqlite::Error) -> Self {
        Self::internal(value)
    }
}

#[cfg(test)]
mod tests {
    use super::{CapsuleError, ErrorCode};
    use crate::model::address::AddressError;

    #[test]
    fn codes_serialize_as_screaming_snake_case() {
        let encoded = serde_json::to_string(&ErrorCode::NameAlreadyExists).unwrap();
        assert_eq!(encoded, "\"NAME_ALREADY_EXISTS\"");
        assert_eq!(ErrorCode::ComposeTooLarge.as_str(), "COMPOSE_TOO_LARGE");
    }

    #[test]
    fn address_errors_map_to_stable_codes() {
        assert_eq!(
            CapsuleError::from(AddressError::Ambiguous).code(),
            ErrorCode::AmbiguousAddressing
        );
        assert_eq!(
            CapsuleError::from(AddressError::Invalid("x".to_string())).code(),
            ErrorCode::InvalidRequest
        );
    }

    #[test]
    fn internal_display_is_opaque() {
        let err = CapsuleError::Internal("disk I/O error at /secret/path".to_string());
        assert_eq!(err.to_string(), "internal error");
    }
}
