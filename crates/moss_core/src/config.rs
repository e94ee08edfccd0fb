//! Store configuration.
//!
//! # Responsibility
//! - Hold size budgets applied by store, update and compose.
//! - Load overrides from the environment.
//!
//! # Invariants
//! - Budgets are strictly positive after `validate()`.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub const DEFAULT_CAPSULE_MAX_CHARS: i64 = 12_000;
pub const DEFAULT_COMPOSE_MAX_CHARS: i64 = 60_000;

pub const ENV_CAPSULE_MAX_CHARS: &str = "MOSS_CAPSULE_MAX_CHARS";
pub const ENV_COMPOSE_MAX_CHARS: &str = "MOSS_COMPOSE_MAX_CHARS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub key: &'static str,
    pub message: String,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid config `{}`: {}", self.key, self.message)
    }
}

impl Error for ConfigError {}

/// Size budgets for capsule and compose operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum characters of one capsule text.
    pub capsule_max_chars: i64,
    /// Maximum characters of one composed bundle.
    pub compose_max_chars: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capsule_max_chars: DEFAULT_CAPSULE_MAX_CHARS,
            compose_max_chars: DEFAULT_COMPOSE_MAX_CHARS,
        }
    }
}

impl StoreConfig {
    /// Defaults overlaid with `MOSS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup` and validates the result.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(value) = lookup(ENV_CAPSULE_MAX_CHARS) {
            self.capsule_max_chars = parse_budget(ENV_CAPSULE_MAX_CHARS, &value)?;
        }
        if let Some(value) = lookup(ENV_COMPOSE_MAX_CHARS) {
            self.compose_max_chars = parse_budget(ENV_COMPOSE_MAX_CHARS, &value)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capsule_max_chars <= 0 {
            return Err(ConfigError {
                key: "capsule_max_chars",
                message: "must be positive".to_string(),
            });
        }
        if self.compose_max_chars <= 0 {
            return Err(ConfigError {
                key: "compose_max_chars",
                message: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_budget(key: &'static str, value: &str) -> Result<i64, ConfigError> {
    value
        .trim()
        .parse::<i64>()
        .map_err(|err| ConfigError {
            key,
            message: format!("`{value}` is not an integer: {err}"),
        })
}
