//! Capsule content validation.
//!
//! # Responsibility
//! - Define the `ContentValidator` seam consumed by store/update/compose.
//! - Provide the default markdown-section validator.
//!
//! # Invariants
//! - Validators are pure: they never touch storage.
//! - Size is measured in characters, matching `capsule_chars`.

pub mod sections;

use crate::model::address::normalize;
use crate::model::capsule::measure_text;
use sections::{parse_sections, Section};
use serde::{Deserialize, Serialize};

/// Headings every capsule is expected to carry, in display order.
pub const REQUIRED_SECTIONS: &[&str] = &[
    "Objective",
    "Current Status",
    "Decisions",
    "Key Locations",
    "Open Questions",
    "Next Steps",
];

/// Outcome of validating one capsule text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LintReport {
    /// Required sections found with real content.
    pub present: Vec<String>,
    /// Required sections with no heading at all.
    pub missing: Vec<String>,
    /// Required sections whose body is empty or placeholder-only.
    pub placeholders: Vec<String>,
    pub chars: i64,
    pub max_chars: i64,
    pub too_large: bool,
    /// Always `false` when validation ran with `allow_thin`.
    pub too_thin: bool,
}

impl LintReport {
    /// Missing and placeholder section names, for error messages.
    pub fn thin_sections(&self) -> Vec<String> {
        self.missing
            .iter()
            .chain(self.placeholders.iter())
            .cloned()
            .collect()
    }
}

/// Content oracle used before persisting capsule text.
pub trait ContentValidator: Send + Sync {
    fn validate(&self, text: &str, max_chars: i64, allow_thin: bool) -> LintReport;
}

/// Default validator checking [`REQUIRED_SECTIONS`].
#[derive(Debug, Clone)]
pub struct SectionValidator {
    required: Vec<String>,
}

impl Default for SectionValidator {
    fn default() -> Self {
        Self::new(REQUIRED_SECTIONS.iter().map(|name| name.to_string()))
    }
}

impl SectionValidator {
    pub fn new(required: impl IntoIterator<Item = String>) -> Self {
        Self {
            required: required.into_iter().collect(),
        }
    }
}

impl ContentValidator for SectionValidator {
    fn validate(&self, text: &str, max_chars: i64, allow_thin: bool) -> LintReport {
        let chars = measure_text(text).chars;
        let sections = parse_sections(text);

        let mut present = Vec::new();
        let mut missing = Vec::new();
        let mut placeholders = Vec::new();
        for name in &self.required {
            let key = normalize(name);
            let matching: Vec<&Section> = sections
                .iter()
                .filter(|section| section.key() == key)
                .collect();
            if matching.is_empty() {
                missing.push(name.clone());
            } else if matching.iter().all(|section| section.is_placeholder()) {
                placeholders.push(name.clone());
            } else {
                present.push(name.clone());
            }
        }

        let too_thin = !allow_thin && (!missing.is_empty() || !placeholders.is_empty());
        LintReport {
            present,
            missing,
            placeholders,
            chars,
            max_chars,
            too_large: chars > max_chars,
            too_thin,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ContentValidator, SectionValidator, REQUIRED_SECTIONS};

    fn full_text() -> String {
        REQUIRED_SECTIONS
            .iter()
            .map(|name| format!("## {name}\nreal content for {name}\n"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn complete_text_passes() {
        let report = SectionValidator::default().validate(&full_text(), 10_000, false);
        assert!(!report.too_thin);
        assert!(!report.too_large);
        assert_eq!(report.present.len(), REQUIRED_SECTIONS.len());
    }

    #[test]
    fn missing_and_placeholder_sections_are_thin() {
        let text = "## Objective\nship it\n\n## Decisions\nTBD\n";
        let report = SectionValidator::default().validate(text, 10_000, false);
        assert!(report.too_thin);
        assert!(report.missing.contains(&"Current Status".to_string()));
        assert_eq!(report.placeholders, vec!["Decisions".to_string()]);
        assert_eq!(report.present, vec!["Objective".to_string()]);
    }

    #[test]
    fn allow_thin_suppresses_thin_verdict_only() {
        let report = SectionValidator::default().validate("tiny", 2, true);
        assert!(!report.too_thin);
        assert!(report.too_large);
        assert_eq!(report.chars, 4);
    }
}
