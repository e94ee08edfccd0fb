//! Markdown section parsing and filtering.
//!
//! Headings inside fenced code blocks are ignored. A section body runs until
//! the next heading of the same or a higher level.

use crate::model::address::normalize;
use once_cell::sync::Lazy;
use regex::Regex;

static HEADING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(#{1,6})[ \t]+(.+?)[ \t#]*$").expect("valid heading regex"));
static PLACEHOLDER_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:[-*+][ \t]*)?(?:tbd|todo|tba|n/?a|none|pending|-+|\.\.\.|…|<[^>]*>|\[[^\]]*\]|\([^)]*\))$")
        .expect("valid placeholder regex")
});

/// One markdown section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Heading text without `#` markers.
    pub heading: String,
    pub level: usize,
    /// Original heading line.
    pub heading_line: String,
    /// Lines after the heading, trailing blank lines trimmed.
    pub body: String,
}

impl Section {
    /// Case- and whitespace-insensitive lookup key.
    pub fn key(&self) -> String {
        normalize(&self.heading)
    }

    /// Returns whether the body is blank or made only of placeholder lines.
    pub fn is_placeholder(&self) -> bool {
        self.body
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .all(|line| PLACEHOLDER_LINE_RE.is_match(line))
    }

    pub fn render(&self) -> String {
        if self.body.is_empty() {
            self.heading_line.clone()
        } else {
            format!("{}\n{}", self.heading_line, self.body)
        }
    }
}

/// Splits markdown text into its sections, in document order.
pub fn parse_sections(text: &str) -> Vec<Section> {
    let lines: Vec<&str> = text.lines().collect();
    let mut headings: Vec<(usize, usize, String)> = Vec::new();
    let mut in_fence = false;
    for (index, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if let Some(caps) = HEADING_RE.captures(line) {
            headings.push((index, caps[1].len(), caps[2].trim().to_string()));
        }
    }

    let mut sections = Vec::with_capacity(headings.len());
    for (position, (start, level, heading)) in headings.iter().enumerate() {
        let end = headings[position + 1..]
            .iter()
            .find(|(_, next_level, _)| next_level <= level)
            .map_or(lines.len(), |(next_start, _, _)| *next_start);
        let body = lines[start + 1..end].join("\n").trim_end().to_string();
        let body = body.trim_start_matches('\n').to_string();
        sections.push(Section {
            heading: heading.clone(),
            level: *level,
            heading_line: lines[*start].trim_end().to_string(),
            body,
        });
    }
    sections
}

/// Keeps only the sections named in `allow`, in `allow` order.
///
/// Matching is case-insensitive and exact on the heading text; placeholder
/// sections are skipped. Returns `None` when nothing matched.
pub fn filter_sections(text: &str, allow: &[String]) -> Option<String> {
    let sections = parse_sections(text);
    let mut seen: Vec<String> = Vec::new();
    let mut kept: Vec<String> = Vec::new();
    for name in allow {
        let key = normalize(name);
        if key.is_empty() || seen.contains(&key) {
            continue;
        }
        for section in sections
            .iter()
            .filter(|section| section.key() == key && !section.is_placeholder())
        {
            kept.push(section.render());
        }
        seen.push(key);
    }

    if kept.is_empty() {
        None
    } else {
        Some(kept.join("\n\n"))
    }
}
