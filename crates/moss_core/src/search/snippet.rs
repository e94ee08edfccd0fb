//! Snippet rendering for search hits.
//!
//! # Responsibility
//! - Convert engine match context into display-safe HTML fragments.
//!
//! # Invariants
//! - The only unescaped markup in output is `<mark>` / `</mark>`, and the
//!   two are always balanced.
//! - Escaping runs before truncation; truncation never splits a code point,
//!   a tag, or an entity.
//!
//! Stages: [`mark_placeholders`] → [`escape_html`] → [`restore_highlights`]
//! → [`truncate_snippet`].

/// Marker emitted by the FTS `snippet()` call before a matched term.
pub const MATCH_OPEN: char = '\u{2}';
/// Marker emitted by the FTS `snippet()` call after a matched term.
pub const MATCH_CLOSE: char = '\u{3}';
pub const HIGHLIGHT_OPEN: &str = "<mark>";
pub const HIGHLIGHT_CLOSE: &str = "</mark>";
/// Character budget for a rendered snippet, before the ellipsis.
pub const SNIPPET_BUDGET: usize = 300;
const ELLIPSIS: char = '…';

const PLACEHOLDER_OPEN: char = '\u{E000}';
const PLACEHOLDER_CLOSE: char = '\u{E001}';

/// Runs the full pipeline over raw engine output.
pub fn render_snippet(raw: &str) -> String {
    let marked = mark_placeholders(raw);
    let escaped = escape_html(&marked);
    let highlighted = restore_highlights(&escaped);
    truncate_snippet(&highlighted, SNIPPET_BUDGET)
}

/// Swaps engine markers for private-use placeholders.
///
/// Placeholder code points already present in user text are dropped so they
/// cannot be promoted to highlight tags.
pub fn mark_placeholders(raw: &str) -> String {
    raw.chars()
        .filter(|ch| *ch != PLACEHOLDER_OPEN && *ch != PLACEHOLDER_CLOSE)
        .map(|ch| match ch {
            MATCH_OPEN => PLACEHOLDER_OPEN,
            MATCH_CLOSE => PLACEHOLDER_CLOSE,
            other => other,
        })
        .collect()
}

/// Entity-escapes `& < > " '`.
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Turns placeholders into highlight tags, dropping orphans.
///
/// A close without an open is dropped, a repeated open is ignored, and an
/// open left dangling at the end is closed.
pub fn restore_highlights(text: &str) -> String {
    let mut restored = String::with_capacity(text.len() + 16);
    let mut open = false;
    for ch in text.chars() {
        match ch {
            PLACEHOLDER_OPEN if !open => {
                restored.push_str(HIGHLIGHT_OPEN);
                open = true;
            }
            PLACEHOLDER_CLOSE if open => {
                restored.push_str(HIGHLIGHT_CLOSE);
                open = false;
            }
            PLACEHOLDER_OPEN | PLACEHOLDER_CLOSE => {}
            other => restored.push(other),
        }
    }
    if open {
        restored.push_str(HIGHLIGHT_CLOSE);
    }
    restored
}

/// Cuts already-escaped text to `budget` characters.
///
/// Prefers the last whitespace when that keeps at least half the budget,
/// backs out of partial tags and entities, drops a dangling `<mark>`, closes
/// an open highlight and appends an ellipsis. Text within budget is returned unchanged.
pub fn truncate_snippet(text: &str, budget: usize) -> String {
    if text.chars().count() <= budget {
        return text.to_string();
    }

    let cut = text
        .char_indices()
        .nth(budget)
        .map_or(text.len(), |(index, _)| index);
    let mut head = &text[..cut];

    if let Some(space) = head.rfind(char::is_whitespace) {
        let kept = head[..space].chars().count();
        if kept * 2 >= budget {
            head = &head[..space];
        }
    }

    loop {
        let before = head.len();
        if let Some(lt) = head.rfind('<') {
            if !head[lt..].contains('>') {
                head = &head[..lt];
            }
        }
        if let Some(amp) = head.rfind('&') {
            if !head[amp..].contains(';') {
                head = &head[..amp];
            }
        }
        if let Some(stripped) = head.trim_end().strip_suffix(HIGHLIGHT_OPEN) {
            head = stripped;
        }
        if head.len() == before {
            break;
        }
    }

    let mut truncated = head.trim_end().to_string();
    let opens = truncated.matches(HIGHLIGHT_OPEN).count();
    let closes = truncated.matches(HIGHLIGHT_CLOSE).count();
    for _ in closes..opens {
        truncated.push_str(HIGHLIGHT_CLOSE);
    }
    truncated.push(ELLIPSIS);
    truncated
}
