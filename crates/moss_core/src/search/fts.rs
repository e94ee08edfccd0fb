//! SQLite FTS5-based capsule search.
//!
//! # Responsibility
//! - Run ranked full-text queries over capsule title + body.
//! - Apply structured filters and pagination.
//! - Shape hits into summaries, fetch keys and safe snippets.
//!
//! # Invariants
//! - Tombstoned capsules are excluded unless `include_deleted` is set.
//! - Ranking is `bm25` with title weighted 5x body; ties are ordered by
//!   `updated_at DESC, id ASC`.
//! - User query text never reaches FTS5 unparsed.

use crate::db::DbError;
use crate::model::capsule::{CapsuleSummary, FetchKey, Pagination};
use crate::repo::capsule_repo::{parse_capsule_row, CapsuleFilter, RepoError};
use crate::search::query::{build_match_expression, QueryError};
use crate::search::snippet::render_snippet;
use log::debug;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub const SEARCH_DEFAULT_LIMIT: u32 = 20;
pub const SEARCH_LIMIT_MAX: u32 = 100;
const TITLE_WEIGHT: f64 = 5.0;
const BODY_WEIGHT: f64 = 1.0;
/// Tokens of context `snippet()` keeps around a match.
const SNIPPET_TOKENS: i64 = 32;

/// Result type for search APIs.
pub type SearchResult<T> = Result<T, SearchError>;

/// Search-layer error for query parsing, DB interaction and result decoding.
#[derive(Debug)]
pub enum SearchError {
    /// User query violates the supported grammar or FTS5 syntax.
    InvalidQuery {
        query: String,
        message: String,
    },
    Db(DbError),
    InvalidData(String),
}

impl Display for SearchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidQuery { query, message } => {
                write!(f, "invalid search query `{query}`: {message}")
            }
            Self::Db(err) => write!(f, "{err}"),
            Self::InvalidData(message) => write!(f, "invalid search row: {message}"),
        }
    }
}

impl Error for SearchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::InvalidQuery { .. } | Self::InvalidData(_) => None,
        }
    }
}

impl From<DbError> for SearchError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for SearchError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<RepoError> for SearchError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::Db(err) => Self::Db(err),
            other => Self::InvalidData(other.to_string()),
        }
    }
}

/// Search options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    /// User query text in the supported grammar.
    pub text: String,
    pub filter: CapsuleFilter,
    pub include_deleted: bool,
    /// Defaults to 20, clamped to 100.
    pub limit: Option<u32>,
    pub offset: u32,
}

impl SearchQuery {
    /// Creates a query with default pagination and no filters.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

/// Single ranked hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub summary: CapsuleSummary,
    pub fetch_key: FetchKey,
    /// Escaped HTML fragment with `<mark>` highlights.
    pub snippet: String,
    /// Relevance, higher is better.
    pub score: f64,
}

/// One page of hits.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchPage {
    pub hits: Vec<SearchHit>,
    pub pagination: Pagination,
}

/// Normalizes a requested page size.
pub fn normalize_search_limit(limit: Option<u32>) -> u32 {
    match limit {
        None | Some(0) => SEARCH_DEFAULT_LIMIT,
        Some(value) => value.min(SEARCH_LIMIT_MAX),
    }
}

/// Searches capsules and returns one ranked page.
///
/// # Errors
/// - `InvalidQuery` for blank or malformed query text.
pub fn search_capsules(conn: &Connection, query: &SearchQuery) -> SearchResult<SearchPage> {
    let match_expr = build_match_expression(&query.text).map_err(|err| invalid_query(query, &err))?;
    let limit = normalize_search_limit(query.limit);
    debug!(
        "event=search_query module=search status=start limit={} offset={} include_deleted={}",
        limit, query.offset, query.include_deleted
    );

    let mut where_sql = String::from(" WHERE capsules_fts MATCH ?");
    let mut bind_values: Vec<Value> = vec![Value::Text(match_expr.clone())];
    if !query.include_deleted {
        where_sql.push_str(" AND capsules.deleted_at IS NULL");
    }
    query
        .filter
        .normalized()
        .push_sql(&mut where_sql, &mut bind_values);

    let from_sql = " FROM capsules_fts JOIN capsules ON capsules.seq = capsules_fts.rowid";

    let total: i64 = conn
        .query_row(
            &format!("SELECT COUNT(*){from_sql}{where_sql}"),
            params_from_iter(bind_values.iter()),
            |row| row.get(0),
        )
        .map_err(|err| map_query_error(err, &query.text))?;

    let sql = format!(
        "SELECT
            capsules.id,
            capsules.workspace_raw,
            capsules.workspace_norm,
            capsules.name_raw,
            capsules.name_norm,
            capsules.title,
            capsules.capsule_text,
            capsules.capsule_chars,
            capsules.tokens_estimate,
            capsules.tags,
            capsules.source,
            capsules.run_id,
            capsules.phase,
            capsules.role,
            capsules.created_at,
            capsules.updated_at,
            capsules.deleted_at,
            bm25(capsules_fts, {TITLE_WEIGHT:.1}, {BODY_WEIGHT:.1}) AS match_rank,
            snippet(capsules_fts, -1, char(2), char(3), '…', {SNIPPET_TOKENS}) AS raw_snippet
         {from_sql}{where_sql}
         ORDER BY match_rank ASC, capsules.updated_at DESC, capsules.id ASC
         LIMIT ? OFFSET ?"
    );
    bind_values.push(Value::Integer(i64::from(limit)));
    bind_values.push(Value::Integer(i64::from(query.offset)));

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt
        .query(params_from_iter(bind_values))
        .map_err(|err| map_query_error(err, &query.text))?;
    let mut hits = Vec::new();
    while let Some(row) = rows
        .next()
        .map_err(|err| map_query_error(err, &query.text))?
    {
        let capsule = parse_capsule_row(row)?;
        let rank: f64 = row.get("match_rank")?;
        let raw_snippet: Option<String> = row.get("raw_snippet")?;
        hits.push(SearchHit {
            fetch_key: capsule.fetch_key(),
            summary: capsule.summary(),
            snippet: render_snippet(raw_snippet.as_deref().unwrap_or_default()),
            score: -rank,
        });
    }

    let total = u64::try_from(total)
        .map_err(|_| SearchError::InvalidData(format!("negative hit count {total}")))?;
    let pagination = Pagination::new(limit, query.offset, hits.len(), total);
    Ok(SearchPage { hits, pagination })
}

fn invalid_query(query: &SearchQuery, err: &QueryError) -> SearchError {
    SearchError::InvalidQuery {
        query: query.text.clone(),
        message: err.to_string(),
    }
}

fn map_query_error(err: rusqlite::Error, query: &str) -> SearchError {
    if is_match_syntax_error(&err) {
        return SearchError::InvalidQuery {
            query: query.to_string(),
            message: err.to_string(),
        };
    }

    SearchError::Db(DbError::Sqlite(err))
}

fn is_match_syntax_error(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(_, Some(message)) => {
            let msg = message.to_lowercase();
            (msg.contains("fts5") && msg.contains("syntax"))
                || msg.contains("malformed match expression")
                || msg.contains("unterminated")
        }
        _ => false,
    }
}
