//! Capsule identity store: contracts and SQLite implementation.
//!
//! # Responsibility
//! - Point lookups by ID or `(workspace, name)` with tombstone visibility.
//! - Insert, atomic upsert, full-row update, soft delete and purge.
//! - Filtered bulk mutations and paginated listing.
//!
//! # Invariants
//! - Active-name uniqueness is enforced by the partial unique index
//!   `idx_capsules_active_name`; nothing here checks-then-writes it.
//! - An ID collision is never resolved by overwriting.
//! - `updated_at` only moves forward: `max(previous + 1, now)`.
//! - Bulk mutations touch active rows only and require a non-empty filter.

use crate::db::DbError;
use crate::model::address::{normalize, Address};
use crate::model::capsule::{normalize_tag, normalize_tags, now_epoch_ms, Capsule, Lifecycle};
use crate::model::id::{parse_capsule_id, CapsuleId};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::error::Error;
use std::fmt::{Display, Formatter};

const CAPSULE_SELECT_SQL: &str = "SELECT
    id,
    workspace_raw,
    workspace_norm,
    name_raw,
    name_norm,
    title,
    capsule_text,
    capsule_chars,
    tokens_estimate,
    tags,
    source,
    run_id,
    phase,
    role,
    created_at,
    updated_at,
    deleted_at
FROM capsules";

const MILLIS_PER_DAY: i64 = 86_400_000;

pub type RepoResult<T> = Result<T, RepoError>;

/// Repository error for capsule persistence and query operations.
#[derive(Debug)]
pub enum RepoError {
    Db(DbError),
    NotFound(Address),
    NameAlreadyExists { workspace: String, name: String },
    /// A write reused an ID already present in the table.
    IdCollision(CapsuleId),
    /// Caller input rejected before touching storage.
    InvalidRequest(String),
    InvalidData(String),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::NotFound(address) => write!(f, "capsule not found: {address}"),
            Self::NameAlreadyExists { workspace, name } => write!(
                f,
                "an active capsule named `{name}` already exists in workspace `{workspace}`"
            ),
            Self::IdCollision(id) => write!(f, "capsule id already in use: {id}"),
            Self::InvalidRequest(message) => write!(f, "{message}"),
            Self::InvalidData(message) => write!(f, "invalid persisted capsule data: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Structured filters shared by list, bulk and export paths.
///
/// All present filters are combined with AND.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsuleFilter {
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub name_prefix: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

impl CapsuleFilter {
    /// Normalizes every filter and drops the blank ones.
    pub fn normalized(&self) -> Self {
        Self {
            workspace: non_blank(self.workspace.as_deref().map(normalize)),
            tag: self.tag.as_deref().and_then(normalize_tag),
            name_prefix: non_blank(self.name_prefix.as_deref().map(normalize)),
            run_id: non_blank(self.run_id.as_deref().map(|v| v.trim().to_string())),
            phase: non_blank(self.phase.as_deref().map(|v| v.trim().to_string())),
            role: non_blank(self.role.as_deref().map(|v| v.trim().to_string())),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.workspace.is_none()
            && self.tag.is_none()
            && self.name_prefix.is_none()
            && self.run_id.is_none()
            && self.phase.is_none()
            && self.role.is_none()
    }

    /// Appends `AND ...` clauses for an already-normalized filter.
    pub(crate) fn push_sql(&self, sql: &mut String, bind_values: &mut Vec<Value>) {
        if let Some(workspace) = self.workspace.as_ref() {
            sql.push_str(" AND capsules.workspace_norm = ?");
            bind_values.push(Value::Text(workspace.clone()));
        }
        if let Some(tag) = self.tag.as_ref() {
            sql.push_str(
                " AND EXISTS (
                    SELECT 1 FROM json_each(capsules.tags) AS capsule_tag
                    WHERE capsule_tag.value = ?
                )",
            );
            bind_values.push(Value::Text(tag.clone()));
        }
        if let Some(prefix) = self.name_prefix.as_ref() {
            sql.push_str(" AND substr(capsules.name_norm, 1, ?) = ?");
            bind_values.push(Value::Integer(prefix.chars().count() as i64));
            bind_values.push(Value::Text(prefix.clone()));
        }
        for (column, value) in [
            ("run_id", self.run_id.as_ref()),
            ("phase", self.phase.as_ref()),
            ("role", self.role.as_ref()),
        ] {
            if let Some(value) = value {
                sql.push_str(&format!(" AND capsules.{column} = ?"));
                bind_values.push(Value::Text(value.clone()));
            }
        }
    }
}

/// Metadata fields applied by bulk update.
///
/// `None` leaves a field untouched; an empty value clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkUpdateFields {
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

impl BulkUpdateFields {
    pub fn is_empty(&self) -> bool {
        self.tags.is_none()
            && self.source.is_none()
            && self.run_id.is_none()
            && self.phase.is_none()
            && self.role.is_none()
    }
}

/// Listing options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapsuleListQuery {
    pub filter: CapsuleFilter,
    pub include_deleted: bool,
    /// `None` returns every matching row.
    pub limit: Option<u32>,
    pub offset: u32,
}

/// One listing page plus the size of the whole filtered set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapsulePage {
    pub items: Vec<Capsule>,
    pub total: u64,
}

/// Result of an atomic upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created { id: CapsuleId },
    /// An active row with the same name was updated; its ID is kept.
    Updated { id: CapsuleId },
}

impl UpsertOutcome {
    pub fn id(self) -> CapsuleId {
        match self {
            Self::Created { id } | Self::Updated { id } => id,
        }
    }
}

/// Repository interface for the capsule identity store.
pub trait CapsuleRepository {
    /// Loads one capsule by ID, `None` when absent or hidden by tombstone.
    fn find_by_id(&self, id: CapsuleId, include_deleted: bool) -> RepoResult<Option<Capsule>>;
    /// Loads the active capsule for a name; with `include_deleted` falls back
    /// to the most recently deleted one.
    fn find_by_name(
        &self,
        workspace_norm: &str,
        name_norm: &str,
        include_deleted: bool,
    ) -> RepoResult<Option<Capsule>>;
    fn insert(&self, capsule: &Capsule) -> RepoResult<()>;
    fn upsert(&self, capsule: &Capsule) -> RepoResult<UpsertOutcome>;
    /// Writes every mutable column of the row with `capsule.id`.
    fn update(&self, capsule: &Capsule) -> RepoResult<Capsule>;
    fn soft_delete(&self, id: CapsuleId) -> RepoResult<()>;
    fn purge_deleted(
        &self,
        workspace: Option<&str>,
        older_than_days: Option<u32>,
    ) -> RepoResult<usize>;
    fn bulk_soft_delete(&self, filter: &CapsuleFilter) -> RepoResult<usize>;
    fn bulk_update(&self, filter: &CapsuleFilter, fields: &BulkUpdateFields) -> RepoResult<usize>;
    fn list(&self, query: &CapsuleListQuery) -> RepoResult<CapsulePage>;
    /// Active names in `workspace_norm` equal to `base` or shaped `base-…`.
    fn active_names_with_base(&self, workspace_norm: &str, base: &str)
        -> RepoResult<HashSet<String>>;
    /// Rows for export ordered by creation.
    fn export_rows(&self, workspace: Option<&str>, include_deleted: bool)
        -> RepoResult<Vec<Capsule>>;

    /// Point lookup through a resolved address.
    fn get(&self, address: &Address, include_deleted: bool) -> RepoResult<Capsule> {
        let found = match address {
            Address::ById { id } => self.find_by_id(*id, include_deleted)?,
            Address::ByName {
                workspace_norm,
                name_norm,
            } => self.find_by_name(workspace_norm, name_norm, include_deleted)?,
        };
        found.ok_or_else(|| RepoError::NotFound(address.clone()))
    }
}

/// SQLite-backed capsule repository.
///
/// Accepts a plain connection or a transaction (through deref), so the same
/// statements run inside caller-owned transactions.
pub struct SqliteCapsuleRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteCapsuleRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl CapsuleRepository for SqliteCapsuleRepository<'_> {
    fn find_by_id(&self, id: CapsuleId, include_deleted: bool) -> RepoResult<Option<Capsule>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "{CAPSULE_SELECT_SQL}
             WHERE id = ?1
               AND (?2 = 1 OR deleted_at IS NULL);"
        ))?;
        let mut rows = stmt.query(params![id.to_string(), bool_to_int(include_deleted)])?;
        match rows.next()? {
            Some(row) => Ok(Some(parse_capsule_row(row)?)),
            None => Ok(None),
        }
    }

    fn find_by_name(
        &self,
        workspace_norm: &str,
        name_norm: &str,
        include_deleted: bool,
    ) -> RepoResult<Option<Capsule>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "{CAPSULE_SELECT_SQL}
             WHERE workspace_norm = ?1
               AND name_norm = ?2
               AND (?3 = 1 OR deleted_at IS NULL)
             ORDER BY (deleted_at IS NULL) DESC, deleted_at DESC, seq DESC
             LIMIT 1;"
        ))?;
        let mut rows = stmt.query(params![
            workspace_norm,
            name_norm,
            bool_to_int(include_deleted)
        ])?;
        match rows.next()? {
            Some(row) => Ok(Some(parse_capsule_row(row)?)),
            None => Ok(None),
        }
    }

    fn insert(&self, capsule: &Capsule) -> RepoResult<()> {
        let tags = encode_tags(&capsule.tags)?;
        self.conn
            .execute(
                "INSERT INTO capsules (
                    id,
                    workspace_raw,
                    workspace_norm,
                    name_raw,
                    name_norm,
                    title,
                    capsule_text,
                    capsule_chars,
                    tokens_estimate,
                    tags,
                    source,
                    run_id,
                    phase,
                    role,
                    created_at,
                    updated_at,
                    deleted_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17);",
                params![
                    capsule.id.to_string(),
                    capsule.workspace_raw,
                    capsule.workspace_norm,
                    capsule.name_raw,
                    capsule.name_norm,
                    capsule.title,
                    capsule.capsule_text,
                    capsule.capsule_chars,
                    capsule.tokens_estimate,
                    tags,
                    capsule.source,
                    capsule.run_id,
                    capsule.phase,
                    capsule.role,
                    capsule.created_at,
                    capsule.updated_at.max(capsule.created_at),
                    capsule.lifecycle.deleted_at(),
                ],
            )
            .map_err(|err| map_write_error(err, capsule))?;
        Ok(())
    }

    fn upsert(&self, capsule: &Capsule) -> RepoResult<UpsertOutcome> {
        if capsule.name_norm.is_none() {
            self.insert(capsule)?;
            return Ok(UpsertOutcome::Created { id: capsule.id });
        }

        let tags = encode_tags(&capsule.tags)?;
        let stored_id: String = self
            .conn
            .query_row(
                "INSERT INTO capsules (
                    id,
                    workspace_raw,
                    workspace_norm,
                    name_raw,
                    name_norm,
                    title,
                    capsule_text,
                    capsule_chars,
                    tokens_estimate,
                    tags,
                    source,
                    run_id,
                    phase,
                    role,
                    created_at,
                    updated_at,
                    deleted_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15, NULL)
                ON CONFLICT (workspace_norm, name_norm)
                    WHERE deleted_at IS NULL AND name_norm IS NOT NULL
                DO UPDATE SET
                    workspace_raw = excluded.workspace_raw,
                    name_raw = excluded.name_raw,
                    title = excluded.title,
                    capsule_text = excluded.capsule_text,
                    capsule_chars = excluded.capsule_chars,
                    tokens_estimate = excluded.tokens_estimate,
                    tags = excluded.tags,
                    source = excluded.source,
                    run_id = excluded.run_id,
                    phase = excluded.phase,
                    role = excluded.role,
                    updated_at = max(capsules.updated_at + 1, excluded.updated_at)
                RETURNING id;",
                params![
                    capsule.id.to_string(),
                    capsule.workspace_raw,
                    capsule.workspace_norm,
                    capsule.name_raw,
                    capsule.name_norm,
                    capsule.title,
                    capsule.capsule_text,
                    capsule.capsule_chars,
                    capsule.tokens_estimate,
                    tags,
                    capsule.source,
                    capsule.run_id,
                    capsule.phase,
                    capsule.role,
                    capsule.created_at,
                ],
                |row| row.get(0),
            )
            .map_err(|err| map_write_error(err, capsule))?;

        let id = parse_id(&stored_id)?;
        if id == capsule.id {
            Ok(UpsertOutcome::Created { id })
        } else {
            Ok(UpsertOutcome::Updated { id })
        }
    }

    fn update(&self, capsule: &Capsule) -> RepoResult<Capsule> {
        let tags = encode_tags(&capsule.tags)?;
        let updated_at: Option<i64> = self
            .conn
            .query_row(
                "UPDATE capsules
                 SET
                    workspace_raw = ?2,
                    workspace_norm = ?3,
                    name_raw = ?4,
                    name_norm = ?5,
                    title = ?6,
                    capsule_text = ?7,
                    capsule_chars = ?8,
                    tokens_estimate = ?9,
                    tags = ?10,
                    source = ?11,
                    run_id = ?12,
                    phase = ?13,
                    role = ?14,
                    deleted_at = ?15,
                    updated_at = max(updated_at + 1, ?16)
                 WHERE id = ?1
                 RETURNING updated_at;",
                params![
                    capsule.id.to_string(),
                    capsule.workspace_raw,
                    capsule.workspace_norm,
                    capsule.name_raw,
                    capsule.name_norm,
                    capsule.title,
                    capsule.capsule_text,
                    capsule.capsule_chars,
                    capsule.tokens_estimate,
                    tags,
                    capsule.source,
                    capsule.run_id,
                    capsule.phase,
                    capsule.role,
                    capsule.lifecycle.deleted_at(),
                    now_epoch_ms(),
                ],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| map_write_error(err, capsule))?;

        let Some(updated_at) = updated_at else {
            return Err(RepoError::NotFound(Address::ById { id: capsule.id }));
        };
        let mut stored = capsule.clone();
        stored.updated_at = updated_at;
        Ok(stored)
    }

    fn soft_delete(&self, id: CapsuleId) -> RepoResult<()> {
        let now = now_epoch_ms();
        let changed = self.conn.execute(
            "UPDATE capsules
             SET
                deleted_at = ?2,
                updated_at = max(updated_at + 1, ?2)
             WHERE id = ?1
               AND deleted_at IS NULL;",
            params![id.to_string(), now],
        )?;

        if changed == 0 {
            return Err(RepoError::NotFound(Address::ById { id }));
        }
        Ok(())
    }

    fn purge_deleted(
        &self,
        workspace: Option<&str>,
        older_than_days: Option<u32>,
    ) -> RepoResult<usize> {
        let workspace = non_blank(workspace.map(normalize));
        let cutoff = older_than_days
            .map(|days| now_epoch_ms().saturating_sub(i64::from(days) * MILLIS_PER_DAY));
        let removed = self.conn.execute(
            "DELETE FROM capsules
             WHERE deleted_at IS NOT NULL
               AND (?1 IS NULL OR workspace_norm = ?1)
               AND (?2 IS NULL OR deleted_at <= ?2);",
            params![workspace, cutoff],
        )?;
        Ok(removed)
    }

    fn bulk_soft_delete(&self, filter: &CapsuleFilter) -> RepoResult<usize> {
        let filter = require_filter(filter)?;
        let now = now_epoch_ms();
        let mut sql = String::from(
            "UPDATE capsules
             SET
                deleted_at = ?,
                updated_at = max(updated_at + 1, ?)
             WHERE deleted_at IS NULL",
        );
        let mut bind_values = vec![Value::Integer(now), Value::Integer(now)];
        filter.push_sql(&mut sql, &mut bind_values);
        let changed = self.conn.execute(&sql, params_from_iter(bind_values))?;
        Ok(changed)
    }

    fn bulk_update(&self, filter: &CapsuleFilter, fields: &BulkUpdateFields) -> RepoResult<usize> {
        let filter = require_filter(filter)?;
        if fields.is_empty() {
            return Err(RepoError::InvalidRequest(
                "bulk update requires at least one field".to_string(),
            ));
        }

        let mut assignments: Vec<&str> = Vec::new();
        let mut bind_values: Vec<Value> = Vec::new();
        if let Some(tags) = fields.tags.as_ref() {
            assignments.push("tags = ?");
            bind_values.push(Value::Text(encode_tags(&normalize_tags(tags))?));
        }
        for (assignment, value) in [
            ("source = ?", fields.source.as_deref()),
            ("run_id = ?", fields.run_id.as_deref()),
            ("phase = ?", fields.phase.as_deref()),
            ("role = ?", fields.role.as_deref()),
        ] {
            if let Some(value) = value {
                assignments.push(assignment);
                bind_values.push(match value.trim() {
                    "" => Value::Null,
                    trimmed => Value::Text(trimmed.to_string()),
                });
            }
        }
        assignments.push("updated_at = max(updated_at + 1, ?)");
        bind_values.push(Value::Integer(now_epoch_ms()));

        let mut sql = format!(
            "UPDATE capsules SET {} WHERE deleted_at IS NULL",
            assignments.join(", ")
        );
        filter.push_sql(&mut sql, &mut bind_values);
        let changed = self.conn.execute(&sql, params_from_iter(bind_values))?;
        Ok(changed)
    }

    fn list(&self, query: &CapsuleListQuery) -> RepoResult<CapsulePage> {
        let filter = query.filter.normalized();
        let mut where_sql = String::from(" WHERE 1 = 1");
        let mut bind_values: Vec<Value> = Vec::new();
        if !query.include_deleted {
            where_sql.push_str(" AND capsules.deleted_at IS NULL");
        }
        filter.push_sql(&mut where_sql, &mut bind_values);

        let total: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM capsules{where_sql}"),
            params_from_iter(bind_values.iter()),
            |row| row.get(0),
        )?;

        let mut sql = format!("{CAPSULE_SELECT_SQL}{where_sql} ORDER BY updated_at DESC, id DESC");
        match query.limit {
            Some(limit) => {
                sql.push_str(" LIMIT ? OFFSET ?");
                bind_values.push(Value::Integer(i64::from(limit)));
                bind_values.push(Value::Integer(i64::from(query.offset)));
            }
            None if query.offset > 0 => {
                sql.push_str(" LIMIT -1 OFFSET ?");
                bind_values.push(Value::Integer(i64::from(query.offset)));
            }
            None => {}
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(parse_capsule_row(row)?);
        }

        Ok(CapsulePage {
            items,
            total: u64::try_from(total).unwrap_or(0),
        })
    }

    fn active_names_with_base(
        &self,
        workspace_norm: &str,
        base: &str,
    ) -> RepoResult<HashSet<String>> {
        let prefix = format!("{base}-");
        let mut stmt = self.conn.prepare_cached(
            "SELECT name_norm
             FROM capsules
             WHERE workspace_norm = ?1
               AND deleted_at IS NULL
               AND (name_norm = ?2 OR substr(name_norm, 1, ?3) = ?4);",
        )?;
        let mut rows = stmt.query(params![
            workspace_norm,
            base,
            prefix.chars().count() as i64,
            prefix
        ])?;
        let mut names = HashSet::new();
        while let Some(row) = rows.next()? {
            names.insert(row.get::<_, String>(0)?);
        }
        Ok(names)
    }

    fn export_rows(
        &self,
        workspace: Option<&str>,
        include_deleted: bool,
    ) -> RepoResult<Vec<Capsule>> {
        let workspace = non_blank(workspace.map(normalize));
        let mut stmt = self.conn.prepare(&format!(
            "{CAPSULE_SELECT_SQL}
             WHERE (?1 IS NULL OR workspace_norm = ?1)
               AND (?2 = 1 OR deleted_at IS NULL)
             ORDER BY created_at ASC, id ASC;"
        ))?;
        let mut rows = stmt.query(params![workspace, bool_to_int(include_deleted)])?;
        let mut capsules = Vec::new();
        while let Some(row) = rows.next()? {
            capsules.push(parse_capsule_row(row)?);
        }
        Ok(capsules)
    }
}

/// Decodes one row selected with `CAPSULE_SELECT_SQL` columns.
pub(crate) fn parse_capsule_row(row: &Row<'_>) -> RepoResult<Capsule> {
    let id_text: String = row.get("id")?;
    let id = parse_id(&id_text)?;

    let tags_text: String = row.get("tags")?;
    let tags: Vec<String> = serde_json::from_str(&tags_text).map_err(|err| {
        RepoError::InvalidData(format!("invalid tags `{tags_text}` for capsule {id}: {err}"))
    })?;

    let name_raw: Option<String> = row.get("name_raw")?;
    let name_norm: Option<String> = row.get("name_norm")?;
    if name_raw.is_some() != name_norm.is_some() {
        return Err(RepoError::InvalidData(format!(
            "capsule {id} has inconsistent name columns"
        )));
    }

    Ok(Capsule {
        id,
        workspace_raw: row.get("workspace_raw")?,
        workspace_norm: row.get("workspace_norm")?,
        name_raw,
        name_norm,
        title: row.get("title")?,
        capsule_text: row.get("capsule_text")?,
        capsule_chars: row.get("capsule_chars")?,
        tokens_estimate: row.get("tokens_estimate")?,
        tags,
        source: row.get("source")?,
        run_id: row.get("run_id")?,
        phase: row.get("phase")?,
        role: row.get("role")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        lifecycle: Lifecycle::from_deleted_at(row.get("deleted_at")?),
    })
}

fn parse_id(value: &str) -> RepoResult<CapsuleId> {
    parse_capsule_id(value)
        .ok_or_else(|| RepoError::InvalidData(format!("invalid id value `{value}` in capsules.id")))
}

fn encode_tags(tags: &[String]) -> RepoResult<String> {
    serde_json::to_string(tags)
        .map_err(|err| RepoError::InvalidData(format!("cannot encode tags: {err}")))
}

fn require_filter(filter: &CapsuleFilter) -> RepoResult<CapsuleFilter> {
    let normalized = filter.normalized();
    if normalized.is_empty() {
        return Err(RepoError::InvalidRequest(
            "bulk operations require at least one non-empty filter".to_string(),
        ));
    }
    Ok(normalized)
}

fn map_write_error(err: rusqlite::Error, capsule: &Capsule) -> RepoError {
    if let rusqlite::Error::SqliteFailure(failure, Some(message)) = &err {
        if failure.code == rusqlite::ErrorCode::ConstraintViolation {
            if message.contains("capsules.id") {
                return RepoError::IdCollision(capsule.id);
            }
            if message.contains("capsules.workspace_norm") {
                return RepoError::NameAlreadyExists {
                    workspace: capsule.workspace_norm.clone(),
                    name: capsule.name_norm.clone().unwrap_or_default(),
                };
            }
        }
    }
    RepoError::from(err)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|inner| !inner.is_empty())
}

fn bool_to_int(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}
