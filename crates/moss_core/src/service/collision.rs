//! Collision-safe persistence for store and import.
//!
//! # Responsibility
//! - Validate capsule text before any write.
//! - Resolve name and ID collisions for single stores and batch imports.
//!
//! # Invariants
//! - Store-replace is one atomic upsert; the surviving row keeps its ID and
//!   `created_at`.
//! - Import never overwrites a row in `error` or `rename` mode.
//! - Each replace/rename import record runs in its own savepoint; a failing
//!   record leaves no partial row.
//! - Capsule metrics are recomputed from text; imported counts are ignored.

use crate::error::{CapsuleError, CapsuleResult};
use crate::lint::ContentValidator;
use crate::model::address::{normalize, DEFAULT_WORKSPACE};
use crate::model::capsule::{measure_text, normalize_tags, now_epoch_ms, Capsule, Lifecycle};
use crate::model::id::{parse_capsule_id, CapsuleId, IdGenerator};
use crate::repo::capsule_repo::{
    CapsuleRepository, RepoError, SqliteCapsuleRepository, UpsertOutcome,
};
use log::warn;
use rusqlite::{Connection, Transaction};
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;

/// Attempts at drawing an unused ID in rename mode.
const RENAME_ID_ATTEMPTS: usize = 8;

/// Behavior of `store` when the target name is already taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    /// Fail with `NAME_ALREADY_EXISTS`.
    #[default]
    Error,
    /// Overwrite the active capsule with that name, keeping its ID.
    Replace,
}

impl FromStr for StoreMode {
    type Err = CapsuleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "error" => Ok(Self::Error),
            "replace" => Ok(Self::Replace),
            other => Err(CapsuleError::InvalidRequest(format!(
                "unsupported store mode `{other}`; expected error|replace"
            ))),
        }
    }
}

/// Result of a successful store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreOutcome {
    pub capsule: Capsule,
    /// `false` when store-replace overwrote an existing capsule.
    pub created: bool,
}

/// Rejects text over `max_chars` or missing required sections.
pub(crate) fn check_content(
    validator: &dyn ContentValidator,
    text: &str,
    max_chars: i64,
    allow_thin: bool,
) -> CapsuleResult<()> {
    let report = validator.validate(text, max_chars, allow_thin);
    if report.too_large {
        return Err(CapsuleError::CapsuleTooLarge {
            chars: report.chars,
            max_chars: report.max_chars,
        });
    }
    if report.too_thin {
        return Err(CapsuleError::CapsuleTooThin {
            missing: report.thin_sections(),
        });
    }
    Ok(())
}

/// Persists a validated capsule according to `mode`.
///
/// Unnamed capsules always insert.
pub(crate) fn store_capsule(
    conn: &Connection,
    capsule: &Capsule,
    mode: StoreMode,
) -> CapsuleResult<StoreOutcome> {
    let repo = SqliteCapsuleRepository::new(conn);
    let outcome = match mode {
        StoreMode::Error => {
            repo.insert(capsule)?;
            UpsertOutcome::Created { id: capsule.id }
        }
        StoreMode::Replace => repo.upsert(capsule)?,
    };

    let stored = repo
        .find_by_id(outcome.id(), false)?
        .ok_or_else(|| CapsuleError::internal("stored capsule missing on read-back"))?;
    Ok(StoreOutcome {
        capsule: stored,
        created: matches!(outcome, UpsertOutcome::Created { .. }),
    })
}

/// Import collision policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportMode {
    /// First collision or parse failure aborts the whole batch.
    #[default]
    Error,
    /// Update colliding rows in place.
    Replace,
    /// Give colliding records a fresh ID or a suffixed name.
    Rename,
}

impl FromStr for ImportMode {
    type Err = CapsuleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "error" => Ok(Self::Error),
            "replace" => Ok(Self::Replace),
            "rename" => Ok(Self::Rename),
            other => Err(CapsuleError::InvalidRequest(format!(
                "unsupported import mode `{other}`; expected error|replace|rename"
            ))),
        }
    }
}

/// Per-record import failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportErrorCode {
    InvalidRequest,
    IdAlreadyExists,
    NameAlreadyExists,
    AmbiguousCollision,
    RenameFailed,
    InsertFailed,
}

/// One rejected import record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRecordError {
    /// 1-based line number in the input stream.
    pub line: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub code: ImportErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportResult {
    pub imported: usize,
    pub skipped: usize,
    pub errors: Vec<ImportRecordError>,
}

impl ImportResult {
    /// Whether an `error`-mode batch must be rolled back.
    pub fn aborted(&self, mode: ImportMode) -> bool {
        mode == ImportMode::Error && !self.errors.is_empty()
    }
}

/// Portable capsule record used by export and import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsuleSnapshot {
    pub id: String,
    #[serde(default)]
    pub workspace: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    pub capsule_text: String,
    /// Informational; recomputed on import.
    #[serde(default)]
    pub capsule_chars: Option<i64>,
    /// Informational; recomputed on import.
    #[serde(default)]
    pub tokens_estimate: Option<i64>,
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
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub updated_at: Option<i64>,
    #[serde(default)]
    pub deleted_at: Option<i64>,
}

impl From<&Capsule> for CapsuleSnapshot {
    fn from(capsule: &Capsule) -> Self {
        Self {
            id: capsule.id.to_string(),
            workspace: capsule.workspace_raw.clone(),
            name: capsule.name_raw.clone(),
            title: capsule.title.clone(),
            capsule_text: capsule.capsule_text.clone(),
            capsule_chars: Some(capsule.capsule_chars),
            tokens_estimate: Some(capsule.tokens_estimate),
            tags: capsule.tags.clone(),
            source: capsule.source.clone(),
            run_id: capsule.run_id.clone(),
            phase: capsule.phase.clone(),
            role: capsule.role.clone(),
            created_at: Some(capsule.created_at),
            updated_at: Some(capsule.updated_at),
            deleted_at: capsule.lifecycle.deleted_at(),
        }
    }
}

impl CapsuleSnapshot {
    /// Rebuilds a capsule, normalizing keys and recomputing metrics.
    pub fn into_capsule(self, now_ms: i64) -> Result<Capsule, String> {
        let id = parse_capsule_id(&self.id)
            .ok_or_else(|| format!("malformed capsule id `{}`", self.id))?;

        let workspace_raw = match self.workspace.trim() {
            "" => DEFAULT_WORKSPACE.to_string(),
            trimmed => trimmed.to_string(),
        };
        let workspace_norm = normalize(&workspace_raw);
        let name_raw = trimmed_non_blank(self.name);
        let name_norm = name_raw.as_deref().map(normalize);
        let metrics = measure_text(&self.capsule_text);
        let created_at = self.created_at.unwrap_or(now_ms);
        let updated_at = self.updated_at.unwrap_or(created_at).max(created_at);

        Ok(Capsule {
            id,
            workspace_raw,
            workspace_norm,
            title: trimmed_non_blank(self.title).or_else(|| name_raw.clone()),
            name_raw,
            name_norm,
            capsule_text: self.capsule_text,
            capsule_chars: metrics.chars,
            tokens_estimate: metrics.tokens_estimate,
            tags: normalize_tags(&self.tags),
            source: trimmed_non_blank(self.source),
            run_id: trimmed_non_blank(self.run_id),
            phase: trimmed_non_blank(self.phase),
            role: trimmed_non_blank(self.role),
            created_at,
            updated_at,
            lifecycle: Lifecycle::from_deleted_at(self.deleted_at),
        })
    }
}

/// How an import record overlaps existing rows.
#[derive(Debug)]
enum Collision {
    None,
    /// A row (active or tombstoned) already has the record's ID.
    IdOnly(Capsule),
    /// A different active row owns the record's name.
    NameOnly(Capsule),
    /// The row with the record's ID also owns its name.
    SameRow(Capsule),
    /// ID and name belong to two different rows.
    DifferentRows,
}

fn classify(repo: &dyn CapsuleRepository, capsule: &Capsule) -> Result<Collision, RepoError> {
    let by_id = repo.find_by_id(capsule.id, true)?;
    let by_name = match (capsule.is_active(), capsule.name_norm.as_deref()) {
        (true, Some(name)) => repo.find_by_name(&capsule.workspace_norm, name, false)?,
        _ => None,
    };

    Ok(match (by_id, by_name) {
        (None, None) => Collision::None,
        (Some(row), None) => Collision::IdOnly(row),
        (None, Some(row)) => Collision::NameOnly(row),
        (Some(id_row), Some(name_row)) if id_row.id == name_row.id => Collision::SameRow(id_row),
        (Some(_), Some(_)) => Collision::DifferentRows,
    })
}

/// Streams JSONL snapshots from `reader` into `tx`.
///
/// The caller commits unless [`ImportResult::aborted`] holds. Cancellation
/// returns `Cancelled`; dropping `tx` then discards every applied record.
pub(crate) fn import_records<R: BufRead>(
    tx: &mut Transaction<'_>,
    mut reader: R,
    mode: ImportMode,
    ids: &dyn IdGenerator,
    cancel: &CancellationToken,
) -> CapsuleResult<ImportResult> {
    let mut result = ImportResult::default();
    let mut buf = Vec::new();
    let mut line_no = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(CapsuleError::Cancelled);
        }
        buf.clear();
        let read = reader.read_until(b'\n', &mut buf).map_err(|err| {
            CapsuleError::InvalidRequest(format!(
                "failed to read import line {}: {err}",
                line_no + 1
            ))
        })?;
        if read == 0 {
            break;
        }
        line_no += 1;

        let outcome = match std::str::from_utf8(&buf) {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => match parse_record(line.trim(), line_no) {
                Ok(None) => continue,
                Ok(Some(capsule)) => apply_record(tx, capsule, mode, ids, line_no)?,
                Err(err) => Err(err),
            },
            Err(err) => Err(record_error(
                line_no,
                None,
                ImportErrorCode::InvalidRequest,
                format!("line is not valid UTF-8: {err}"),
            )),
        };

        match outcome {
            Ok(()) => result.imported += 1,
            Err(err) => {
                warn!(
                    "event=import_record module=import status=error line={} code={:?}",
                    err.line, err.code
                );
                result.errors.push(err);
                if mode == ImportMode::Error {
                    result.imported = 0;
                    result.skipped = 0;
                    return Ok(result);
                }
                result.skipped += 1;
            }
        }
    }

    Ok(result)
}

/// `Ok(None)` for the export header line.
fn parse_record(line: &str, line_no: usize) -> Result<Option<Capsule>, ImportRecordError> {
    let value: serde_json::Value = serde_json::from_str(line).map_err(|err| {
        record_error(line_no, None, ImportErrorCode::InvalidRequest, format!("invalid JSON: {err}"))
    })?;
    if value.get("moss_export").is_some() {
        return Ok(None);
    }

    let snapshot: CapsuleSnapshot = serde_json::from_value(value).map_err(|err| {
        record_error(
            line_no,
            None,
            ImportErrorCode::InvalidRequest,
            format!("invalid capsule record: {err}"),
        )
    })?;
    let id = snapshot.id.clone();
    let name = snapshot.name.clone();
    snapshot
        .into_capsule(now_epoch_ms())
        .map(Some)
        .map_err(|message| ImportRecordError {
            line: line_no,
            id: Some(id),
            name,
            code: ImportErrorCode::InvalidRequest,
            message,
        })
}

/// Outer `Err` is fatal for the whole import; inner `Err` rejects one record.
fn apply_record(
    tx: &mut Transaction<'_>,
    capsule: Capsule,
    mode: ImportMode,
    ids: &dyn IdGenerator,
    line_no: usize,
) -> CapsuleResult<Result<(), ImportRecordError>> {
    if mode == ImportMode::Error {
        let repo = SqliteCapsuleRepository::new(tx);
        return Ok(insert_strict(&repo, &capsule, line_no));
    }

    let savepoint = tx.savepoint()?;
    let applied = {
        let repo = SqliteCapsuleRepository::new(&savepoint);
        match mode {
            ImportMode::Replace => replace_record(&repo, capsule, line_no),
            _ => rename_record(&repo, capsule, ids, line_no),
        }
    };
    if applied.is_ok() {
        savepoint.commit()?;
    }
    Ok(applied)
}

fn insert_strict(
    repo: &dyn CapsuleRepository,
    capsule: &Capsule,
    line_no: usize,
) -> Result<(), ImportRecordError> {
    match classify(repo, capsule).map_err(|err| insert_failed(capsule, line_no, err))? {
        Collision::None => repo
            .insert(capsule)
            .map_err(|err| insert_failed(capsule, line_no, err)),
        Collision::IdOnly(_) | Collision::SameRow(_) | Collision::DifferentRows => {
            Err(record_error(
                line_no,
                Some(capsule),
                ImportErrorCode::IdAlreadyExists,
                format!("capsule id {} already exists", capsule.id),
            ))
        }
        Collision::NameOnly(existing) => Err(name_taken(capsule, &existing, line_no)),
    }
}

fn replace_record(
    repo: &dyn CapsuleRepository,
    capsule: Capsule,
    line_no: usize,
) -> Result<(), ImportRecordError> {
    match classify(repo, &capsule).map_err(|err| insert_failed(&capsule, line_no, err))? {
        Collision::None => repo
            .insert(&capsule)
            .map_err(|err| insert_failed(&capsule, line_no, err)),
        Collision::IdOnly(existing) | Collision::SameRow(existing) => {
            let merged = Capsule {
                created_at: existing.created_at,
                ..capsule
            };
            repo.update(&merged)
                .map(|_| ())
                .map_err(|err| insert_failed(&merged, line_no, err))
        }
        Collision::NameOnly(existing) => {
            let merged = Capsule {
                id: existing.id,
                created_at: existing.created_at,
                lifecycle: Lifecycle::Active,
                ..capsule
            };
            repo.update(&merged)
                .map(|_| ())
                .map_err(|err| insert_failed(&merged, line_no, err))
        }
        Collision::DifferentRows => Err(record_error(
            line_no,
            Some(&capsule),
            ImportErrorCode::AmbiguousCollision,
            "id and name match two different capsules".to_string(),
        )),
    }
}

fn rename_record(
    repo: &dyn CapsuleRepository,
    mut capsule: Capsule,
    ids: &dyn IdGenerator,
    line_no: usize,
) -> Result<(), ImportRecordError> {
    if repo
        .find_by_id(capsule.id, true)
        .map_err(|err| insert_failed(&capsule, line_no, err))?
        .is_some()
    {
        capsule.id = fresh_id(repo, ids).ok_or_else(|| {
            record_error(
                line_no,
                Some(&capsule),
                ImportErrorCode::RenameFailed,
                "could not allocate an unused capsule id".to_string(),
            )
        })?;
    }

    if capsule.is_active() {
        if let (Some(name_raw), Some(name_norm)) =
            (capsule.name_raw.clone(), capsule.name_norm.clone())
        {
            let taken = repo
                .active_names_with_base(&capsule.workspace_norm, &name_norm)
                .map_err(|err| insert_failed(&capsule, line_no, err))?;
            if taken.contains(&name_norm) {
                let suffix = lowest_free_suffix(&name_norm, |candidate| taken.contains(candidate));
                capsule.name_raw = Some(format!("{name_raw}-{suffix}"));
                capsule.name_norm = Some(format!("{name_norm}-{suffix}"));
            }
        }
    }

    repo.insert(&capsule).map_err(|err| match err {
        RepoError::NameAlreadyExists { .. } => record_error(
            line_no,
            Some(&capsule),
            ImportErrorCode::RenameFailed,
            format!("renamed capsule still collides: {err}"),
        ),
        other => insert_failed(&capsule, line_no, other),
    })
}

fn fresh_id(repo: &dyn CapsuleRepository, ids: &dyn IdGenerator) -> Option<CapsuleId> {
    (0..RENAME_ID_ATTEMPTS)
        .map(|_| ids.next_id())
        .find(|candidate| matches!(repo.find_by_id(*candidate, true), Ok(None)))
}

/// Lowest `n >= 1` such that `base-n` is not taken.
pub(crate) fn lowest_free_suffix(base: &str, is_taken: impl Fn(&str) -> bool) -> usize {
    let mut suffix = 1;
    while is_taken(&format!("{base}-{suffix}")) {
        suffix += 1;
    }
    suffix
}

fn name_taken(capsule: &Capsule, existing: &Capsule, line_no: usize) -> ImportRecordError {
    record_error(
        line_no,
        Some(capsule),
        ImportErrorCode::NameAlreadyExists,
        format!(
            "name is owned by active capsule {} in workspace `{}`",
            existing.id, existing.workspace_norm
        ),
    )
}

fn insert_failed(capsule: &Capsule, line_no: usize, err: RepoError) -> ImportRecordError {
    let code = match err {
        RepoError::NameAlreadyExists { .. } => ImportErrorCode::NameAlreadyExists,
        RepoError::IdCollision(_) => ImportErrorCode::IdAlreadyExists,
        _ => ImportErrorCode::InsertFailed,
    };
    record_error(line_no, Some(capsule), code, err.to_string())
}

fn record_error(
    line: usize,
    capsule: Option<&Capsule>,
    code: ImportErrorCode,
    message: String,
) -> ImportRecordError {
    ImportRecordError {
        line,
        id: capsule.map(|capsule| capsule.id.to_string()),
        name: capsule.and_then(|capsule| capsule.name_raw.clone()),
        code,
        message,
    }
}

fn trimmed_non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|inner| inner.trim().to_string())
        .filter(|inner| !inner.is_empty())
}

#[cfg(test)]
mod tests {
    use super::{lowest_free_suffix, CapsuleSnapshot, ImportMode, StoreMode};
    use crate::model::capsule::Lifecycle;
    use std::collections::HashSet;

    fn snapshot(id: &str) -> CapsuleSnapshot {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "workspace": "  Team  A ",
            "name": " Plan ",
            "capsule_text": "héllo",
            "capsule_chars": 999,
            "tags": ["X", "x", " y "],
            "created_at": 10,
            "updated_at": 5,
        }))
        .unwrap()
    }

    #[test]
    fn snapshot_recomputes_metrics_and_normalizes_keys() {
        let id = uuid::Uuid::now_v7().to_string();
        let capsule = snapshot(&id).into_capsule(1).unwrap();
        assert_eq!(capsule.capsule_chars, 5);
        assert_eq!(capsule.tokens_estimate, 2);
        assert_eq!(capsule.workspace_norm, "team a");
        assert_eq!(capsule.name_norm.as_deref(), Some("plan"));
        assert_eq!(capsule.title.as_deref(), Some("Plan"));
        assert_eq!(capsule.tags, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(capsule.updated_at, 10);
        assert_eq!(capsule.lifecycle, Lifecycle::Active);
    }

    #[test]
    fn snapshot_rejects_malformed_id() {
        assert!(snapshot("not-a-uuid").into_capsule(1).is_err());
    }

    #[test]
    fn suffix_picks_lowest_gap() {
        let taken: HashSet<String> = ["plan", "plan-1", "plan-3"]
            .into_iter()
            .map(str::to_string)
            .collect();
        assert_eq!(lowest_free_suffix("plan", |name| taken.contains(name)), 2);
        assert_eq!(lowest_free_suffix("other", |name| taken.contains(name)), 1);
    }

    #[test]
    fn modes_parse_case_insensitively() {
        assert_eq!("REPLACE".parse::<StoreMode>().unwrap(), StoreMode::Replace);
        assert_eq!("rename".parse::<ImportMode>().unwrap(), ImportMode::Rename);
        assert!("merge".parse::<ImportMode>().is_err());
    }
}
