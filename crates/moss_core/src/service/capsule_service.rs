//! Capsule use-case facade.
//!
//! # Responsibility
//! - Own one connection plus config, validator, ID generator and path guard.
//! - Open transactions around multi-step use cases and log their outcome.
//!
//! # Invariants
//! - Every mutation runs in an `IMMEDIATE` transaction or one atomic
//!   statement.
//! - Compose, fetch-many and export read from one snapshot.
//! - Update and append only touch active capsules.

use crate::config::StoreConfig;
use crate::db::{open_db, open_db_in_memory};
use crate::error::{CapsuleError, CapsuleResult, ErrorCode};
use crate::lint::{ContentValidator, SectionValidator};
use crate::model::address::{normalize, CapsuleRef};
use crate::model::capsule::{
    measure_text, normalize_tags, now_epoch_ms, Capsule, CapsuleDraft, CapsuleSummary, Pagination,
};
use crate::model::id::{IdGenerator, UuidV7Generator};
use crate::repo::capsule_repo::{
    BulkUpdateFields, CapsuleFilter, CapsuleListQuery, CapsuleRepository, SqliteCapsuleRepository,
};
use crate::search::fts::{normalize_search_limit, search_capsules, SearchPage, SearchQuery};
use crate::service::collision::{
    check_content, import_records, store_capsule, ImportMode, ImportResult, StoreMode,
    StoreOutcome,
};
use crate::service::compose::{assemble, collect_parts, ComposeRequest, ComposeResult};
use crate::service::transfer::{write_export, ExportSummary, PathGuard, StrictPathGuard};
use log::{error, info, warn};
use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

pub const FETCH_MANY_MAX_REFS: usize = 50;

/// Source recorded on capsules persisted by compose.
const COMPOSE_SOURCE: &str = "compose";

/// Input of [`CapsuleService::store`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreRequest {
    #[serde(flatten)]
    pub draft: CapsuleDraft,
    #[serde(default)]
    pub mode: StoreMode,
    #[serde(default)]
    pub allow_thin: bool,
}

/// Partial update; `None` leaves a field untouched, an empty string clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsulePatch {
    #[serde(default)]
    pub title: Option<String>,
    /// Replaces the whole text and re-runs validation.
    #[serde(default)]
    pub text: Option<String>,
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
    #[serde(default)]
    pub allow_thin: bool,
}

impl CapsulePatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.text.is_none()
            && self.tags.is_none()
            && self.source.is_none()
            && self.run_id.is_none()
            && self.phase.is_none()
            && self.role.is_none()
    }

    fn apply(&self, capsule: &mut Capsule) {
        if let Some(title) = self.title.as_deref() {
            capsule.title = cleared_or_set(title);
        }
        if let Some(text) = self.text.as_ref() {
            capsule.set_text(text.clone());
        }
        if let Some(tags) = self.tags.as_ref() {
            capsule.tags = normalize_tags(tags);
        }
        for (slot, value) in [
            (&mut capsule.source, self.source.as_deref()),
            (&mut capsule.run_id, self.run_id.as_deref()),
            (&mut capsule.phase, self.phase.as_deref()),
            (&mut capsule.role, self.role.as_deref()),
        ] {
            if let Some(value) = value {
                *slot = cleared_or_set(value);
            }
        }
    }
}

/// Code and message of one failed batch item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&CapsuleError> for ItemError {
    fn from(err: &CapsuleError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// One entry of a fetch-many response, in request order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchManyItem {
    pub index: usize,
    pub capsule: Option<Capsule>,
    pub error: Option<ItemError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkOutcome {
    pub affected: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListPage {
    pub items: Vec<CapsuleSummary>,
    pub pagination: Pagination,
}

/// Capsule store facade.
pub struct CapsuleService {
    conn: Connection,
    config: StoreConfig,
    validator: Box<dyn ContentValidator>,
    ids: Box<dyn IdGenerator>,
    path_guard: Box<dyn PathGuard>,
}

impl CapsuleService {
    /// Wraps an already-migrated connection with default collaborators.
    pub fn new(conn: Connection, config: StoreConfig) -> Self {
        Self {
            conn,
            config,
            validator: Box::new(SectionValidator::default()),
            ids: Box::new(UuidV7Generator),
            path_guard: Box::new(StrictPathGuard),
        }
    }

    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> CapsuleResult<Self> {
        Ok(Self::new(open_db(path)?, config))
    }

    pub fn open_in_memory(config: StoreConfig) -> CapsuleResult<Self> {
        Ok(Self::new(open_db_in_memory()?, config))
    }

    pub fn with_validator(mut self, validator: impl ContentValidator + 'static) -> Self {
        self.validator = Box::new(validator);
        self
    }

    pub fn with_id_generator(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Box::new(ids);
        self
    }

    pub fn with_path_guard(mut self, guard: impl PathGuard + 'static) -> Self {
        self.path_guard = Box::new(guard);
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Validates and persists one capsule.
    pub fn store(&mut self, request: StoreRequest) -> CapsuleResult<StoreOutcome> {
        let started_at = Instant::now();
        let result = self.store_inner(request);
        if let Ok(outcome) = result.as_ref() {
            info!(
                "event=capsule_store module=service status=ok id={} created={} chars={} duration_ms={}",
                outcome.capsule.id,
                outcome.created,
                outcome.capsule.capsule_chars,
                started_at.elapsed().as_millis()
            );
        }
        log_failure("capsule_store", started_at, result)
    }

    fn store_inner(&mut self, request: StoreRequest) -> CapsuleResult<StoreOutcome> {
        check_content(
            self.validator.as_ref(),
            &request.draft.text,
            self.config.capsule_max_chars,
            request.allow_thin,
        )?;
        let capsule = request
            .draft
            .into_capsule(self.ids.next_id(), now_epoch_ms())?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let outcome = store_capsule(&tx, &capsule, request.mode)?;
        tx.commit()?;
        Ok(outcome)
    }

    /// Loads one capsule; tombstones only with `include_deleted`.
    pub fn fetch(&self, capsule_ref: &CapsuleRef, include_deleted: bool) -> CapsuleResult<Capsule> {
        let address = capsule_ref.resolve()?;
        let capsule = SqliteCapsuleRepository::new(&self.conn).get(&address, include_deleted)?;
        Ok(capsule)
    }

    /// Loads several capsules from one snapshot, reporting failures per item.
    pub fn fetch_many(
        &mut self,
        refs: &[CapsuleRef],
        include_deleted: bool,
    ) -> CapsuleResult<Vec<FetchManyItem>> {
        let started_at = Instant::now();
        if refs.is_empty() || refs.len() > FETCH_MANY_MAX_REFS {
            return Err(CapsuleError::InvalidRequest(format!(
                "fetch_many takes 1 to {FETCH_MANY_MAX_REFS} refs, got {}",
                refs.len()
            )));
        }

        let tx = self.conn.transaction()?;
        let items = {
            let repo = SqliteCapsuleRepository::new(&tx);
            let mut items = Vec::with_capacity(refs.len());
            for (index, capsule_ref) in refs.iter().enumerate() {
                let fetched = capsule_ref
                    .resolve()
                    .map_err(CapsuleError::from)
                    .and_then(|address| {
                        repo.get(&address, include_deleted)
                            .map_err(CapsuleError::from)
                    });
                items.push(match fetched {
                    Ok(capsule) => FetchManyItem {
                        index,
                        capsule: Some(capsule),
                        error: None,
                    },
                    Err(err) if err.code() == ErrorCode::Internal => return Err(err),
                    Err(err) => FetchManyItem {
                        index,
                        capsule: None,
                        error: Some(ItemError::from(&err)),
                    },
                });
            }
            items
        };
        tx.commit()?;

        info!(
            "event=capsule_fetch_many module=service status=ok requested={} found={} duration_ms={}",
            refs.len(),
            items.iter().filter(|item| item.capsule.is_some()).count(),
            started_at.elapsed().as_millis()
        );
        Ok(items)
    }

    /// Applies a partial update to an active capsule.
    pub fn update(
        &mut self,
        capsule_ref: &CapsuleRef,
        patch: &CapsulePatch,
    ) -> CapsuleResult<Capsule> {
        let started_at = Instant::now();
        let result = self.update_inner(capsule_ref, patch);
        log_result("capsule_update", started_at, result)
    }

    fn update_inner(
        &mut self,
        capsule_ref: &CapsuleRef,
        patch: &CapsulePatch,
    ) -> CapsuleResult<Capsule> {
        if patch.is_empty() {
            return Err(CapsuleError::InvalidRequest(
                "update requires at least one field".to_string(),
            ));
        }
        let address = capsule_ref.resolve()?;
        if let Some(text) = patch.text.as_deref() {
            check_content(
                self.validator.as_ref(),
                text,
                self.config.capsule_max_chars,
                patch.allow_thin,
            )?;
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let updated = {
            let repo = SqliteCapsuleRepository::new(&tx);
            let mut capsule = repo.get(&address, false)?;
            patch.apply(&mut capsule);
            repo.update(&capsule)?
        };
        tx.commit()?;
        Ok(updated)
    }

    /// Appends `addition` after the existing text, separated by a blank line.
    pub fn append(&mut self, capsule_ref: &CapsuleRef, addition: &str) -> CapsuleResult<Capsule> {
        let started_at = Instant::now();
        let result = self.append_inner(capsule_ref, addition);
        log_result("capsule_append", started_at, result)
    }

    fn append_inner(&mut self, capsule_ref: &CapsuleRef, addition: &str) -> CapsuleResult<Capsule> {
        if addition.trim().is_empty() {
            return Err(CapsuleError::InvalidRequest(
                "append text must not be blank".to_string(),
            ));
        }
        let address = capsule_ref.resolve()?;
        let max_chars = self.config.capsule_max_chars;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let updated = {
            let repo = SqliteCapsuleRepository::new(&tx);
            let mut capsule = repo.get(&address, false)?;
            let joined = join_appended(&capsule.capsule_text, addition);
            let chars = measure_text(&joined).chars;
            if chars > max_chars {
                return Err(CapsuleError::CapsuleTooLarge { chars, max_chars });
            }
            capsule.set_text(joined);
            repo.update(&capsule)?
        };
        tx.commit()?;
        Ok(updated)
    }

    /// Tombstones one active capsule and returns its final summary.
    pub fn delete(&mut self, capsule_ref: &CapsuleRef) -> CapsuleResult<CapsuleSummary> {
        let started_at = Instant::now();
        let result = self.delete_inner(capsule_ref);
        log_result("capsule_delete", started_at, result)
    }

    fn delete_inner(&mut self, capsule_ref: &CapsuleRef) -> CapsuleResult<CapsuleSummary> {
        let address = capsule_ref.resolve()?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let summary = {
            let repo = SqliteCapsuleRepository::new(&tx);
            let capsule = repo.get(&address, false)?;
            repo.soft_delete(capsule.id)?;
            repo.find_by_id(capsule.id, true)?
                .ok_or_else(|| CapsuleError::internal("deleted capsule missing on read-back"))?
                .summary()
        };
        tx.commit()?;
        Ok(summary)
    }

    /// Tombstones every active capsule matching `filter`.
    pub fn bulk_delete(&mut self, filter: &CapsuleFilter) -> CapsuleResult<BulkOutcome> {
        let started_at = Instant::now();
        let result = SqliteCapsuleRepository::new(&self.conn)
            .bulk_soft_delete(filter)
            .map(|affected| BulkOutcome { affected })
            .map_err(CapsuleError::from);
        log_result("capsule_bulk_delete", started_at, result)
    }

    /// Sets metadata on every active capsule matching `filter`.
    pub fn bulk_update(
        &mut self,
        filter: &CapsuleFilter,
        fields: &BulkUpdateFields,
    ) -> CapsuleResult<BulkOutcome> {
        let started_at = Instant::now();
        let result = SqliteCapsuleRepository::new(&self.conn)
            .bulk_update(filter, fields)
            .map(|affected| BulkOutcome { affected })
            .map_err(CapsuleError::from);
        log_result("capsule_bulk_update", started_at, result)
    }

    /// Hard-deletes tombstones, optionally scoped by workspace and age.
    pub fn purge(
        &mut self,
        workspace: Option<&str>,
        older_than_days: Option<u32>,
    ) -> CapsuleResult<BulkOutcome> {
        let started_at = Instant::now();
        let result = SqliteCapsuleRepository::new(&self.conn)
            .purge_deleted(workspace, older_than_days)
            .map(|affected| BulkOutcome { affected })
            .map_err(CapsuleError::from);
        log_result("capsule_purge", started_at, result)
    }

    /// Lists summaries, newest first. Limit defaults to 20 and caps at 100.
    pub fn list(&self, query: &CapsuleListQuery) -> CapsuleResult<ListPage> {
        let limit = normalize_search_limit(query.limit);
        let page = SqliteCapsuleRepository::new(&self.conn).list(&CapsuleListQuery {
            limit: Some(limit),
            ..query.clone()
        })?;
        Ok(ListPage {
            pagination: Pagination::new(limit, query.offset, page.items.len(), page.total),
            items: page.items.iter().map(Capsule::summary).collect(),
        })
    }

    /// Most recently updated capsule, optionally within one workspace.
    pub fn latest(&self, workspace: Option<&str>, include_deleted: bool) -> CapsuleResult<Capsule> {
        let query = CapsuleListQuery {
            filter: CapsuleFilter {
                workspace: workspace.map(str::to_string),
                ..CapsuleFilter::default()
            },
            include_deleted,
            limit: Some(1),
            offset: 0,
        };
        let page = SqliteCapsuleRepository::new(&self.conn).list(&query)?;
        page.items.into_iter().next().ok_or_else(|| {
            CapsuleError::NotFound(match workspace.map(normalize) {
                Some(workspace) if !workspace.is_empty() => {
                    format!("no capsules in workspace `{workspace}`")
                }
                _ => "no capsules".to_string(),
            })
        })
    }

    pub fn search(&self, query: &SearchQuery) -> CapsuleResult<SearchPage> {
        let started_at = Instant::now();
        let result = search_capsules(&self.conn, query).map_err(CapsuleError::from);
        if let Ok(page) = result.as_ref() {
            info!(
                "event=capsule_search module=search status=ok hits={} total={} duration_ms={}",
                page.hits.len(),
                page.pagination.total,
                started_at.elapsed().as_millis()
            );
        }
        log_failure("capsule_search", started_at, result)
    }

    /// Bundles capsules; optionally persists the markdown bundle.
    pub fn compose(
        &mut self,
        request: &ComposeRequest,
        cancel: &CancellationToken,
    ) -> CapsuleResult<ComposeResult> {
        let started_at = Instant::now();
        let result = self.compose_inner(request, cancel);
        if let Ok(composed) = result.as_ref() {
            info!(
                "event=capsule_compose module=compose status=ok parts={} chars={} stored={} duration_ms={}",
                composed.parts.len(),
                composed.chars,
                composed.stored.is_some(),
                started_at.elapsed().as_millis()
            );
        }
        log_failure("capsule_compose", started_at, result)
    }

    fn compose_inner(
        &mut self,
        request: &ComposeRequest,
        cancel: &CancellationToken,
    ) -> CapsuleResult<ComposeResult> {
        request.validate()?;
        let max_chars = self.config.compose_max_chars;

        let tx = self.conn.transaction()?;
        let parts = collect_parts(&tx, request, max_chars, cancel)?;
        tx.commit()?;

        let bundle = assemble(&parts, request.format, max_chars)?;
        let metrics = measure_text(&bundle);

        let stored = match request.store.as_ref() {
            Some(target) => {
                let outcome = self.store_inner(StoreRequest {
                    draft: CapsuleDraft {
                        workspace: target.workspace.clone(),
                        name: Some(target.name.clone()),
                        title: target.title.clone(),
                        text: bundle.clone(),
                        tags: target.tags.clone(),
                        source: Some(COMPOSE_SOURCE.to_string()),
                        ..CapsuleDraft::default()
                    },
                    mode: target.mode,
                    allow_thin: target.allow_thin,
                })?;
                Some(outcome.capsule.fetch_key())
            }
            None => None,
        };

        Ok(ComposeResult {
            format: request.format,
            bundle,
            parts,
            chars: metrics.chars,
            tokens_estimate: metrics.tokens_estimate,
            stored,
        })
    }

    /// Imports JSONL snapshots in one transaction.
    ///
    /// In `error` mode a rejected record rolls back the whole batch and the
    /// result reports zero imports.
    pub fn import_jsonl<R: BufRead>(
        &mut self,
        reader: R,
        mode: ImportMode,
        cancel: &CancellationToken,
    ) -> CapsuleResult<ImportResult> {
        let started_at = Instant::now();
        info!(
            "event=capsule_import module=import status=start mode={:?}",
            mode
        );

        let result = self.import_inner(reader, mode, cancel);

        if let Ok(imported) = result.as_ref() {
            info!(
                "event=capsule_import module=import status=ok mode={:?} imported={} skipped={} errors={} duration_ms={}",
                mode,
                imported.imported,
                imported.skipped,
                imported.errors.len(),
                started_at.elapsed().as_millis()
            );
        }
        log_failure("capsule_import", started_at, result)
    }

    /// Writes a JSONL export of one snapshot of the store.
    pub fn export_jsonl<W: Write>(
        &mut self,
        writer: W,
        workspace: Option<&str>,
        include_deleted: bool,
    ) -> CapsuleResult<ExportSummary> {
        let started_at = Instant::now();
        let result = self.export_inner(writer, workspace, include_deleted);
        if let Ok(summary) = result.as_ref() {
            info!(
                "event=capsule_export module=import status=ok exported={} duration_ms={}",
                summary.exported,
                started_at.elapsed().as_millis()
            );
        }
        log_failure("capsule_export", started_at, result)
    }

    fn import_inner<R: BufRead>(
        &mut self,
        reader: R,
        mode: ImportMode,
        cancel: &CancellationToken,
    ) -> CapsuleResult<ImportResult> {
        let mut tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = import_records(&mut tx, reader, mode, self.ids.as_ref(), cancel)?;
        if !result.aborted(mode) {
            tx.commit()?;
        }
        Ok(result)
    }

    fn export_inner<W: Write>(
        &mut self,
        writer: W,
        workspace: Option<&str>,
        include_deleted: bool,
    ) -> CapsuleResult<ExportSummary> {
        let tx = self.conn.transaction()?;
        let summary = write_export(&tx, writer, workspace, include_deleted)?;
        tx.commit()?;
        Ok(summary)
    }

    pub fn import_file(
        &mut self,
        path: &Path,
        mode: ImportMode,
        cancel: &CancellationToken,
    ) -> CapsuleResult<ImportResult> {
        self.path_guard.check_read(path)?;
        let file = File::open(path).map_err(|err| {
            CapsuleError::InvalidRequest(format!("cannot open `{}`: {err}", path.display()))
        })?;
        self.import_jsonl(BufReader::new(file), mode, cancel)
    }

    pub fn export_file(
        &mut self,
        path: &Path,
        workspace: Option<&str>,
        include_deleted: bool,
    ) -> CapsuleResult<ExportSummary> {
        self.path_guard.check_write(path)?;
        let file = File::create(path).map_err(|err| {
            CapsuleError::InvalidRequest(format!("cannot create `{}`: {err}", path.display()))
        })?;
        self.export_jsonl(BufWriter::new(file), workspace, include_deleted)
    }
}

fn join_appended(existing: &str, addition: &str) -> String {
    let existing = existing.trim_end();
    if existing.is_empty() {
        addition.to_string()
    } else {
        format!("{existing}\n\n{addition}")
    }
}

fn cleared_or_set(value: &str) -> Option<String> {
    match value.trim() {
        "" => None,
        trimmed => Some(trimmed.to_string()),
    }
}

fn log_result<T>(
    event: &'static str,
    started_at: Instant,
    result: CapsuleResult<T>,
) -> CapsuleResult<T> {
    if result.is_ok() {
        info!(
            "event={event} module=service status=ok duration_ms={}",
            started_at.elapsed().as_millis()
        );
    }
    log_failure(event, started_at, result)
}

fn log_failure<T>(
    event: &'static str,
    started_at: Instant,
    result: CapsuleResult<T>,
) -> CapsuleResult<T> {
    if let Err(err) = result.as_ref() {
        let code = err.code();
        if code == ErrorCode::Internal {
            error!(
                "event={event} module=service status=error error_code={code} duration_ms={}",
                started_at.elapsed().as_millis()
            );
        } else {
            warn!(
                "event={event} module=service status=error error_code={code} duration_ms={}",
                started_at.elapsed().as_millis()
            );
        }
    }
    result
}
