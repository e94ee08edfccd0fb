//! JSONL export and file path policy for transfers.
//!
//! # Responsibility
//! - Write the export header and one snapshot per capsule.
//! - Gate file paths used by import/export.
//!
//! # Invariants
//! - Export order is `created_at ASC, id ASC`.
//! - Capsule text only leaves the store through the writer, never the log.

use crate::error::{CapsuleError, CapsuleResult};
use crate::model::capsule::now_epoch_ms;
use crate::repo::capsule_repo::{CapsuleRepository, SqliteCapsuleRepository};
use crate::service::collision::CapsuleSnapshot;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Component, Path};

pub const EXPORT_FORMAT_VERSION: u32 = 1;

/// First line of every export stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportHeader {
    pub version: u32,
    pub exported_at: i64,
    pub workspace: Option<String>,
    pub include_deleted: bool,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSummary {
    pub exported: usize,
}

#[derive(Serialize)]
struct HeaderLine<'a> {
    moss_export: &'a ExportHeader,
}

pub(crate) fn write_export<W: Write>(
    conn: &Connection,
    mut writer: W,
    workspace: Option<&str>,
    include_deleted: bool,
) -> CapsuleResult<ExportSummary> {
    let rows = SqliteCapsuleRepository::new(conn).export_rows(workspace, include_deleted)?;
    let header = ExportHeader {
        version: EXPORT_FORMAT_VERSION,
        exported_at: now_epoch_ms(),
        workspace: workspace.map(str::to_string),
        include_deleted,
        count: rows.len(),
    };

    write_json_line(
        &mut writer,
        &HeaderLine {
            moss_export: &header,
        },
    )?;
    for capsule in &rows {
        write_json_line(&mut writer, &CapsuleSnapshot::from(capsule))?;
    }
    writer.flush().map_err(CapsuleError::internal)?;

    Ok(ExportSummary {
        exported: rows.len(),
    })
}

fn write_json_line<W: Write, T: Serialize>(writer: &mut W, value: &T) -> CapsuleResult<()> {
    serde_json::to_writer(&mut *writer, value).map_err(CapsuleError::internal)?;
    writer.write_all(b"\n").map_err(CapsuleError::internal)
}

/// Policy for filesystem paths handed to import/export.
pub trait PathGuard: Send + Sync {
    fn check_read(&self, path: &Path) -> CapsuleResult<()>;
    fn check_write(&self, path: &Path) -> CapsuleResult<()>;
}

/// Absolute paths only, no `..` components, no symlinked targets.
#[derive(Debug, Default, Clone, Copy)]
pub struct StrictPathGuard;

impl StrictPathGuard {
    fn check_shape(path: &Path) -> CapsuleResult<()> {
        if !path.is_absolute() {
            return Err(CapsuleError::InvalidRequest(format!(
                "path `{}` must be absolute",
                path.display()
            )));
        }
        if path
            .components()
            .any(|component| matches!(component, Component::ParentDir))
        {
            return Err(CapsuleError::InvalidRequest(format!(
                "path `{}` must not contain `..`",
                path.display()
            )));
        }
        Ok(())
    }

    fn reject_symlink(path: &Path) -> CapsuleResult<()> {
        match std::fs::symlink_metadata(path) {
            Ok(meta) if meta.file_type().is_symlink() => Err(CapsuleError::InvalidRequest(
                format!("path `{}` is a symlink", path.display()),
            )),
            _ => Ok(()),
        }
    }
}

impl PathGuard for StrictPathGuard {
    fn check_read(&self, path: &Path) -> CapsuleResult<()> {
        Self::check_shape(path)?;
        Self::reject_symlink(path)?;
        if !path.is_file() {
            return Err(CapsuleError::InvalidRequest(format!(
                "path `{}` is not a readable file",
                path.display()
            )));
        }
        Ok(())
    }

    fn check_write(&self, path: &Path) -> CapsuleResult<()> {
        Self::check_shape(path)?;
        Self::reject_symlink(path)?;
        if path.is_dir() {
            return Err(CapsuleError::InvalidRequest(format!(
                "path `{}` is a directory",
                path.display()
            )));
        }
        Ok(())
    }
}
