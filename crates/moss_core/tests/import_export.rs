use moss_core::{
    CancellationToken, CapsuleDraft, CapsuleRef, CapsuleService, ErrorCode, ImportErrorCode,
    ImportMode, Lifecycle, StoreConfig, StoreMode, StoreRequest,
};
use serde_json::json;
use std::io::{BufRead, Cursor, Read};
use std::path::Path;

fn service() -> CapsuleService {
    CapsuleService::open_in_memory(StoreConfig::default()).unwrap()
}

fn store(service: &mut CapsuleService, name: &str, text: &str) -> uuid::Uuid {
    service
        .store(StoreRequest {
            draft: CapsuleDraft {
                name: Some(name.to_string()),
                text: text.to_string(),
                ..CapsuleDraft::default()
            },
            mode: StoreMode::Error,
            allow_thin: true,
        })
        .unwrap()
        .capsule
        .id
}

fn export_all(service: &mut CapsuleService) -> String {
    let mut buffer = Vec::new();
    service.export_jsonl(&mut buffer, None, true).unwrap();
    String::from_utf8(buffer).unwrap()
}

fn import(service: &mut CapsuleService, input: &str, mode: ImportMode) -> moss_core::ImportResult {
    service
        .import_jsonl(input.as_bytes(), mode, &CancellationToken::new())
        .unwrap()
}

fn record(id: uuid::Uuid, name: &str, text: &str) -> String {
    json!({
        "id": id.to_string(),
        "workspace": "default",
        "name": name,
        "capsule_text": text,
    })
    .to_string()
}

#[test]
fn export_then_import_reproduces_ids_and_tombstones() {
    let mut source = service();
    let kept = store(&mut source, "kept", "first body");
    let gone = store(&mut source, "gone", "second body");
    source.delete(&CapsuleRef::by_id(gone)).unwrap();

    let exported = export_all(&mut source);
    let mut lines = exported.lines();
    assert!(lines.next().unwrap().contains("\"moss_export\""));
    assert_eq!(lines.count(), 2);

    let mut target = service();
    let result = import(&mut target, &exported, ImportMode::Error);
    assert_eq!(result.imported, 2);
    assert!(result.errors.is_empty());

    let restored = target.fetch(&CapsuleRef::by_id(kept), false).unwrap();
    let original = source.fetch(&CapsuleRef::by_id(kept), false).unwrap();
    assert_eq!(restored.capsule_text, original.capsule_text);
    assert_eq!(restored.created_at, original.created_at);

    let tombstone = target.fetch(&CapsuleRef::by_id(gone), true).unwrap();
    assert!(matches!(tombstone.lifecycle, Lifecycle::Deleted { .. }));
}

#[test]
fn export_can_be_scoped_to_active_rows_of_one_workspace() {
    let mut source = service();
    store(&mut source, "a", "one");
    let gone = store(&mut source, "b", "two");
    source.delete(&CapsuleRef::by_id(gone)).unwrap();

    let mut buffer = Vec::new();
    let summary = source
        .export_jsonl(&mut buffer, Some("Default"), false)
        .unwrap();
    assert_eq!(summary.exported, 1);

    let mut buffer = Vec::new();
    let summary = source.export_jsonl(&mut buffer, Some("other"), true).unwrap();
    assert_eq!(summary.exported, 0);
}

#[test]
fn error_mode_aborts_whole_batch_on_name_collision() {
    let mut target = service();
    store(&mut target, "taken", "local");

    let first = uuid::Uuid::now_v7();
    let input = format!(
        "{}\n\n{}\n",
        record(first, "fresh", "a"),
        record(uuid::Uuid::now_v7(), "Taken", "b")
    );
    let result = import(&mut target, &input, ImportMode::Error);

    assert_eq!(result.imported, 0);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].code, ImportErrorCode::NameAlreadyExists);
    assert_eq!(result.errors[0].line, 3);
    assert_eq!(
        target
            .fetch(&CapsuleRef::by_id(first), true)
            .unwrap_err()
            .code(),
        ErrorCode::NotFound
    );
}

#[test]
fn error_mode_aborts_when_first_record_collides() {
    let mut target = service();
    store(&mut target, "taken", "local");

    let trailing = uuid::Uuid::now_v7();
    let input = format!(
        "{}\n{}\n",
        record(uuid::Uuid::now_v7(), "taken", "b"),
        record(trailing, "fresh", "a")
    );
    let result = import(&mut target, &input, ImportMode::Error);

    assert_eq!(result.imported, 0);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].line, 1);
    assert_eq!(result.errors[0].code, ImportErrorCode::NameAlreadyExists);
    assert_eq!(
        target
            .fetch(&CapsuleRef::by_id(trailing), true)
            .unwrap_err()
            .code(),
        ErrorCode::NotFound
    );
}

#[test]
fn error_mode_rejects_id_collisions_and_bad_records() {
    let mut source = service();
    store(&mut source, "a", "one");
    let exported = export_all(&mut source);

    let mut target = service();
    assert_eq!(import(&mut target, &exported, ImportMode::Error).imported, 1);

    let again = import(&mut target, &exported, ImportMode::Error);
    assert_eq!(again.imported, 0);
    assert_eq!(again.errors[0].code, ImportErrorCode::IdAlreadyExists);

    let garbage = import(&mut target, "not json\n", ImportMode::Error);
    assert_eq!(garbage.errors[0].code, ImportErrorCode::InvalidRequest);
    assert_eq!(garbage.errors[0].line, 1);

    let bad_id = import(
        &mut target,
        &json!({"id": "nope", "capsule_text": "x"}).to_string(),
        ImportMode::Error,
    );
    assert_eq!(bad_id.errors[0].code, ImportErrorCode::InvalidRequest);
    assert_eq!(bad_id.errors[0].id.as_deref(), Some("nope"));
}

#[test]
fn imported_metrics_are_recomputed() {
    let mut target = service();
    let id = uuid::Uuid::now_v7();
    let input = json!({
        "id": id.to_string(),
        "name": "m",
        "capsule_text": "héllo",
        "capsule_chars": 9999,
        "tokens_estimate": 9999,
    })
    .to_string();
    assert_eq!(import(&mut target, &input, ImportMode::Error).imported, 1);

    let capsule = target.fetch(&CapsuleRef::by_id(id), false).unwrap();
    assert_eq!(capsule.capsule_chars, 5);
    assert_eq!(capsule.tokens_estimate, 2);
}

#[test]
fn replace_mode_updates_by_id_and_restores_tombstones() {
    let mut target = service();
    let id = store(&mut target, "plan", "old");
    target.delete(&CapsuleRef::by_id(id)).unwrap();

    let result = import(&mut target, &record(id, "plan", "new"), ImportMode::Replace);
    assert_eq!(result.imported, 1);

    let restored = target.fetch(&CapsuleRef::by_name("default", "plan"), false).unwrap();
    assert_eq!(restored.id, id);
    assert_eq!(restored.capsule_text, "new");
    assert!(restored.is_active());
}

#[test]
fn replace_mode_name_match_keeps_existing_id() {
    let mut target = service();
    let local = store(&mut target, "plan", "local");

    let result = import(
        &mut target,
        &record(uuid::Uuid::now_v7(), "PLAN", "incoming"),
        ImportMode::Replace,
    );
    assert_eq!(result.imported, 1);

    let merged = target.fetch(&CapsuleRef::by_name("default", "plan"), false).unwrap();
    assert_eq!(merged.id, local);
    assert_eq!(merged.capsule_text, "incoming");
}

#[test]
fn replace_mode_skips_ambiguous_records_and_keeps_the_rest() {
    let mut target = service();
    let x = store(&mut target, "x", "x body");
    store(&mut target, "y", "y body");

    let fresh = uuid::Uuid::now_v7();
    let input = format!(
        "{}\n{}\n",
        record(x, "y", "conflicting"),
        record(fresh, "z", "z body")
    );
    let result = import(&mut target, &input, ImportMode::Replace);

    assert_eq!(result.imported, 1);
    assert_eq!(result.skipped, 1);
    assert_eq!(result.errors[0].code, ImportErrorCode::AmbiguousCollision);
    assert_eq!(result.errors[0].line, 1);
    assert_eq!(
        target.fetch(&CapsuleRef::by_id(x), false).unwrap().capsule_text,
        "x body"
    );
    target.fetch(&CapsuleRef::by_id(fresh), false).unwrap();
}

#[test]
fn rename_mode_assigns_fresh_id_and_lowest_free_suffix() {
    let mut target = service();
    let existing = store(&mut target, "plan", "original");
    store(&mut target, "plan-1", "taken suffix");

    let result = import(&mut target, &record(existing, "Plan", "copy"), ImportMode::Rename);
    assert_eq!(result.imported, 1);

    let renamed = target
        .fetch(&CapsuleRef::by_name("default", "plan-2"), false)
        .unwrap();
    assert_ne!(renamed.id, existing);
    assert_eq!(renamed.name_raw.as_deref(), Some("Plan-2"));
    assert_eq!(renamed.capsule_text, "copy");

    let untouched = target.fetch(&CapsuleRef::by_id(existing), false).unwrap();
    assert_eq!(untouched.capsule_text, "original");
}

#[test]
fn rename_mode_suffixes_names_colliding_within_one_batch() {
    let mut target = service();
    let ids: Vec<uuid::Uuid> = (0..3).map(|_| uuid::Uuid::now_v7()).collect();
    let input = format!(
        "{}\n{}\n{}\n",
        record(ids[0], "plan", "a"),
        record(ids[1], "Plan", "b"),
        record(ids[2], "PLAN", "c")
    );
    let result = import(&mut target, &input, ImportMode::Rename);
    assert_eq!(result.imported, 3);
    assert!(result.errors.is_empty());

    for (name, text) in [("plan", "a"), ("plan-1", "b"), ("plan-2", "c")] {
        let capsule = target
            .fetch(&CapsuleRef::by_name("default", name), false)
            .unwrap();
        assert_eq!(capsule.capsule_text, text);
    }
}

#[test]
fn invalid_utf8_line_is_a_record_error() {
    let first = uuid::Uuid::now_v7();
    let last = uuid::Uuid::now_v7();
    let mut input = record(first, "a", "one").into_bytes();
    input.extend_from_slice(b"\n{\"id\":\"x\",\"capsule_text\":\"\xff\xfe\"}\n");
    input.extend_from_slice(record(last, "b", "two").as_bytes());

    let mut target = service();
    let result = target
        .import_jsonl(&input[..], ImportMode::Rename, &CancellationToken::new())
        .unwrap();
    assert_eq!(result.imported, 2);
    assert_eq!(result.skipped, 1);
    assert_eq!(result.errors[0].line, 2);
    assert_eq!(result.errors[0].code, ImportErrorCode::InvalidRequest);
    target.fetch(&CapsuleRef::by_id(first), false).unwrap();
    target.fetch(&CapsuleRef::by_id(last), false).unwrap();

    let mut strict = service();
    let result = strict
        .import_jsonl(&input[..], ImportMode::Error, &CancellationToken::new())
        .unwrap();
    assert_eq!(result.imported, 0);
    assert_eq!(result.errors[0].code, ImportErrorCode::InvalidRequest);
    assert_eq!(
        strict.fetch(&CapsuleRef::by_id(first), true).unwrap_err().code(),
        ErrorCode::NotFound
    );
}

/// Reader that cancels `token` once `lines` newlines have been consumed.
struct CancelAfterLines {
    inner: Cursor<Vec<u8>>,
    token: CancellationToken,
    lines: usize,
}

impl Read for CancelAfterLines {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl BufRead for CancelAfterLines {
    fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        let start = self.inner.position() as usize;
        let newlines = self.inner.get_ref()[start..start + amt]
            .iter()
            .filter(|byte| **byte == b'\n')
            .count();
        self.inner.consume(amt);
        self.lines = self.lines.saturating_sub(newlines);
        if self.lines == 0 {
            self.token.cancel();
        }
    }
}

#[test]
fn cancellation_mid_import_rolls_back_applied_records() {
    let ids: Vec<uuid::Uuid> = (0..3).map(|_| uuid::Uuid::now_v7()).collect();
    let input = format!(
        "{}\n{}\n{}\n",
        record(ids[0], "a", "one"),
        record(ids[1], "b", "two"),
        record(ids[2], "c", "three")
    );
    let token = CancellationToken::new();
    let reader = CancelAfterLines {
        inner: Cursor::new(input.into_bytes()),
        token: token.clone(),
        lines: 2,
    };

    let mut target = service();
    let err = target
        .import_jsonl(reader, ImportMode::Replace, &token)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Cancelled);
    for id in ids {
        assert_eq!(
            target.fetch(&CapsuleRef::by_id(id), true).unwrap_err().code(),
            ErrorCode::NotFound
        );
    }
}

#[test]
fn cancelled_import_leaves_no_rows() {
    let mut target = service();
    let id = uuid::Uuid::now_v7();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = target
        .import_jsonl(record(id, "a", "body").as_bytes(), ImportMode::Replace, &cancel)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Cancelled);
    assert_eq!(
        target.fetch(&CapsuleRef::by_id(id), true).unwrap_err().code(),
        ErrorCode::NotFound
    );
}

#[test]
fn file_round_trip_goes_through_path_guard() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capsules.jsonl");

    let mut source = service();
    let id = store(&mut source, "a", "body");
    assert_eq!(source.export_file(&path, None, false).unwrap().exported, 1);

    let mut target = service();
    let result = target
        .import_file(&path, ImportMode::Error, &CancellationToken::new())
        .unwrap();
    assert_eq!(result.imported, 1);
    target.fetch(&CapsuleRef::by_id(id), false).unwrap();

    let relative = source
        .export_file(Path::new("capsules.jsonl"), None, false)
        .unwrap_err();
    assert_eq!(relative.code(), ErrorCode::InvalidRequest);
    let missing = target
        .import_file(
            &dir.path().join("missing.jsonl"),
            ImportMode::Error,
            &CancellationToken::new(),
        )
        .unwrap_err();
    assert_eq!(missing.code(), ErrorCode::InvalidRequest);
}
