use moss_core::{
    BulkUpdateFields, CapsuleDraft, CapsuleFilter, CapsuleListQuery, CapsulePatch, CapsuleRef,
    CapsuleService, ErrorCode, FetchKey, Lifecycle, StoreConfig, StoreMode, StoreRequest,
};
use std::thread::sleep;
use std::time::Duration;

fn service() -> CapsuleService {
    CapsuleService::open_in_memory(StoreConfig::default()).unwrap()
}

fn capsule_text(topic: &str) -> String {
    format!(
        "## Objective\nShip the {topic}.\n\n\
         ## Current Status\nLexer done.\n\n\
         ## Decisions\nUse recursive descent.\n\n\
         ## Key Locations\nsrc/{topic}.rs\n\n\
         ## Open Questions\nError recovery strategy?\n\n\
         ## Next Steps\nWrite the printer."
    )
}

fn request(workspace: &str, name: Option<&str>, text: &str) -> StoreRequest {
    StoreRequest {
        draft: CapsuleDraft {
            workspace: workspace.to_string(),
            name: name.map(str::to_string),
            text: text.to_string(),
            ..CapsuleDraft::default()
        },
        mode: StoreMode::Error,
        allow_thin: false,
    }
}

#[test]
fn store_then_fetch_by_name_and_id() {
    let mut service = service();
    let text = capsule_text("parser");
    let stored = service
        .store(request("Team A", Some("Auth  Flow"), &text))
        .unwrap();
    assert!(stored.created);

    let by_name = service
        .fetch(&CapsuleRef::by_name("  team a ", "AUTH flow"), false)
        .unwrap();
    assert_eq!(by_name.id, stored.capsule.id);
    assert_eq!(by_name.title.as_deref(), Some("Auth  Flow"));
    assert_eq!(by_name.capsule_chars, text.chars().count() as i64);
    assert_eq!(
        by_name.fetch_key(),
        FetchKey::ByName {
            moss_capsule: "auth flow".to_string(),
            moss_workspace: "team a".to_string(),
        }
    );

    let by_id = service
        .fetch(&CapsuleRef::by_id(stored.capsule.id), false)
        .unwrap();
    assert_eq!(by_id, by_name);
}

#[test]
fn store_error_mode_rejects_duplicate_active_name() {
    let mut service = service();
    service
        .store(request("default", Some("plan"), &capsule_text("a")))
        .unwrap();

    let err = service
        .store(request("", Some(" PLAN "), &capsule_text("b")))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NameAlreadyExists);
}

#[test]
fn store_replace_keeps_id_and_created_at() {
    let mut service = service();
    let first = service
        .store(request("default", Some("plan"), &capsule_text("a")))
        .unwrap();

    let mut replace = request("default", Some("Plan"), &capsule_text("bb"));
    replace.mode = StoreMode::Replace;
    let second = service.store(replace).unwrap();

    assert!(!second.created);
    assert_eq!(second.capsule.id, first.capsule.id);
    assert_eq!(second.capsule.created_at, first.capsule.created_at);
    assert!(second.capsule.updated_at > first.capsule.updated_at);
    assert_eq!(second.capsule.capsule_text, capsule_text("bb"));
    assert_eq!(second.capsule.name_raw.as_deref(), Some("Plan"));
}

#[test]
fn store_replace_creates_when_name_is_free() {
    let mut service = service();
    let mut replace = request("default", Some("fresh"), &capsule_text("a"));
    replace.mode = StoreMode::Replace;
    assert!(service.store(replace).unwrap().created);
}

#[test]
fn deleted_name_is_reusable_and_tombstone_stays_addressable() {
    let mut service = service();
    let old = service
        .store(request("default", Some("plan"), &capsule_text("a")))
        .unwrap();
    let summary = service
        .delete(&CapsuleRef::by_name("default", "plan"))
        .unwrap();
    assert!(summary.deleted_at.is_some());

    let new = service
        .store(request("default", Some("plan"), &capsule_text("b")))
        .unwrap();
    assert_ne!(new.capsule.id, old.capsule.id);

    let active = service
        .fetch(&CapsuleRef::by_name("default", "plan"), true)
        .unwrap();
    assert_eq!(active.id, new.capsule.id);

    let tombstone = service
        .fetch(&CapsuleRef::by_id(old.capsule.id), true)
        .unwrap();
    assert!(matches!(tombstone.lifecycle, Lifecycle::Deleted { .. }));

    let hidden = service
        .fetch(&CapsuleRef::by_id(old.capsule.id), false)
        .unwrap_err();
    assert_eq!(hidden.code(), ErrorCode::NotFound);

    let again = service
        .delete(&CapsuleRef::by_id(old.capsule.id))
        .unwrap_err();
    assert_eq!(again.code(), ErrorCode::NotFound);
}

#[test]
fn name_lookup_with_deleted_falls_back_to_latest_tombstone() {
    let mut service = service();
    let stored = service
        .store(request("default", Some("gone"), &capsule_text("a")))
        .unwrap();
    service.delete(&CapsuleRef::by_name("default", "gone")).unwrap();

    let found = service
        .fetch(&CapsuleRef::by_name("default", "gone"), true)
        .unwrap();
    assert_eq!(found.id, stored.capsule.id);
    assert!(!found.is_active());
}

#[test]
fn unnamed_capsules_use_id_fetch_key() {
    let mut service = service();
    let stored = service.store(request("default", None, &capsule_text("x"))).unwrap();

    assert_eq!(stored.capsule.title, None);
    assert_eq!(
        stored.capsule.fetch_key(),
        FetchKey::ById {
            moss_id: stored.capsule.id.to_string(),
        }
    );
}

#[test]
fn malformed_addresses_are_rejected_before_lookup() {
    let service = service();
    let id = uuid::Uuid::now_v7().to_string();

    let ambiguous = CapsuleRef {
        id: Some(id),
        workspace: None,
        name: Some("plan".to_string()),
    };
    assert_eq!(
        service.fetch(&ambiguous, false).unwrap_err().code(),
        ErrorCode::AmbiguousAddressing
    );
    assert_eq!(
        service.fetch(&CapsuleRef::default(), false).unwrap_err().code(),
        ErrorCode::InvalidRequest
    );
    assert_eq!(
        service.fetch(&CapsuleRef::by_id("nope"), false).unwrap_err().code(),
        ErrorCode::InvalidRequest
    );
    assert_eq!(
        service
            .fetch(&CapsuleRef::by_name("default", "ghost"), false)
            .unwrap_err()
            .code(),
        ErrorCode::NotFound
    );
}

#[test]
fn oversized_and_thin_capsules_are_rejected() {
    let mut small = CapsuleService::open_in_memory(StoreConfig {
        capsule_max_chars: 50,
        ..StoreConfig::default()
    })
    .unwrap();
    let err = small
        .store(request("default", Some("big"), &capsule_text("a")))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::CapsuleTooLarge);

    let mut service = service();
    let err = service
        .store(request("default", Some("thin"), "## Objective\nTBD\n"))
        .unwrap_err();
    match err {
        moss_core::CapsuleError::CapsuleTooThin { missing } => {
            assert!(missing.contains(&"Objective".to_string()));
            assert!(missing.contains(&"Next Steps".to_string()));
        }
        other => panic!("unexpected error: {other}"),
    }

    let mut thin = request("default", Some("thin"), "just notes");
    thin.allow_thin = true;
    service.store(thin).unwrap();
}

#[test]
fn update_patches_fields_and_bumps_updated_at() {
    let mut service = service();
    let stored = service
        .store(request("default", Some("plan"), &capsule_text("a")))
        .unwrap();
    let target = CapsuleRef::by_name("default", "plan");

    let updated = service
        .update(
            &target,
            &CapsulePatch {
                text: Some(capsule_text("longer topic")),
                tags: Some(vec!["Rust".to_string(), "rust".to_string()]),
                run_id: Some("run-1".to_string()),
                ..CapsulePatch::default()
            },
        )
        .unwrap();
    assert_eq!(updated.id, stored.capsule.id);
    assert!(updated.updated_at > stored.capsule.updated_at);
    assert_eq!(updated.tags, vec!["rust".to_string()]);
    assert_eq!(updated.run_id.as_deref(), Some("run-1"));
    assert_eq!(
        updated.capsule_chars,
        capsule_text("longer topic").chars().count() as i64
    );

    let cleared = service
        .update(
            &target,
            &CapsulePatch {
                run_id: Some(String::new()),
                ..CapsulePatch::default()
            },
        )
        .unwrap();
    assert_eq!(cleared.run_id, None);
    assert!(cleared.updated_at > updated.updated_at);

    let empty = service.update(&target, &CapsulePatch::default()).unwrap_err();
    assert_eq!(empty.code(), ErrorCode::InvalidRequest);

    service.delete(&target).unwrap();
    let missing = service
        .update(
            &target,
            &CapsulePatch {
                phase: Some("review".to_string()),
                ..CapsulePatch::default()
            },
        )
        .unwrap_err();
    assert_eq!(missing.code(), ErrorCode::NotFound);
}

#[test]
fn append_joins_with_blank_line_and_checks_size() {
    let mut service = CapsuleService::open_in_memory(StoreConfig {
        capsule_max_chars: 400,
        ..StoreConfig::default()
    })
    .unwrap();
    service
        .store(request("default", Some("log"), &capsule_text("a")))
        .unwrap();
    let target = CapsuleRef::by_name("default", "log");

    let appended = service.append(&target, "extra line").unwrap();
    assert!(appended.capsule_text.ends_with("printer.\n\nextra line"));
    assert_eq!(
        appended.capsule_chars,
        appended.capsule_text.chars().count() as i64
    );

    let err = service.append(&target, &"x".repeat(400)).unwrap_err();
    assert_eq!(err.code(), ErrorCode::CapsuleTooLarge);
    let unchanged = service.fetch(&target, false).unwrap();
    assert_eq!(unchanged.capsule_text, appended.capsule_text);

    assert_eq!(
        service.append(&target, "   ").unwrap_err().code(),
        ErrorCode::InvalidRequest
    );
}

#[test]
fn fetch_many_reports_per_item_errors() {
    let mut service = service();
    service
        .store(request("default", Some("one"), &capsule_text("a")))
        .unwrap();
    service
        .store(request("default", Some("two"), &capsule_text("b")))
        .unwrap();

    let items = service
        .fetch_many(
            &[
                CapsuleRef::by_name("default", "one"),
                CapsuleRef::by_name("default", "missing"),
                CapsuleRef::by_name("default", "two"),
            ],
            false,
        )
        .unwrap();

    assert_eq!(items.len(), 3);
    assert!(items[0].capsule.is_some());
    assert_eq!(items[1].error.as_ref().unwrap().code, ErrorCode::NotFound);
    assert_eq!(items[2].index, 2);
    assert_eq!(
        items[2].capsule.as_ref().unwrap().name_norm.as_deref(),
        Some("two")
    );

    assert_eq!(
        service.fetch_many(&[], false).unwrap_err().code(),
        ErrorCode::InvalidRequest
    );
}

#[test]
fn bulk_update_and_delete_touch_matching_active_rows() {
    let mut service = service();
    for (name, run) in [("a", Some("r1")), ("b", Some("r1")), ("c", None)] {
        let mut req = request("default", Some(name), &capsule_text(name));
        req.draft.run_id = run.map(str::to_string);
        service.store(req).unwrap();
    }
    let by_run = CapsuleFilter {
        run_id: Some("r1".to_string()),
        ..CapsuleFilter::default()
    };

    let updated = service
        .bulk_update(
            &by_run,
            &BulkUpdateFields {
                phase: Some("review".to_string()),
                tags: Some(vec!["Batch".to_string()]),
                ..BulkUpdateFields::default()
            },
        )
        .unwrap();
    assert_eq!(updated.affected, 2);

    let tagged = service
        .list(&CapsuleListQuery {
            filter: CapsuleFilter {
                tag: Some("batch".to_string()),
                phase: Some("review".to_string()),
                ..CapsuleFilter::default()
            },
            ..CapsuleListQuery::default()
        })
        .unwrap();
    assert_eq!(tagged.pagination.total, 2);

    let deleted = service.bulk_delete(&by_run).unwrap();
    assert_eq!(deleted.affected, 2);
    assert_eq!(service.bulk_delete(&by_run).unwrap().affected, 0);

    let remaining = service.list(&CapsuleListQuery::default()).unwrap();
    assert_eq!(remaining.items.len(), 1);
    assert_eq!(remaining.items[0].name.as_deref(), Some("c"));

    let blank = CapsuleFilter {
        workspace: Some("   ".to_string()),
        ..CapsuleFilter::default()
    };
    assert_eq!(
        service.bulk_delete(&blank).unwrap_err().code(),
        ErrorCode::InvalidRequest
    );
    assert_eq!(
        service
            .bulk_update(&by_run, &BulkUpdateFields::default())
            .unwrap_err()
            .code(),
        ErrorCode::InvalidRequest
    );
}

#[test]
fn name_prefix_filter_matches_normalized_names() {
    let mut service = service();
    for name in ["Auth Flow", "auth-db", "billing"] {
        service
            .store(request("default", Some(name), &capsule_text("x")))
            .unwrap();
    }
    let page = service
        .list(&CapsuleListQuery {
            filter: CapsuleFilter {
                name_prefix: Some("AUTH".to_string()),
                ..CapsuleFilter::default()
            },
            ..CapsuleListQuery::default()
        })
        .unwrap();
    assert_eq!(page.pagination.total, 2);
}

#[test]
fn purge_removes_only_tombstones() {
    let mut service = service();
    let keep = service
        .store(request("default", Some("keep"), &capsule_text("a")))
        .unwrap();
    let dropped = service
        .store(request("default", Some("drop"), &capsule_text("b")))
        .unwrap();
    service.delete(&CapsuleRef::by_name("default", "drop")).unwrap();

    assert_eq!(service.purge(None, Some(1)).unwrap().affected, 0);
    assert_eq!(service.purge(Some("other"), None).unwrap().affected, 0);
    assert_eq!(service.purge(Some("Default"), None).unwrap().affected, 1);

    service.fetch(&CapsuleRef::by_id(keep.capsule.id), false).unwrap();
    assert_eq!(
        service
            .fetch(&CapsuleRef::by_id(dropped.capsule.id), true)
            .unwrap_err()
            .code(),
        ErrorCode::NotFound
    );
}

#[test]
fn list_paginates_newest_first_and_latest_follows_updates() {
    let mut service = service();
    for name in ["a", "b", "c"] {
        service
            .store(request("proj", Some(name), &capsule_text(name)))
            .unwrap();
    }
    sleep(Duration::from_millis(5));
    service
        .update(
            &CapsuleRef::by_name("proj", "a"),
            &CapsulePatch {
                phase: Some("done".to_string()),
                ..CapsulePatch::default()
            },
        )
        .unwrap();

    let page = service
        .list(&CapsuleListQuery {
            filter: CapsuleFilter {
                workspace: Some("PROJ".to_string()),
                ..CapsuleFilter::default()
            },
            limit: Some(2),
            ..CapsuleListQuery::default()
        })
        .unwrap();
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.items[0].name.as_deref(), Some("a"));
    assert!(page.pagination.has_more);
    assert_eq!(page.pagination.total, 3);

    let rest = service
        .list(&CapsuleListQuery {
            limit: Some(2),
            offset: 2,
            ..CapsuleListQuery::default()
        })
        .unwrap();
    assert_eq!(rest.items.len(), 1);
    assert!(!rest.pagination.has_more);

    let latest = service.latest(Some("proj"), false).unwrap();
    assert_eq!(latest.name_norm.as_deref(), Some("a"));
    assert_eq!(
        service.latest(Some("empty"), false).unwrap_err().code(),
        ErrorCode::NotFound
    );
}
