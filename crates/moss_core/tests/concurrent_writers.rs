use moss_core::{
    CapsuleDraft, CapsuleListQuery, CapsuleRef, CapsuleService, StoreConfig, StoreMode,
    StoreRequest,
};
use std::collections::HashSet;
use std::thread;

fn replace_request(round: usize, writer: usize) -> StoreRequest {
    StoreRequest {
        draft: CapsuleDraft {
            workspace: "shared".to_string(),
            name: Some("Status".to_string()),
            text: format!("writer {writer} round {round}"),
            ..CapsuleDraft::default()
        },
        mode: StoreMode::Replace,
        allow_thin: true,
    }
}

#[test]
fn concurrent_store_replace_keeps_one_active_row() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");
    drop(CapsuleService::open(&path, StoreConfig::default()).unwrap());

    let handles: Vec<_> = (0..4)
        .map(|writer| {
            let path = path.clone();
            thread::spawn(move || {
                let mut service = CapsuleService::open(&path, StoreConfig::default()).unwrap();
                (0..10)
                    .map(|round| service.store(replace_request(round, writer)).unwrap().capsule.id)
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let ids: HashSet<_> = handles
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect();
    assert_eq!(ids.len(), 1);

    let service = CapsuleService::open(&path, StoreConfig::default()).unwrap();
    let page = service.list(&CapsuleListQuery::default()).unwrap();
    assert_eq!(page.pagination.total, 1);

    let capsule = service
        .fetch(&CapsuleRef::by_name("shared", "status"), false)
        .unwrap();
    assert!(ids.contains(&capsule.id));
    assert!(capsule.capsule_text.starts_with("writer "));
}

#[test]
fn second_connection_sees_committed_writes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("visible.db");

    let mut writer = CapsuleService::open(&path, StoreConfig::default()).unwrap();
    let reader = CapsuleService::open(&path, StoreConfig::default()).unwrap();
    let stored = writer.store(replace_request(0, 0)).unwrap();

    let seen = reader
        .fetch(&CapsuleRef::by_id(stored.capsule.id), false)
        .unwrap();
    assert_eq!(seen.capsule_text, "writer 0 round 0");
}
