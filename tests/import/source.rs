//! Importing base records from JSON sources.

use canvass_sync::error::{CanvassError, ImportError};
use canvass_sync::import::{import_json, last_import_at, ImportOptions};
use canvass_sync::merge::merge_indexed;
use canvass_sync::normalize::{is_synthetic, normalize};
use canvass_sync::storage::{LocalStore, LocalStoreOptions, MemoryBackend};
use canvass_sync::types::Table;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn store() -> LocalStore<MemoryBackend> {
    LocalStore::new(MemoryBackend::new(), LocalStoreOptions::default())
}

const SOURCE: &str = r#"{
    "voters": [
        { "EPIC No": "mh/01/001", "Name": "Asha Rao", "Part No": "12", "Sex": "female", "Mobile": "98-765 43210" },
        { "EPIC No": "MH/01/002", "Name": "Bilal Khan", "Part No": 12, "Age": "33" },
        { "EPIC No": "MH/01/003", "Name": "Chitra", "Part No": "13" },
        "not a voter"
    ]
}"#;

#[tokio::test]
async fn imports_and_indexes_by_precinct() {
    let store = store();
    let report = import_json(&store, SOURCE, &ImportOptions::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_complete());
    assert_eq!(report.imported, 3);
    assert_eq!(report.rejected, 1);
    assert!(report.collisions.is_empty());
    assert!(last_import_at(&store).unwrap().is_some());

    // "12" and 12 both land on the numeric precinct.
    let views = merge_indexed(&store, None, "precinct", &json!(12)).unwrap();
    let ids: Vec<&str> = views.iter().map(|v| v.entity_id.as_str()).collect();
    assert_eq!(ids, vec!["MH/01/001", "MH/01/002"]);
    assert_eq!(views[0].get("gender"), Some(&json!("F")));
    assert_eq!(views[0].get("phoneDigits"), Some(&json!("9876543210")));
    assert_eq!(views[0].raw_id.as_deref(), Some("mh/01/001"));
    assert_eq!(views[1].get("age"), Some(&json!(33)));
}

#[tokio::test]
async fn second_import_is_skipped_unless_forced() {
    let store = store();
    let cancel = CancellationToken::new();
    import_json(&store, SOURCE, &ImportOptions::default(), &cancel)
        .await
        .unwrap();

    let again = import_json(
        &store,
        r#"[{ "id": "NEW1", "name": "Dev" }]"#,
        &ImportOptions::default(),
        &cancel,
    )
    .await
    .unwrap();
    assert!(again.skipped);
    assert_eq!(again.imported, 0);
    assert!(store.get_base(&normalize("NEW1")).unwrap().is_none());

    let forced = import_json(
        &store,
        r#"[{ "id": "NEW1", "name": "Dev" }]"#,
        &ImportOptions { force: true },
        &cancel,
    )
    .await
    .unwrap();
    assert!(forced.is_complete());
    assert_eq!(store.count(Table::Base).unwrap(), 4);
}

#[tokio::test]
async fn identifiers_differing_by_case_and_spacing_collapse() {
    let store = store();
    let source = r#"[
        { "id": " ab123 ", "name": "First" },
        { "id": "AB123", "name": "Second" },
        { "id": "ab123", "name": "Third" },
        { "id": "XY9", "name": "Other" }
    ]"#;
    let report = import_json(&store, source, &ImportOptions::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.imported, 2);
    assert_eq!(report.collisions.len(), 1);
    let collision = &report.collisions[0];
    assert_eq!(collision.entity_id.as_str(), "AB123");
    assert_eq!(collision.kept, " ab123 ");
    assert_eq!(collision.dropped, vec!["AB123".to_string(), "ab123".to_string()]);

    let kept = store.get_base(&normalize("Ab 123")).unwrap().unwrap();
    assert_eq!(kept.fields["name"], json!("First"));
}

#[tokio::test]
async fn records_without_identifiers_get_distinct_synthetic_keys() {
    let store = store();
    let source = r#"[{ "name": "No Id" }, { "id": "  ", "name": "Blank Id" }]"#;
    let report = import_json(&store, source, &ImportOptions::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.imported, 2);
    assert_eq!(report.synthetic, 2);
    let all = store.scan_all(Table::Base).unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|r| is_synthetic(r.entity_id())));
}

#[tokio::test]
async fn cancelled_import_records_no_completion_time() {
    let store = store();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = import_json(&store, SOURCE, &ImportOptions::default(), &cancel)
        .await
        .unwrap();
    assert!(report.cancelled);
    assert_eq!(report.imported, 0);
    assert!(last_import_at(&store).unwrap().is_none());
}

#[tokio::test]
async fn malformed_sources_are_rejected() {
    let store = store();
    let cancel = CancellationToken::new();

    let err = import_json(&store, "{ not json", &ImportOptions::default(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, CanvassError::Import(ImportError::Parse(_))));

    let err = import_json(&store, "42", &ImportOptions::default(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, CanvassError::Import(ImportError::NotAnArray(_))));
    assert_eq!(store.count(Table::Base).unwrap(), 0);
}

#[tokio::test]
async fn import_stopped_by_quota_resumes_on_retry() {
    let store = LocalStore::new(
        MemoryBackend::with_capacity(2),
        LocalStoreOptions {
            chunk_size: Some(2),
            indexes: None,
        },
    );
    let source = r#"[
        { "id": "R1", "name": "One" },
        { "id": "R2", "name": "Two" },
        { "name": "No Id" },
        { "id": "R4", "name": "Four" }
    ]"#;
    let cancel = CancellationToken::new();

    let first = import_json(&store, source, &ImportOptions::default(), &cancel)
        .await
        .unwrap();
    assert_eq!(first.imported, 2);
    assert!(first.error.as_ref().is_some_and(|e| e.is_quota()));
    assert!(last_import_at(&store).unwrap().is_none());

    // Space is freed; the same import runs again and finishes.
    store.backend().set_capacity(None);
    let retry = import_json(&store, source, &ImportOptions::default(), &cancel)
        .await
        .unwrap();
    assert!(!retry.skipped);
    assert!(retry.is_complete());
    assert_eq!(store.count(Table::Base).unwrap(), 4);
    assert!(last_import_at(&store).unwrap().is_some());
}

#[tokio::test]
async fn forced_reimport_of_records_without_identifiers_overwrites() {
    let store = store();
    let source = r#"[{ "name": "No Id A" }, { "name": "No Id B" }]"#;
    let cancel = CancellationToken::new();

    import_json(&store, source, &ImportOptions::default(), &cancel)
        .await
        .unwrap();
    let keys: Vec<String> = store
        .scan_all(Table::Base)
        .unwrap()
        .iter()
        .map(|r| r.entity_id().as_str().to_string())
        .collect();

    let forced = import_json(&store, source, &ImportOptions { force: true }, &cancel)
        .await
        .unwrap();
    assert!(forced.is_complete());
    assert_eq!(forced.synthetic, 2);
    assert_eq!(store.count(Table::Base).unwrap(), 2);
    let again: Vec<String> = store
        .scan_all(Table::Base)
        .unwrap()
        .iter()
        .map(|r| r.entity_id().as_str().to_string())
        .collect();
    assert_eq!(again, keys);
}
