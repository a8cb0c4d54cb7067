//! Store-backed merged views: precedence, pending fold-in and lookups.

use std::sync::Arc;

use canvass_sync::merge::{merge_all, merge_indexed, merge_view, partition_layers, touched_entities};
use canvass_sync::normalize::normalize;
use canvass_sync::queue::PendingWriteQueue;
use canvass_sync::storage::{LocalStore, LocalStoreOptions, MemoryBackend};
use canvass_sync::types::{
    BaseRecord, DynamicOverlay, FieldSource, SurveyOverlay, Table, TimestampedValue,
    DYNAMIC_COLLECTION,
};
use serde_json::{json, Value};

fn store() -> Arc<LocalStore<MemoryBackend>> {
    Arc::new(LocalStore::new(
        MemoryBackend::new(),
        LocalStoreOptions::default(),
    ))
}

fn base(raw: &str, fields: Value) -> BaseRecord {
    BaseRecord {
        entity_id: normalize(raw),
        raw_id: raw.to_string(),
        fields: fields.as_object().cloned().unwrap(),
    }
}

fn survey(raw: &str, fields: Value, at: i64) -> SurveyOverlay {
    SurveyOverlay {
        entity_id: normalize(raw),
        fields: fields.as_object().cloned().unwrap(),
        updated_at: Some(at),
    }
}

fn dynamic(raw: &str, field: &str, value: Value, at: i64) -> DynamicOverlay {
    let mut overlay = DynamicOverlay::new(normalize(raw));
    overlay
        .fields
        .insert(field.to_string(), TimestampedValue::new(value, at));
    overlay
}

#[test]
fn field_precedence_follows_timestamps() {
    let store = store();
    store
        .put(base("A1", json!({ "name": "Asha", "phone": "98-76", "status": "unknown" })))
        .unwrap();
    store
        .put(survey("A1", json!({ "status": "support", "phone": "1111" }), 200))
        .unwrap();
    store.put(dynamic("A1", "status", json!("voted"), 100)).unwrap();

    let view = merge_view(&*store, None, "a1").unwrap().unwrap();
    // Survey at 200 beats dynamic at 100.
    assert_eq!(view.get("status"), Some(&json!("support")));
    assert_eq!(view.source_of("status"), Some(FieldSource::Survey));
    assert_eq!(view.get("name"), Some(&json!("Asha")));
    assert_eq!(view.source_of("name"), Some(FieldSource::Base));
    assert_eq!(view.get("phoneDigits"), Some(&json!("1111")));
    assert_eq!(view.source_of("phoneDigits"), Some(FieldSource::Derived));
    assert_eq!(view.raw_id.as_deref(), Some("A1"));

    store.put(dynamic("A1", "status", json!("voted"), 300)).unwrap();
    let view = merge_view(&*store, None, "A1").unwrap().unwrap();
    assert_eq!(view.get("status"), Some(&json!("voted")));
    assert_eq!(view.source_of("status"), Some(FieldSource::Dynamic));
}

#[test]
fn merging_is_deterministic() {
    let bases = vec![
        base("A1", json!({ "name": "Asha", "gender": "female" })),
        base("B2", json!({ "name": "Bilal", "mobile": "+91 99" })),
    ];
    let surveys = vec![survey("b2", json!({ "leaning": "undecided" }), 50)];
    let dynamics = vec![
        dynamic("a1", "status", json!("voted"), 10),
        dynamic("A 1", "status", json!("absent"), 5),
    ];

    let first = merge_all(&bases, &surveys, &dynamics);
    let second = merge_all(&bases, &surveys, &dynamics);
    assert_eq!(first, second);
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].get("status"), Some(&json!("voted")));
    assert_eq!(first[0].get("gender"), Some(&json!("F")));
    assert_eq!(first[1].get("phoneDigits"), Some(&json!("9199")));
    assert_eq!(first[1].get("leaning"), Some(&json!("undecided")));

    // Inputs are untouched.
    assert_eq!(bases[0].fields["gender"], json!("female"));
}

#[test]
fn queued_write_shows_as_pending_until_acknowledged() {
    let store = store();
    let queue = PendingWriteQueue::new(store.clone());
    store.put(base("A1", json!({ "name": "Asha" }))).unwrap();
    store.put(dynamic("A1", "status", json!("voted"), 100)).unwrap();
    let local_id = queue
        .enqueue(
            DYNAMIC_COLLECTION,
            &normalize("A1"),
            json!({ "fields": { "status": { "value": "voted", "updatedAt": 100 } } }),
        )
        .unwrap();

    let view = merge_view(&*store, Some(&queue), "A1").unwrap().unwrap();
    assert_eq!(view.source_of("status"), Some(FieldSource::Pending));

    assert!(queue.remove(local_id).unwrap());
    let view = merge_view(&*store, Some(&queue), "A1").unwrap().unwrap();
    assert_eq!(view.source_of("status"), Some(FieldSource::Dynamic));
}

#[test]
fn stale_queued_write_never_hides_newer_local_value() {
    let store = store();
    let queue = PendingWriteQueue::new(store.clone());
    store.put(base("A1", json!({}))).unwrap();
    store.put(dynamic("A1", "status", json!("voted"), 100)).unwrap();
    queue
        .enqueue(
            DYNAMIC_COLLECTION,
            &normalize("A1"),
            json!({ "fields": { "status": { "value": "absent", "updatedAt": 50 } } }),
        )
        .unwrap();

    let view = merge_view(&*store, Some(&queue), "A1").unwrap().unwrap();
    assert_eq!(view.get("status"), Some(&json!("voted")));
    assert_eq!(view.source_of("status"), Some(FieldSource::Dynamic));
}

#[test]
fn precinct_lookup_merges_each_voter() {
    let store = store();
    store.put(base("A1", json!({ "precinct": 7, "name": "Asha" }))).unwrap();
    store.put(base("B2", json!({ "precinct": 7, "name": "Bilal" }))).unwrap();
    store.put(base("C3", json!({ "precinct": 8, "name": "Chitra" }))).unwrap();
    store.put(dynamic("B2", "status", json!("voted"), 1)).unwrap();

    let views = merge_indexed(&*store, None, "precinct", &json!(7)).unwrap();
    let names: Vec<&Value> = views.iter().filter_map(|v| v.get("name")).collect();
    assert_eq!(names, vec![&json!("Asha"), &json!("Bilal")]);
    assert_eq!(views[1].get("status"), Some(&json!("voted")));
}

#[test]
fn touched_entities_include_overlay_only_records() {
    let store = store();
    let queue = PendingWriteQueue::new(store.clone());
    store.put(base("A1", json!({ "name": "Asha" }))).unwrap();
    store.put(base("B2", json!({ "name": "Bilal" }))).unwrap();
    store.put(dynamic("B2", "status", json!("voted"), 1)).unwrap();
    store.put(survey("Z9", json!({ "note": "new voter" }), 1)).unwrap();
    queue
        .enqueue(
            DYNAMIC_COLLECTION,
            &normalize("C3"),
            json!({ "fields": { "status": { "value": "absent", "updatedAt": 2 } } }),
        )
        .unwrap();

    let views = touched_entities(&*store, Some(&queue)).unwrap();
    let ids: Vec<&str> = views.iter().map(|v| v.entity_id.as_str()).collect();
    assert_eq!(ids, vec!["B2", "C3", "Z9"]);
    assert!(views[0].has_base);
    assert!(!views[2].has_base);
    assert_eq!(views[1].source_of("status"), Some(FieldSource::Pending));
}

#[test]
fn scanned_layers_merge_like_the_store_view() {
    let store = store();
    store.put(base("A1", json!({ "name": "Asha" }))).unwrap();
    store.put(survey("A1", json!({ "leaning": "lean" }), 3)).unwrap();
    store.put(dynamic("A1", "status", json!("voted"), 4)).unwrap();

    let mut records = Vec::new();
    for table in [Table::Base, Table::Survey, Table::Dynamic] {
        records.extend(store.scan_all(table).unwrap());
    }
    let (bases, surveys, dynamics) = partition_layers(records);
    let all = merge_all(&bases, &surveys, &dynamics);

    let single = merge_view(&*store, None, "A1").unwrap().unwrap();
    assert_eq!(all, vec![single]);
}
