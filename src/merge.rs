//! Layered merge: base → survey → dynamic, with field-level timestamps.
//!
//! Later layers win field by field. When a field is set in both overlays and
//! both carry timestamps, the later timestamp wins instead, with ties going to
//! the dynamic layer. Unacknowledged pending writes are folded in under the
//! same rule, so a stale queued write never hides a newer local value.
//!
//! All functions here are pure over their inputs: records are cloned into a
//! fresh `MergedView` and nothing is cached.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::{
    error::Result,
    normalize::{fields::derive_fields, normalize, RawIdentifier},
    queue::PendingWriteQueue,
    storage::{LocalStore, StorageBackend},
    types::{
        BaseRecord, DynamicOverlay, EntityId, FieldSource, LayerRecord, MergedView,
        PendingWriteEntry, SurveyOverlay, Table, TimestampedValue, DYNAMIC_COLLECTION,
        SURVEYS_COLLECTION,
    },
};

// ============================================================================
// Pure merge
// ============================================================================

/// Merge one entity's layers. Returns `None` when every layer is absent.
pub fn merge_layers(
    base: Option<&BaseRecord>,
    survey: Option<&SurveyOverlay>,
    dynamic: Option<&DynamicOverlay>,
) -> Option<MergedView> {
    let entity_id = base
        .map(|r| &r.entity_id)
        .or(survey.map(|r| &r.entity_id))
        .or(dynamic.map(|r| &r.entity_id))
        .map(normalize)?;
    Some(merge_inner(
        entity_id,
        base,
        survey,
        dynamic,
        &BTreeSet::new(),
    ))
}

/// Merge whole collections, one view per base record.
///
/// Overlays are joined on the normalized key; overlays with no matching base
/// record are left out. Base records whose keys collide each get their own
/// view, distinguishable by `raw_id`.
pub fn merge_all(
    bases: &[BaseRecord],
    surveys: &[SurveyOverlay],
    dynamics: &[DynamicOverlay],
) -> Vec<MergedView> {
    let surveys = index_surveys(surveys);
    let dynamics = index_dynamics(dynamics);

    bases
        .iter()
        .map(|base| {
            let id = normalize(&base.entity_id);
            let survey = surveys.get(&id).copied();
            let dynamic = dynamics.get(&id);
            merge_inner(id, Some(base), survey, dynamic, &BTreeSet::new())
        })
        .collect()
}

/// Surveys by key. On collision the later `updated_at` wins, then input order.
fn index_surveys(surveys: &[SurveyOverlay]) -> HashMap<EntityId, &SurveyOverlay> {
    let mut index: HashMap<EntityId, &SurveyOverlay> = HashMap::new();
    for survey in surveys {
        let id = normalize(&survey.entity_id);
        match index.get(&id) {
            Some(current) if !survey_supersedes(survey.updated_at, current.updated_at) => {}
            _ => {
                index.insert(id, survey);
            }
        }
    }
    index
}

/// Dynamic overlays by key. Colliding overlays are combined field by field.
fn index_dynamics(dynamics: &[DynamicOverlay]) -> HashMap<EntityId, DynamicOverlay> {
    let mut index: HashMap<EntityId, DynamicOverlay> = HashMap::new();
    for dynamic in dynamics {
        let id = normalize(&dynamic.entity_id);
        let combined = index
            .entry(id.clone())
            .or_insert_with(|| DynamicOverlay::new(id));
        for (field, cell) in &dynamic.fields {
            apply_cell(&mut combined.fields, field, cell);
        }
    }
    index
}

fn survey_supersedes(incoming: Option<i64>, current: Option<i64>) -> bool {
    match (incoming, current) {
        (Some(incoming), Some(current)) => incoming >= current,
        _ => true,
    }
}

/// Write `cell` into `fields` if it supersedes what is there. Returns whether
/// it was written.
fn apply_cell(
    fields: &mut BTreeMap<String, TimestampedValue>,
    field: &str,
    cell: &TimestampedValue,
) -> bool {
    match fields.get(field) {
        Some(existing) if !cell.supersedes(existing) => false,
        _ => {
            fields.insert(field.to_string(), cell.clone());
            true
        }
    }
}

fn merge_inner(
    entity_id: EntityId,
    base: Option<&BaseRecord>,
    survey: Option<&SurveyOverlay>,
    dynamic: Option<&DynamicOverlay>,
    pending: &BTreeSet<(Table, String)>,
) -> MergedView {
    let mut fields = Map::new();
    let mut sources = BTreeMap::new();

    if let Some(base) = base {
        for (name, value) in &base.fields {
            fields.insert(name.clone(), value.clone());
            sources.insert(name.clone(), FieldSource::Base);
        }
    }

    if let Some(survey) = survey {
        for (name, value) in &survey.fields {
            fields.insert(name.clone(), value.clone());
            sources.insert(name.clone(), layer_source(Table::Survey, name, pending));
        }
    }

    if let Some(dynamic) = dynamic {
        for (name, cell) in &dynamic.fields {
            let survey_stamp = survey
                .filter(|s| s.fields.contains_key(name))
                .and_then(|s| s.updated_at);
            let survey_is_newer = matches!(
                (survey_stamp, cell.updated_at),
                (Some(s), Some(d)) if s > d
            );
            if survey_is_newer {
                continue;
            }
            fields.insert(name.clone(), cell.value.clone());
            sources.insert(name.clone(), layer_source(Table::Dynamic, name, pending));
        }
    }

    for name in derive_fields(&entity_id, &mut fields) {
        sources.insert(name, FieldSource::Derived);
    }
    sources.retain(|name, _| fields.contains_key(name));

    MergedView {
        entity_id,
        raw_id: base.map(|b| b.raw_id.clone()),
        fields,
        sources,
        has_base: base.is_some(),
    }
}

fn layer_source(table: Table, field: &str, pending: &BTreeSet<(Table, String)>) -> FieldSource {
    if pending.contains(&(table, field.to_string())) {
        return FieldSource::Pending;
    }
    match table {
        Table::Base => FieldSource::Base,
        Table::Survey => FieldSource::Survey,
        Table::Dynamic => FieldSource::Dynamic,
    }
}

// ============================================================================
// Pending fold-in
// ============================================================================

#[derive(Deserialize)]
struct PendingDynamicPayload {
    #[serde(default)]
    fields: BTreeMap<String, TimestampedValue>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingSurveyPayload {
    #[serde(default)]
    fields: Map<String, Value>,
    #[serde(default)]
    updated_at: Option<i64>,
}

/// Overlays with queued writes applied, plus the fields those writes decided.
struct FoldedOverlays {
    survey: Option<SurveyOverlay>,
    dynamic: Option<DynamicOverlay>,
    pending: BTreeSet<(Table, String)>,
}

fn fold_pending(
    entity_id: &EntityId,
    mut survey: Option<SurveyOverlay>,
    mut dynamic: Option<DynamicOverlay>,
    entries: &[PendingWriteEntry],
) -> FoldedOverlays {
    let mut pending = BTreeSet::new();

    for entry in entries.iter().filter(|e| &e.entity_id == entity_id) {
        match entry.target_collection.as_str() {
            DYNAMIC_COLLECTION => {
                let Ok(payload) =
                    serde_json::from_value::<PendingDynamicPayload>(entry.payload.clone())
                else {
                    tracing::debug!(local_id = entry.local_id, "unreadable pending dynamic payload");
                    continue;
                };
                let overlay = dynamic.get_or_insert_with(|| DynamicOverlay::new(entity_id.clone()));
                for (field, cell) in &payload.fields {
                    if apply_cell(&mut overlay.fields, field, cell) {
                        pending.insert((Table::Dynamic, field.clone()));
                    }
                }
            }
            SURVEYS_COLLECTION => {
                let Ok(payload) =
                    serde_json::from_value::<PendingSurveyPayload>(entry.payload.clone())
                else {
                    tracing::debug!(local_id = entry.local_id, "unreadable pending survey payload");
                    continue;
                };
                let current = survey.as_ref().and_then(|s| s.updated_at);
                if survey.is_some() && !survey_supersedes(payload.updated_at, current) {
                    continue;
                }
                pending.retain(|(table, _)| *table != Table::Survey);
                pending.extend(payload.fields.keys().map(|f| (Table::Survey, f.clone())));
                survey = Some(SurveyOverlay {
                    entity_id: entity_id.clone(),
                    fields: payload.fields,
                    updated_at: payload.updated_at,
                });
            }
            _ => {}
        }
    }

    FoldedOverlays {
        survey,
        dynamic,
        pending,
    }
}

// ============================================================================
// Store-backed views
// ============================================================================

/// The merged view of one entity straight from the local store.
///
/// Unlike `merge_all`, an entity known only to the overlays still yields a
/// view (with `has_base == false`).
pub fn merge_view<B: StorageBackend>(
    store: &LocalStore<B>,
    pending: Option<&PendingWriteQueue<B>>,
    raw_id: impl Into<RawIdentifier>,
) -> Result<Option<MergedView>> {
    let id = normalize(raw_id);
    let entries = match pending {
        Some(queue) => queue.pending_for(&id)?,
        None => Vec::new(),
    };
    view_for(store, id, &entries)
}

/// Merged views of base records whose indexed field equals `value`, such as
/// every voter in one precinct.
pub fn merge_indexed<B: StorageBackend>(
    store: &LocalStore<B>,
    pending: Option<&PendingWriteQueue<B>>,
    index_name: &str,
    value: &Value,
) -> Result<Vec<MergedView>> {
    let entries = list_pending(pending)?;
    let mut views = Vec::new();
    for record in store.scan_by_index(Table::Base, index_name, value)? {
        let id = normalize(record.entity_id());
        let Some(base) = record.into_base() else {
            continue;
        };
        let folded = fold_pending(
            &id,
            store.get_survey(&id)?,
            store.get_dynamic(&id)?,
            &entries,
        );
        views.push(merge_inner(
            id,
            Some(&base),
            folded.survey.as_ref(),
            folded.dynamic.as_ref(),
            &folded.pending,
        ));
    }
    Ok(views)
}

/// Every entity carrying a survey or dynamic overlay (or a queued write for
/// one), merged with its base record when there is one. Ordered by key.
pub fn touched_entities<B: StorageBackend>(
    store: &LocalStore<B>,
    pending: Option<&PendingWriteQueue<B>>,
) -> Result<Vec<MergedView>> {
    let entries = list_pending(pending)?;

    let mut ids: BTreeSet<EntityId> = BTreeSet::new();
    for table in [Table::Survey, Table::Dynamic] {
        ids.extend(
            store
                .scan_all(table)?
                .iter()
                .map(|r| normalize(r.entity_id())),
        );
    }
    ids.extend(entries.iter().map(|e| e.entity_id.clone()));

    let mut views = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(view) = view_for(store, id, &entries)? {
            views.push(view);
        }
    }
    Ok(views)
}

fn list_pending<B: StorageBackend>(
    pending: Option<&PendingWriteQueue<B>>,
) -> Result<Vec<PendingWriteEntry>> {
    match pending {
        Some(queue) => queue.list_all(),
        None => Ok(Vec::new()),
    }
}

fn view_for<B: StorageBackend>(
    store: &LocalStore<B>,
    id: EntityId,
    entries: &[PendingWriteEntry],
) -> Result<Option<MergedView>> {
    let base = store.get_base(&id)?;
    let folded = fold_pending(&id, store.get_survey(&id)?, store.get_dynamic(&id)?, entries);
    if base.is_none() && folded.survey.is_none() && folded.dynamic.is_none() {
        return Ok(None);
    }
    Ok(Some(merge_inner(
        id,
        base.as_ref(),
        folded.survey.as_ref(),
        folded.dynamic.as_ref(),
        &folded.pending,
    )))
}

/// Split scanned records back into their typed layers.
pub fn partition_layers(
    records: Vec<LayerRecord>,
) -> (Vec<BaseRecord>, Vec<SurveyOverlay>, Vec<DynamicOverlay>) {
    let mut bases = Vec::new();
    let mut surveys = Vec::new();
    let mut dynamics = Vec::new();
    for record in records {
        match record {
            LayerRecord::Base(r) => bases.push(r),
            LayerRecord::Survey(r) => surveys.push(r),
            LayerRecord::Dynamic(r) => dynamics.push(r),
        }
    }
    (bases, surveys, dynamics)
}
