//! Bulk import of base records from a JSON source.
//!
//! Sources name the same attribute many ways (`Part No`, `booth`, `precinct`)
//! and sometimes lack an identifier altogether. Each raw object is mapped onto
//! canonical field names and keyed by its normalized identifier; records with
//! no usable identifier get a synthetic key.

use std::collections::HashMap;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{ImportError, Result, StorageError},
    normalize::{derived_synthetic_key, is_synthetic, normalize, RawIdentifier},
    storage::{LocalStore, StorageBackend},
    types::{BaseRecord, EntityId, LayerRecord, Table},
};

/// Meta key holding the epoch-millis time of the last complete import.
pub const LAST_IMPORT_META_KEY: &str = "base.last_import_at";

/// Source keys (compacted) that carry the record identifier, in priority order.
const IDENTITY_KEYS: [&str; 7] = [
    "id",
    "voterid",
    "epic",
    "epicno",
    "epicnumber",
    "voteridno",
    "cardno",
];

#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Import even when the base table already has records.
    pub force: bool,
}

/// Raw identifiers in one import that normalized to the same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityCollision {
    pub entity_id: EntityId,
    /// The raw id that was kept
    pub kept: String,
    /// Raw ids of later records that were dropped in its favour
    pub dropped: Vec<String>,
}

#[derive(Debug, Default)]
pub struct ImportReport {
    /// Base records written
    pub imported: usize,
    /// The base table was already populated and `force` was not set
    pub skipped: bool,
    /// Records that received a synthetic key
    pub synthetic: usize,
    /// Source entries that were not JSON objects
    pub rejected: usize,
    pub collisions: Vec<IdentityCollision>,
    pub cancelled: bool,
    /// Local storage failure that ended the import early
    pub error: Option<StorageError>,
}

impl ImportReport {
    pub fn is_complete(&self) -> bool {
        !self.skipped && !self.cancelled && self.error.is_none()
    }
}

// ============================================================================
// Entry points
// ============================================================================

/// Parse `source` and import it. See `import_values`.
pub async fn import_json<B: StorageBackend>(
    store: &LocalStore<B>,
    source: &str,
    options: &ImportOptions,
    cancel: &CancellationToken,
) -> Result<ImportReport> {
    let records = parse_source(source)?;
    import_values(store, records, options, cancel).await
}

/// Accept a bare array, or an object wrapping one under `voters`, `records`
/// or `data`.
pub fn parse_source(source: &str) -> Result<Vec<Value>, ImportError> {
    match serde_json::from_str::<Value>(source)? {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => ["voters", "records", "data"]
            .iter()
            .find_map(|key| match map.remove(*key) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            })
            .ok_or_else(|| ImportError::NotAnArray("an object".to_string())),
        other => Err(ImportError::NotAnArray(json_kind(&other).to_string())),
    }
}

/// Write raw source objects into the base table.
///
/// Does nothing once a complete import has been recorded unless
/// `options.force` is set. An import that stopped early (cancelled, or out of
/// local space) is not recorded, so running it again resumes it: writes go
/// through `LocalStore::bulk_put` as upserts and keys are stable across runs.
/// Chunks committed before a stop are kept.
pub async fn import_values<B: StorageBackend>(
    store: &LocalStore<B>,
    records: Vec<Value>,
    options: &ImportOptions,
    cancel: &CancellationToken,
) -> Result<ImportReport> {
    let mut report = ImportReport::default();

    if !options.force {
        if let Some(completed_at) = last_import_at(store)? {
            tracing::debug!(completed_at, "base import already complete; skipped");
            report.skipped = true;
            return Ok(report);
        }
    }

    let mut kept: HashMap<EntityId, usize> = HashMap::new();
    let mut bases: Vec<BaseRecord> = Vec::with_capacity(records.len());
    let mut collisions: Vec<IdentityCollision> = Vec::new();
    let mut collision_index: HashMap<EntityId, usize> = HashMap::new();

    for (index, raw) in records.iter().enumerate() {
        let Some(object) = raw.as_object() else {
            report.rejected += 1;
            continue;
        };
        let base = to_base_record(object, index);
        if is_synthetic(&base.entity_id) {
            report.synthetic += 1;
        }

        if let Some(&first) = kept.get(&base.entity_id) {
            let slot = *collision_index
                .entry(base.entity_id.clone())
                .or_insert_with(|| {
                    collisions.push(IdentityCollision {
                        entity_id: base.entity_id.clone(),
                        kept: bases[first].raw_id.clone(),
                        dropped: Vec::new(),
                    });
                    collisions.len() - 1
                });
            collisions[slot].dropped.push(base.raw_id);
            continue;
        }
        kept.insert(base.entity_id.clone(), bases.len());
        bases.push(base);
    }

    if report.synthetic > 0 {
        tracing::warn!(
            count = report.synthetic,
            "records without an identifier were given synthetic keys"
        );
    }
    for collision in &collisions {
        tracing::warn!(
            entity_id = %collision.entity_id,
            kept = %collision.kept,
            dropped = ?collision.dropped,
            "distinct raw identifiers normalized to one key"
        );
    }
    report.collisions = collisions;

    let rows = bases.into_iter().map(LayerRecord::Base).collect();
    let written = store.bulk_put(Table::Base, rows, cancel).await?;
    report.imported = written.committed;
    report.cancelled = written.cancelled;
    report.error = written.error;

    if report.is_complete() {
        let now = chrono::Utc::now().timestamp_millis().to_string();
        store.backend().set_meta(LAST_IMPORT_META_KEY, &now)?;
    }

    tracing::info!(
        imported = report.imported,
        rejected = report.rejected,
        cancelled = report.cancelled,
        "base import finished"
    );
    Ok(report)
}

/// Epoch millis of the last complete import, if any.
pub fn last_import_at<B: StorageBackend>(store: &LocalStore<B>) -> Result<Option<i64>> {
    Ok(store
        .backend()
        .get_meta(LAST_IMPORT_META_KEY)?
        .and_then(|v| v.parse().ok()))
}

// ============================================================================
// Field mapping
// ============================================================================

/// Map one source object onto a base record with canonical field names.
///
/// `source_index` is the object's position in the source. Together with the
/// object's contents it seeds the synthetic key of a record without an
/// identifier, so importing the same source twice yields the same keys.
pub fn to_base_record(object: &Map<String, Value>, source_index: usize) -> BaseRecord {
    let (entity_id, raw_id) = identity_of(object, source_index);

    let mut fields = Map::new();
    for (key, value) in object {
        let compact = compact_key(key);
        if IDENTITY_KEYS.contains(&compact.as_str()) {
            continue;
        }
        let name = canonical_field(&compact).map_or_else(|| key.clone(), str::to_string);
        let value = coerce(&name, value);
        match fields.get(&name) {
            Some(existing) if !existing.is_null() => {}
            _ => {
                fields.insert(name, value);
            }
        }
    }

    BaseRecord {
        entity_id,
        raw_id,
        fields,
    }
}

/// First identity field that normalizes to a real key; otherwise a derived
/// synthetic key with an empty raw id.
fn identity_of(object: &Map<String, Value>, source_index: usize) -> (EntityId, String) {
    let mut candidates: Vec<(usize, &Value)> = object
        .iter()
        .filter_map(|(key, value)| {
            let compact = compact_key(key);
            IDENTITY_KEYS
                .iter()
                .position(|k| *k == compact)
                .map(|rank| (rank, value))
        })
        .collect();
    candidates.sort_by_key(|(rank, _)| *rank);

    for (_, value) in candidates {
        let raw = RawIdentifier::from(value);
        if raw.as_str().trim().is_empty() {
            continue;
        }
        return (normalize(raw.clone()), raw.as_str().to_string());
    }
    // serde_json maps iterate in key order, so this text is canonical.
    let seed = format!("{source_index}:{}", Value::Object(object.clone()));
    (derived_synthetic_key(seed.as_bytes()), String::new())
}

fn compact_key(key: &str) -> String {
    key.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn canonical_field(compact: &str) -> Option<&'static str> {
    let name = match compact {
        "name" | "fullname" | "votername" => "name",
        "age" => "age",
        "gender" | "sex" => "gender",
        "precinct" | "partno" | "part" | "partnumber" | "booth" | "boothno" | "pollingstation" => {
            "precinct"
        }
        "address" | "addr" | "houseaddress" => "address",
        "phone" | "phoneno" | "phonenumber" => "phone",
        "mobile" | "mobileno" | "mobilenumber" => "mobile",
        "relativename" | "fathername" | "husbandname" | "guardianname" => "relativeName",
        "houseno" | "housenumber" => "houseNo",
        "serialno" | "slno" | "serial" => "serialNo",
        _ => return None,
    };
    Some(name)
}

/// Numeric fields arrive as text in some sources. Indexed lookups compare
/// JSON values exactly, so integral text is stored as a number.
fn coerce(field: &str, value: &Value) -> Value {
    if !matches!(field, "age" | "precinct" | "serialNo") {
        return value.clone();
    }
    match value {
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| value.clone()),
        _ => value.clone(),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
