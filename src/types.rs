use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// Identity
// ============================================================================

/// Canonical identity key of a voter entity.
///
/// Only produced by [`crate::normalize::key::normalize`], so two values that
/// compare equal were derived by the same rule regardless of which layer the
/// raw identifier came from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub(crate) fn from_normalized(key: String) -> Self {
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Tables & remote collections
// ============================================================================

/// Remote collection holding the bulk-imported dataset (written by import only).
pub const VOTERS_COLLECTION: &str = "voters";
/// Remote collection holding survey overlays, keyed by entity id.
pub const SURVEYS_COLLECTION: &str = "voter_surveys";
/// Remote collection holding dynamic overlays, keyed by entity id.
pub const DYNAMIC_COLLECTION: &str = "voters_dynamic";

/// The three logical tables of the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Base,
    #[serde(rename = "overlay_survey")]
    Survey,
    #[serde(rename = "overlay_dynamic")]
    Dynamic,
}

impl Table {
    pub const ALL: [Table; 3] = [Table::Base, Table::Survey, Table::Dynamic];

    /// Name used for the table inside the local store.
    pub fn name(self) -> &'static str {
        match self {
            Table::Base => "base",
            Table::Survey => "overlay_survey",
            Table::Dynamic => "overlay_dynamic",
        }
    }

    pub fn from_name(name: &str) -> Option<Table> {
        Table::ALL.into_iter().find(|t| t.name() == name)
    }

    /// Remote collection the table mirrors.
    pub fn remote_collection(self) -> &'static str {
        match self {
            Table::Base => VOTERS_COLLECTION,
            Table::Survey => SURVEYS_COLLECTION,
            Table::Dynamic => DYNAMIC_COLLECTION,
        }
    }

    /// JSON path of a user-visible field inside a stored row's `data`.
    ///
    /// Dynamic fields are wrapped in a `{ value, updatedAt }` cell, so the
    /// indexable value sits one level deeper.
    pub fn field_path(self, field: &str) -> String {
        match self {
            Table::Base | Table::Survey => format!("$.fields.{field}"),
            Table::Dynamic => format!("$.fields.{field}.value"),
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Layer records
// ============================================================================

/// Snapshot of an entity's bulk-loaded attributes. Replaced wholesale by a
/// fresh import, never field-patched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseRecord {
    pub entity_id: EntityId,
    /// Identifier exactly as it appeared in the import source.
    pub raw_id: String,
    pub fields: Map<String, Value>,
}

/// Form-collected attributes. Each save replaces the previous version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurveyOverlay {
    pub entity_id: EntityId,
    pub fields: Map<String, Value>,
    /// Save time in epoch millis; applies to every field of the overlay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

/// A single dynamic field with its own precedence timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimestampedValue {
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

impl TimestampedValue {
    pub fn new(value: Value, updated_at: i64) -> Self {
        Self {
            value,
            updated_at: Some(updated_at),
        }
    }

    /// Whether `self` should replace `current` under the timestamp rule.
    ///
    /// A missing timestamp on either side means the incoming write wins
    /// (plain layer/arrival order); equal timestamps also favour the incoming
    /// write.
    pub fn supersedes(&self, current: &TimestampedValue) -> bool {
        match (self.updated_at, current.updated_at) {
            (Some(incoming), Some(existing)) => incoming >= existing,
            _ => true,
        }
    }
}

/// High-churn fields patched one at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicOverlay {
    pub entity_id: EntityId,
    pub fields: BTreeMap<String, TimestampedValue>,
}

impl DynamicOverlay {
    pub fn new(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            fields: BTreeMap::new(),
        }
    }
}

/// Tagged union over the three layers.
#[derive(Debug, Clone, PartialEq)]
pub enum LayerRecord {
    Base(BaseRecord),
    Survey(SurveyOverlay),
    Dynamic(DynamicOverlay),
}

impl LayerRecord {
    pub fn table(&self) -> Table {
        match self {
            LayerRecord::Base(_) => Table::Base,
            LayerRecord::Survey(_) => Table::Survey,
            LayerRecord::Dynamic(_) => Table::Dynamic,
        }
    }

    pub fn entity_id(&self) -> &EntityId {
        match self {
            LayerRecord::Base(r) => &r.entity_id,
            LayerRecord::Survey(r) => &r.entity_id,
            LayerRecord::Dynamic(r) => &r.entity_id,
        }
    }

    pub fn into_base(self) -> Option<BaseRecord> {
        match self {
            LayerRecord::Base(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_survey(self) -> Option<SurveyOverlay> {
        match self {
            LayerRecord::Survey(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_dynamic(self) -> Option<DynamicOverlay> {
        match self {
            LayerRecord::Dynamic(r) => Some(r),
            _ => None,
        }
    }
}

impl From<BaseRecord> for LayerRecord {
    fn from(r: BaseRecord) -> Self {
        LayerRecord::Base(r)
    }
}

impl From<SurveyOverlay> for LayerRecord {
    fn from(r: SurveyOverlay) -> Self {
        LayerRecord::Survey(r)
    }
}

impl From<DynamicOverlay> for LayerRecord {
    fn from(r: DynamicOverlay) -> Self {
        LayerRecord::Dynamic(r)
    }
}

// ============================================================================
// Stored rows
// ============================================================================

/// Row shape kept by a storage backend. `data` is the serialized layer record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    pub table: Table,
    pub id: String,
    pub data: Value,
}

impl StoredRow {
    pub fn from_record(record: &LayerRecord) -> serde_json::Result<Self> {
        let data = match record {
            LayerRecord::Base(r) => serde_json::to_value(r)?,
            LayerRecord::Survey(r) => serde_json::to_value(r)?,
            LayerRecord::Dynamic(r) => serde_json::to_value(r)?,
        };
        Ok(Self {
            table: record.table(),
            id: record.entity_id().as_str().to_string(),
            data,
        })
    }

    pub fn into_record(self) -> serde_json::Result<LayerRecord> {
        Ok(match self.table {
            Table::Base => LayerRecord::Base(serde_json::from_value(self.data)?),
            Table::Survey => LayerRecord::Survey(serde_json::from_value(self.data)?),
            Table::Dynamic => LayerRecord::Dynamic(serde_json::from_value(self.data)?),
        })
    }
}

// ============================================================================
// Pending writes
// ============================================================================

/// Local identifier of a queued write.
pub type EntryId = i64;

/// A write that has not yet been acknowledged by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingWriteEntry {
    pub local_id: EntryId,
    pub target_collection: String,
    pub entity_id: EntityId,
    pub payload: Value,
    /// Enqueue time in epoch millis.
    pub created_at: i64,
    pub attempts: u32,
}

// ============================================================================
// Merged view
// ============================================================================

/// Where a merged field's value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSource {
    Base,
    Survey,
    Dynamic,
    /// A queued write that the remote has not acknowledged yet.
    Pending,
    /// Recomputed from other fields after merging.
    Derived,
}

/// Read-side view of one entity. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedView {
    pub entity_id: EntityId,
    /// Identifier as it appeared in the base source, before normalization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_id: Option<String>,
    pub fields: Map<String, Value>,
    pub sources: BTreeMap<String, FieldSource>,
    /// False when the entity only exists in the overlays.
    pub has_base: bool,
}

impl MergedView {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn source_of(&self, field: &str) -> Option<FieldSource> {
        self.sources.get(field).copied()
    }
}

// ============================================================================
// Bulk write report
// ============================================================================

/// Outcome of a chunked bulk write. Chunks counted in `committed` stay
/// durable even when `error` is set or the run was cancelled.
#[derive(Debug, Default)]
pub struct BulkPutReport {
    pub committed: usize,
    pub chunks: usize,
    pub cancelled: bool,
    pub error: Option<crate::error::StorageError>,
}

impl BulkPutReport {
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.error.is_none()
    }
}
