//! Canonical entity keys.
//!
//! `normalize` trims, uppercases and strips every whitespace character from
//! a raw identifier. It never fails: an identifier that is empty after
//! normalization gets a synthetic key so the record stays addressable.
//!
//! Raw identifiers that differ only by case or whitespace collapse onto the
//! same key. Whether that is deduplication or a collision between distinct
//! people is not decided here; callers that care can compare `raw_id`.

use serde_json::Value;

use crate::types::EntityId;

/// Prefix of keys synthesized for records without a usable identifier.
pub const SYNTHETIC_PREFIX: &str = "SYN-";

/// A raw identifier coerced to text before normalization.
///
/// Conversions mirror loose string coercion: null/`None` become the empty
/// string, numbers their decimal text, integral floats drop the fraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawIdentifier(String);

impl RawIdentifier {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RawIdentifier {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RawIdentifier {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&String> for RawIdentifier {
    fn from(s: &String) -> Self {
        Self(s.clone())
    }
}

impl From<&EntityId> for RawIdentifier {
    fn from(id: &EntityId) -> Self {
        Self(id.as_str().to_string())
    }
}

impl From<EntityId> for RawIdentifier {
    fn from(id: EntityId) -> Self {
        Self(id.into_string())
    }
}

macro_rules! raw_from_integer {
    ($($t:ty),*) => {
        $(
            impl From<$t> for RawIdentifier {
                fn from(n: $t) -> Self {
                    Self(n.to_string())
                }
            }
        )*
    };
}

raw_from_integer!(i32, i64, u32, u64, usize);

impl From<f64> for RawIdentifier {
    fn from(n: f64) -> Self {
        Self(float_text(n))
    }
}

impl<T: Into<RawIdentifier>> From<Option<T>> for RawIdentifier {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or_else(|| Self(String::new()))
    }
}

impl From<&Value> for RawIdentifier {
    fn from(v: &Value) -> Self {
        Self(match v {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => match n.as_i64() {
                Some(i) => i.to_string(),
                None => match n.as_u64() {
                    Some(u) => u.to_string(),
                    None => float_text(n.as_f64().unwrap_or(0.0)),
                },
            },
            other => other.to_string(),
        })
    }
}

impl From<Value> for RawIdentifier {
    fn from(v: Value) -> Self {
        RawIdentifier::from(&v)
    }
}

fn float_text(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{n:.0}")
    } else {
        n.to_string()
    }
}

/// Derive the canonical key for a raw identifier.
pub fn normalize(raw: impl Into<RawIdentifier>) -> EntityId {
    let raw = raw.into();
    let key: String = raw
        .as_str()
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect();

    if key.is_empty() {
        return synthetic_key();
    }
    EntityId::from_normalized(key)
}

/// Whether the key was synthesized for a record with no identifier.
pub fn is_synthetic(id: &EntityId) -> bool {
    id.as_str().starts_with(SYNTHETIC_PREFIX)
}

/// A synthetic key derived from `seed`. The same seed always yields the same
/// key, so re-importing an id-less record overwrites its earlier copy.
pub fn derived_synthetic_key(seed: &[u8]) -> EntityId {
    synthetic_from(uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, seed))
}

fn synthetic_key() -> EntityId {
    synthetic_from(uuid::Uuid::new_v4())
}

fn synthetic_from(uuid: uuid::Uuid) -> EntityId {
    let hex = uuid.simple().to_string().to_uppercase();
    EntityId::from_normalized(format!("{SYNTHETIC_PREFIX}{hex}"))
}
