//! Derived, searchable fields recomputed on every merge.
//!
//! The layers may encode the same attribute differently (a phone number with
//! dashes in the import, bare digits in a survey). These helpers give the
//! merged view one encoding.

use serde_json::{Map, Value};

use crate::types::EntityId;

/// Field names whose digits feed `phoneDigits`, in priority order.
pub const PHONE_FIELDS: [&str; 3] = ["phone", "mobile", "contact"];

pub const PHONE_DIGITS_FIELD: &str = "phoneDigits";
pub const GENDER_FIELD: &str = "gender";
pub const NAME_FIELD: &str = "name";
pub const NAME_KEY_FIELD: &str = "nameKey";
pub const ENTITY_ID_FIELD: &str = "entityId";

/// Keep only ASCII digits. Returns `None` when nothing is left.
pub fn digits_only(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    (!digits.is_empty()).then_some(digits)
}

/// Map free-form gender labels onto `M`, `F` or `O`.
///
/// Unrecognized labels return `None`; callers keep the original value.
pub fn canonical_gender(raw: &str) -> Option<&'static str> {
    match raw.trim().to_lowercase().as_str() {
        "m" | "male" | "man" | "boy" => Some("M"),
        "f" | "female" | "woman" | "girl" => Some("F"),
        "o" | "other" | "x" | "tg" | "third gender" | "transgender" => Some("O"),
        _ => None,
    }
}

/// Uppercased name with runs of whitespace collapsed to one space.
pub fn name_key(raw: &str) -> Option<String> {
    let key = raw
        .split_whitespace()
        .map(str::to_uppercase)
        .collect::<Vec<_>>()
        .join(" ");
    (!key.is_empty()).then_some(key)
}

/// Recompute derived fields in place and report which ones were written.
pub fn derive_fields(entity_id: &EntityId, fields: &mut Map<String, Value>) -> Vec<String> {
    let mut written = Vec::new();

    fields.insert(
        ENTITY_ID_FIELD.to_string(),
        Value::String(entity_id.as_str().to_string()),
    );
    written.push(ENTITY_ID_FIELD.to_string());

    let phone = PHONE_FIELDS
        .iter()
        .filter_map(|f| fields.get(*f))
        .find_map(|v| digits_only(&text_of(v)));
    match phone {
        Some(digits) => {
            fields.insert(PHONE_DIGITS_FIELD.to_string(), Value::String(digits));
            written.push(PHONE_DIGITS_FIELD.to_string());
        }
        None => {
            fields.remove(PHONE_DIGITS_FIELD);
        }
    }

    let gender = fields
        .get(GENDER_FIELD)
        .and_then(Value::as_str)
        .and_then(|label| canonical_gender(label).filter(|c| *c != label));
    if let Some(canonical) = gender {
        fields.insert(GENDER_FIELD.to_string(), Value::String(canonical.into()));
        written.push(GENDER_FIELD.to_string());
    }

    match fields.get(NAME_FIELD).and_then(|v| name_key(&text_of(v))) {
        Some(key) => {
            fields.insert(NAME_KEY_FIELD.to_string(), Value::String(key));
            written.push(NAME_KEY_FIELD.to_string());
        }
        None => {
            fields.remove(NAME_KEY_FIELD);
        }
    }

    written
}

fn text_of(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
