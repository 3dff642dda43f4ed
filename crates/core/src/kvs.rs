#![forbid(unsafe_code)]

use crate::schema::ElementDataType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PARTITION_TABLE: &str = "Table";
pub const PARTITION_COLUMN: &str = "Column";
pub const ASPECT_DEFAULT: &str = "default";

pub mod security {
    pub const ASPECT: &str = "security";
    pub const KEY_LOCKED: &str = "locked";
    pub const KEY_UNVERIFIED_USER_CAN_CREATE: &str = "unverifiedUserCanCreate";
    pub const KEY_FILTER_TYPE_ON_CREATION: &str = "filterTypeOnCreation";
}

/// Table-level and column-level property, keyed by `(table_id, partition, aspect, key)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyValueStoreEntry {
    pub table_id: String,
    pub partition: String,
    pub aspect: String,
    pub key: String,
    #[serde(rename = "type")]
    pub entry_type: Option<String>,
    pub value: Option<String>,
}

impl KeyValueStoreEntry {
    pub fn new(
        table_id: impl Into<String>,
        partition: impl Into<String>,
        aspect: impl Into<String>,
        key: impl Into<String>,
        entry_type: ElementDataType,
        value: impl Into<String>,
    ) -> Self {
        Self {
            table_id: table_id.into(),
            partition: partition.into(),
            aspect: aspect.into(),
            key: key.into(),
            entry_type: Some(entry_type.as_str().to_string()),
            value: Some(value.into()),
        }
    }

    /// An absent or empty value means "remove this entry".
    pub fn is_deletion(&self) -> bool {
        self.value.as_deref().is_none_or(str::is_empty)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum KvsError {
    #[error("key-value entry field `{field}` must not be empty")]
    EmptyField { field: &'static str },
    #[error("key-value entry `{key}` has a value but no type")]
    MissingType { key: String },
    #[error("key-value entry `{key}` value does not match type `{entry_type}`")]
    ValueTypeMismatch { key: String, entry_type: String },
    #[error("key-value entry for table `{entry_table}` supplied while replacing `{table_id}`")]
    TableMismatch { table_id: String, entry_table: String },
}

/// Entry after validation, with the original type when a known key forced a correction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NormalizedEntry {
    pub entry: KeyValueStoreEntry,
    pub corrected_from: Option<String>,
}

pub fn normalize_entry(mut entry: KeyValueStoreEntry) -> Result<NormalizedEntry, KvsError> {
    for (field, value) in [
        ("table_id", &entry.table_id),
        ("partition", &entry.partition),
        ("aspect", &entry.aspect),
        ("key", &entry.key),
    ] {
        if value.trim().is_empty() {
            return Err(KvsError::EmptyField { field });
        }
    }

    if entry.is_deletion() {
        entry.value = None;
        return Ok(NormalizedEntry {
            entry,
            corrected_from: None,
        });
    }

    let mut corrected_from = None;
    if let Some(required) = restricted_type(&entry.partition, &entry.key) {
        if entry.entry_type.as_deref() != Some(required.as_str()) {
            corrected_from = Some(entry.entry_type.clone().unwrap_or_default());
            entry.entry_type = Some(required.as_str().to_string());
        }
    }

    let Some(entry_type) = entry.entry_type.clone().filter(|t| !t.trim().is_empty()) else {
        return Err(KvsError::MissingType {
            key: entry.key.clone(),
        });
    };

    if let Some(value) = entry.value.as_deref() {
        enforce_value_type(&entry.key, &entry_type, value)?;
    }

    Ok(NormalizedEntry {
        entry,
        corrected_from,
    })
}

/// Types fixed for well-known display properties.
fn restricted_type(partition: &str, key: &str) -> Option<ElementDataType> {
    let required = match (partition, key) {
        (PARTITION_COLUMN, "displayChoicesList" | "displayFormat") => ElementDataType::String,
        (PARTITION_COLUMN, "displayName") => ElementDataType::Object,
        (PARTITION_COLUMN, "displayVisible") => ElementDataType::Bool,
        (PARTITION_COLUMN, "joins") => ElementDataType::Array,
        (PARTITION_TABLE, "colOrder" | "groupByCols") => ElementDataType::Array,
        (PARTITION_TABLE, "displayName" | "sortCol" | "sortOrder") => ElementDataType::Object,
        (PARTITION_TABLE, "indexCol") => ElementDataType::String,
        _ => return None,
    };
    Some(required)
}

fn enforce_value_type(key: &str, entry_type: &str, value: &str) -> Result<(), KvsError> {
    let mismatch = || KvsError::ValueTypeMismatch {
        key: key.to_string(),
        entry_type: entry_type.to_string(),
    };
    let trimmed = value.trim();
    match ElementDataType::parse(entry_type) {
        Some(ElementDataType::Array) => {
            if !(trimmed.starts_with('[') && trimmed.ends_with(']')) {
                return Err(mismatch());
            }
        }
        Some(ElementDataType::Object) => {
            let balanced = match trimmed.chars().next() {
                Some('"') => trimmed.len() > 1 && trimmed.ends_with('"'),
                Some('[') => trimmed.ends_with(']'),
                Some('{') => trimmed.ends_with('}'),
                _ => true,
            };
            if !balanced {
                return Err(mismatch());
            }
        }
        Some(ElementDataType::Bool) => {
            if !matches!(trimmed, "true" | "false" | "TRUE" | "FALSE" | "0" | "1") {
                return Err(mismatch());
            }
        }
        Some(ElementDataType::Integer) => {
            trimmed.parse::<i64>().map_err(|_| mismatch())?;
        }
        Some(ElementDataType::Number) => {
            trimmed.parse::<f64>().map_err(|_| mismatch())?;
        }
        _ => {}
    }
    Ok(())
}

pub fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim() {
        "true" | "TRUE" | "1" => Some(true),
        "false" | "FALSE" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(partition: &str, key: &str, entry_type: &str, value: &str) -> KeyValueStoreEntry {
        KeyValueStoreEntry {
            table_id: "t1".to_string(),
            partition: partition.to_string(),
            aspect: ASPECT_DEFAULT.to_string(),
            key: key.to_string(),
            entry_type: Some(entry_type.to_string()),
            value: Some(value.to_string()),
        }
    }

    #[test]
    fn empty_identity_fields_are_rejected() {
        let mut bad = entry(PARTITION_TABLE, "k", "string", "v");
        bad.aspect = String::new();
        assert_eq!(
            normalize_entry(bad).unwrap_err(),
            KvsError::EmptyField { field: "aspect" }
        );
    }

    #[test]
    fn known_keys_get_their_type_corrected() {
        let out = normalize_entry(entry(PARTITION_TABLE, "colOrder", "string", "[\"a\"]"))
            .expect("colOrder must normalize");
        assert_eq!(out.entry.entry_type.as_deref(), Some("array"));
        assert_eq!(out.corrected_from.as_deref(), Some("string"));
    }

    #[test]
    fn array_and_object_values_must_be_well_formed() {
        assert!(normalize_entry(entry(PARTITION_TABLE, "groupByCols", "array", "a,b")).is_err());
        assert!(normalize_entry(entry(PARTITION_TABLE, "sortCol", "object", "{\"a\":1")).is_err());
        assert!(normalize_entry(entry(PARTITION_TABLE, "displayName", "object", "\"Visits\"")).is_ok());
    }

    #[test]
    fn empty_value_is_a_deletion_even_without_type() {
        let mut deletion = entry(PARTITION_TABLE, "anything", "", "");
        deletion.entry_type = None;
        let out = normalize_entry(deletion).expect("deletion must normalize");
        assert!(out.entry.value.is_none());

        let mut untyped = entry(PARTITION_TABLE, "anything", "", "x");
        untyped.entry_type = None;
        assert!(matches!(
            normalize_entry(untyped).unwrap_err(),
            KvsError::MissingType { .. }
        ));
    }
}
