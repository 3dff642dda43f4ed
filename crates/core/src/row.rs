#![forbid(unsafe_code)]

use crate::schema::ElementDataType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("unknown {kind} literal `{value}`")]
pub struct UnknownLiteral {
    pub kind: &'static str,
    pub value: String,
}

/// Metadata columns every user table carries ahead of its user columns.
pub mod admin_columns {
    pub const ID: &str = "_id";
    pub const ROW_ETAG: &str = "_row_etag";
    pub const SYNC_STATE: &str = "_sync_state";
    pub const CONFLICT_TYPE: &str = "_conflict_type";
    pub const FILTER_TYPE: &str = "_filter_type";
    pub const FILTER_VALUE: &str = "_filter_value";
    pub const FORM_ID: &str = "_form_id";
    pub const LOCALE: &str = "_locale";
    pub const SAVEPOINT_TYPE: &str = "_savepoint_type";
    pub const SAVEPOINT_TIMESTAMP: &str = "_savepoint_timestamp";
    pub const SAVEPOINT_CREATOR: &str = "_savepoint_creator";
    /// Computed per query, never stored.
    pub const EFFECTIVE_ACCESS: &str = "_effective_access";

    pub const STORED: [&str; 11] = [
        ID,
        ROW_ETAG,
        SYNC_STATE,
        CONFLICT_TYPE,
        FILTER_TYPE,
        FILTER_VALUE,
        FORM_ID,
        LOCALE,
        SAVEPOINT_TYPE,
        SAVEPOINT_TIMESTAMP,
        SAVEPOINT_CREATOR,
    ];

    pub fn is_admin_column(name: &str) -> bool {
        name == EFFECTIVE_ACCESS || STORED.contains(&name)
    }
}

macro_rules! string_literal_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $literal:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $literal,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownLiteral;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($literal => Ok(Self::$variant),)+
                    _ => Err(UnknownLiteral {
                        kind: $kind,
                        value: value.to_string(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    NewRow,
    Changed,
    Synced,
    SyncedPendingFiles,
    Deleted,
    InConflict,
}

string_literal_enum!(SyncState, "sync state", {
    NewRow => "new_row",
    Changed => "changed",
    Synced => "synced",
    SyncedPendingFiles => "synced_pending_files",
    Deleted => "deleted",
    InConflict => "in_conflict",
});

impl SyncState {
    /// `synced` or `synced_pending_files`.
    pub fn is_synced(self) -> bool {
        matches!(self, Self::Synced | Self::SyncedPendingFiles)
    }

    /// State a settled row moves to once it is edited locally.
    pub fn after_local_edit(self) -> Self {
        match self {
            Self::NewRow => Self::NewRow,
            _ => Self::Changed,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterType {
    #[default]
    Default,
    Hidden,
    ReadOnly,
    Modify,
}

string_literal_enum!(FilterType, "filter type", {
    Default => "DEFAULT",
    Hidden => "HIDDEN",
    ReadOnly => "READ_ONLY",
    Modify => "MODIFY",
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SavepointType {
    Complete,
    Incomplete,
}

string_literal_enum!(SavepointType, "savepoint type", {
    Complete => "COMPLETE",
    Incomplete => "INCOMPLETE",
});

/// Conflict tag carried by the two versions of a row in conflict. Codes 0 and 1 tag the local
/// version, 2 and 3 tag the server version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum ConflictType {
    LocalDeletedOldValues,
    LocalUpdatedUpdatedValues,
    ServerDeletedOldValues,
    ServerUpdatedUpdatedValues,
}

impl ConflictType {
    pub fn code(self) -> i64 {
        match self {
            Self::LocalDeletedOldValues => 0,
            Self::LocalUpdatedUpdatedValues => 1,
            Self::ServerDeletedOldValues => 2,
            Self::ServerUpdatedUpdatedValues => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => Self::LocalDeletedOldValues,
            1 => Self::LocalUpdatedUpdatedValues,
            2 => Self::ServerDeletedOldValues,
            3 => Self::ServerUpdatedUpdatedValues,
            _ => return None,
        })
    }

    pub fn is_local(self) -> bool {
        self.code() < Self::ServerDeletedOldValues.code()
    }

    pub fn is_server(self) -> bool {
        !self.is_local()
    }
}

impl TryFrom<i64> for ConflictType {
    type Error = UnknownLiteral;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::from_code(value).ok_or_else(|| UnknownLiteral {
            kind: "conflict type",
            value: value.to_string(),
        })
    }
}

impl From<ConflictType> for i64 {
    fn from(value: ConflictType) -> Self {
        value.code()
    }
}

/// Per-row visibility policy plus the owning identity.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowFilterScope {
    pub filter_type: FilterType,
    pub filter_value: Option<String>,
}

impl RowFilterScope {
    pub fn new(filter_type: FilterType, filter_value: Option<&str>) -> Self {
        Self {
            filter_type,
            filter_value: filter_value.map(str::to_string),
        }
    }

    pub fn is_owned_by(&self, user: &str) -> bool {
        self.filter_value.as_deref() == Some(user)
    }
}

/// A single user-column value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Integer(i64),
    Number(f64),
    Text(String),
}

impl ColumnValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    /// Canonical string form used for comparison and for text columns.
    pub fn to_canonical_string(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Bool(value) => Some(if *value { "1" } else { "0" }.to_string()),
            Self::Integer(value) => Some(value.to_string()),
            Self::Number(value) => Some(value.to_string()),
            Self::Text(value) => Some(value.clone()),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(value) => Some(*value as f64),
            Self::Number(value) => Some(*value),
            Self::Bool(value) => Some(if *value { 1.0 } else { 0.0 }),
            Self::Text(value) => value.trim().parse::<f64>().ok(),
            Self::Null => None,
        }
    }

    fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            Self::Integer(value) => Some(*value != 0),
            Self::Number(value) => Some(*value != 0.0),
            Self::Text(value) => match value.trim() {
                "1" | "true" | "TRUE" | "True" => Some(true),
                "0" | "false" | "FALSE" | "False" => Some(false),
                _ => None,
            },
            Self::Null => None,
        }
    }
}

pub type RowValues = BTreeMap<String, ColumnValue>;

const NUMBER_ULP_TOLERANCE: f64 = 128.0;

/// Equality of two stored values under the column's data type. Numbers match within a small
/// ULP window (NaN matches NaN, infinities match by sign); booleans match by truth value.
pub fn identical_value(
    local: &ColumnValue,
    server: &ColumnValue,
    data_type: ElementDataType,
) -> bool {
    match (local.is_null(), server.is_null()) {
        (true, true) => return true,
        (true, false) | (false, true) => return false,
        (false, false) => {}
    }

    match data_type {
        ElementDataType::Number => match (local.as_f64(), server.as_f64()) {
            (Some(a), Some(b)) => numbers_match(a, b),
            _ => local.to_canonical_string() == server.to_canonical_string(),
        },
        ElementDataType::Integer => match (local.as_f64(), server.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => local.to_canonical_string() == server.to_canonical_string(),
        },
        ElementDataType::Bool => match (local.as_bool(), server.as_bool()) {
            (Some(a), Some(b)) => a == b,
            _ => local.to_canonical_string() == server.to_canonical_string(),
        },
        _ => local.to_canonical_string() == server.to_canonical_string(),
    }
}

fn numbers_match(a: f64, b: f64) -> bool {
    if a.is_nan() || b.is_nan() {
        return a.is_nan() && b.is_nan();
    }
    if a.is_infinite() || b.is_infinite() {
        return a == b;
    }
    if a == b {
        return true;
    }
    let scale = a.abs().max(b.abs());
    (a - b).abs() <= NUMBER_ULP_TOLERANCE * f64::EPSILON * scale
}

/// One entry in a row's version chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RowVersion {
    pub row_id: String,
    pub row_etag: Option<String>,
    pub sync_state: SyncState,
    pub conflict_type: Option<ConflictType>,
    pub filter_scope: RowFilterScope,
    pub form_id: Option<String>,
    pub locale: Option<String>,
    pub savepoint_type: Option<SavepointType>,
    pub savepoint_timestamp: String,
    pub savepoint_creator: Option<String>,
    pub values: RowValues,
}

impl RowVersion {
    /// Mid-edit version (no savepoint type).
    pub fn is_checkpoint(&self) -> bool {
        self.savepoint_type.is_none()
    }

    pub fn value(&self, element_key: &str) -> &ColumnValue {
        self.values.get(element_key).unwrap_or(&ColumnValue::Null)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TableHealth {
    Clean,
    HasConflicts,
    HasCheckpoints,
    HasCheckpointsAndConflicts,
}

impl TableHealth {
    pub fn from_counts(checkpoints: u64, conflicts: u64) -> Self {
        match (checkpoints > 0, conflicts > 0) {
            (false, false) => Self::Clean,
            (false, true) => Self::HasConflicts,
            (true, false) => Self::HasCheckpoints,
            (true, true) => Self::HasCheckpointsAndConflicts,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Clean => 0,
            Self::HasConflicts => 1,
            Self::HasCheckpoints => 2,
            Self::HasCheckpointsAndConflicts => 3,
        }
    }

    pub fn has_checkpoints(self) -> bool {
        matches!(self, Self::HasCheckpoints | Self::HasCheckpointsAndConflicts)
    }

    pub fn has_conflicts(self) -> bool {
        matches!(self, Self::HasConflicts | Self::HasCheckpointsAndConflicts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_literals_round_trip() {
        for state in [
            SyncState::NewRow,
            SyncState::Changed,
            SyncState::Synced,
            SyncState::SyncedPendingFiles,
            SyncState::Deleted,
            SyncState::InConflict,
        ] {
            assert_eq!(state.as_str().parse::<SyncState>(), Ok(state));
        }
        assert_eq!("READ_ONLY".parse::<FilterType>(), Ok(FilterType::ReadOnly));
        assert!("read_only".parse::<FilterType>().is_err());
        assert_eq!(
            serde_json::to_string(&SyncState::SyncedPendingFiles).expect("serialize"),
            "\"synced_pending_files\""
        );
        assert_eq!(
            serde_json::to_string(&ConflictType::ServerUpdatedUpdatedValues).expect("serialize"),
            "3"
        );
    }

    #[test]
    fn conflict_type_partition_is_local_below_two() {
        assert!(ConflictType::LocalDeletedOldValues.is_local());
        assert!(ConflictType::LocalUpdatedUpdatedValues.is_local());
        assert!(ConflictType::ServerDeletedOldValues.is_server());
        assert!(ConflictType::ServerUpdatedUpdatedValues.is_server());
        assert_eq!(ConflictType::from_code(4), None);
    }

    #[test]
    fn numbers_compare_within_tolerance() {
        let pi = ColumnValue::Number(std::f64::consts::PI);
        let near = ColumnValue::Number(std::f64::consts::PI * (1.0 + 4.0 * f64::EPSILON));
        let far = ColumnValue::Number(2.0 * std::f64::consts::PI);
        assert!(identical_value(&pi, &near, ElementDataType::Number));
        assert!(!identical_value(&pi, &far, ElementDataType::Number));
        assert!(identical_value(
            &ColumnValue::Number(f64::NAN),
            &ColumnValue::Number(f64::NAN),
            ElementDataType::Number
        ));
        assert!(!identical_value(
            &ColumnValue::Number(f64::INFINITY),
            &ColumnValue::Number(f64::NEG_INFINITY),
            ElementDataType::Number
        ));
    }

    #[test]
    fn booleans_compare_by_truth() {
        assert!(identical_value(
            &ColumnValue::Bool(true),
            &ColumnValue::Integer(1),
            ElementDataType::Bool
        ));
        assert!(!identical_value(
            &ColumnValue::Bool(false),
            &ColumnValue::Text("true".to_string()),
            ElementDataType::Bool
        ));
        assert!(!identical_value(
            &ColumnValue::Null,
            &ColumnValue::Bool(false),
            ElementDataType::Bool
        ));
    }

    #[test]
    fn health_from_counts() {
        assert_eq!(TableHealth::from_counts(0, 0), TableHealth::Clean);
        assert_eq!(TableHealth::from_counts(0, 2), TableHealth::HasConflicts);
        assert_eq!(TableHealth::from_counts(3, 0), TableHealth::HasCheckpoints);
        assert_eq!(
            TableHealth::from_counts(1, 2).code(),
            TableHealth::HasCheckpointsAndConflicts.code()
        );
    }
}
