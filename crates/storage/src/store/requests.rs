#![forbid(unsafe_code)]

use odt_core::{
    Actor, Column, FilterType, KeyValueStoreEntry, RowFilterScope, RowValues, SavepointType,
    SyncState,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateTableRequest {
    pub table_id: String,
    pub columns: Vec<Column>,
    pub locked: bool,
    pub unverified_user_can_create: bool,
    pub filter_type_on_creation: FilterType,
    /// Extra table/column properties written alongside the security entries.
    pub metadata: Vec<KeyValueStoreEntry>,
}

impl CreateTableRequest {
    pub fn new(table_id: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            table_id: table_id.into(),
            columns,
            locked: false,
            unverified_user_can_create: true,
            filter_type_on_creation: FilterType::Default,
            metadata: Vec::new(),
        }
    }
}

/// Metadata a caller may supply on insert; anything left `None` is defaulted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RowMetadata {
    pub row_etag: Option<String>,
    pub sync_state: Option<SyncState>,
    pub form_id: Option<String>,
    pub locale: Option<String>,
    pub savepoint_type: Option<SavepointType>,
    pub savepoint_timestamp: Option<String>,
    pub savepoint_creator: Option<String>,
    pub filter_scope: Option<RowFilterScope>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InsertRowRequest {
    pub table_id: String,
    pub row_id: String,
    pub actor: Actor,
    pub values: RowValues,
    pub metadata: RowMetadata,
}

impl InsertRowRequest {
    pub fn new(
        table_id: impl Into<String>,
        row_id: impl Into<String>,
        actor: Actor,
        values: RowValues,
    ) -> Self {
        Self {
            table_id: table_id.into(),
            row_id: row_id.into(),
            actor,
            values,
            metadata: RowMetadata::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct UpdateRowRequest {
    pub table_id: String,
    pub row_id: String,
    pub actor: Actor,
    pub values: RowValues,
    /// Replaces the row's filter scope; privileged actors only.
    pub filter_scope: Option<RowFilterScope>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CheckpointRequest {
    pub table_id: String,
    pub row_id: String,
    pub actor: Actor,
    pub values: RowValues,
}

/// Identifies one row acted on by `actor`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowRequest {
    pub table_id: String,
    pub row_id: String,
    pub actor: Actor,
}

impl RowRequest {
    pub fn new(table_id: impl Into<String>, row_id: impl Into<String>, actor: Actor) -> Self {
        Self {
            table_id: table_id.into(),
            row_id: row_id.into(),
            actor,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResolveWithDeltasRequest {
    pub table_id: String,
    pub row_id: String,
    pub actor: Actor,
    pub values: RowValues,
    pub filter_scope: Option<RowFilterScope>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowQuery {
    pub table_id: String,
    pub actor: Actor,
    /// Columns the caller will read; `None` means every column.
    pub projection: Option<Vec<String>>,
    pub row_id: Option<String>,
    pub sync_state: Option<SyncState>,
    pub limit: Option<usize>,
}

impl RowQuery {
    pub fn all(table_id: impl Into<String>, actor: Actor) -> Self {
        Self {
            table_id: table_id.into(),
            actor,
            projection: None,
            row_id: None,
            sync_state: None,
            limit: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetadataFilter {
    pub table_id: Option<String>,
    pub partition: Option<String>,
    pub aspect: Option<String>,
    pub key: Option<String>,
}
