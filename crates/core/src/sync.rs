#![forbid(unsafe_code)]

use crate::row::{
    ColumnValue, ConflictType, RowFilterScope, RowValues, RowVersion, SavepointType, SyncState,
    identical_value,
};
use crate::schema::{ElementDataType, OrderedColumns};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Server copy of a row as delivered by a sync exchange.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerRow {
    pub row_id: String,
    pub row_etag: String,
    pub deleted: bool,
    pub filter_scope: RowFilterScope,
    pub form_id: Option<String>,
    pub locale: Option<String>,
    pub savepoint_type: Option<SavepointType>,
    pub savepoint_timestamp: String,
    pub savepoint_creator: Option<String>,
    pub values: RowValues,
}

impl ServerRow {
    pub fn to_version(
        &self,
        sync_state: SyncState,
        conflict_type: Option<ConflictType>,
    ) -> RowVersion {
        RowVersion {
            row_id: self.row_id.clone(),
            row_etag: Some(self.row_etag.clone()),
            sync_state,
            conflict_type,
            filter_scope: self.filter_scope.clone(),
            form_id: self.form_id.clone(),
            locale: self.locale.clone(),
            savepoint_type: Some(self.savepoint_type.unwrap_or(SavepointType::Complete)),
            savepoint_timestamp: self.savepoint_timestamp.clone(),
            savepoint_creator: self.savepoint_creator.clone(),
            values: self.values.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerChangeOutcome {
    LocallySynced,
    LocallySyncedPendingFiles,
    LocallyDeleted,
    LocallyInConflict,
    /// Server copy is unchanged since the last exchange; local edits stay pending.
    LocalChangesRetained,
}

/// What applying a server row to the single local version must do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlacementDecision {
    DeleteLocally,
    ApplyServer { sync_state: SyncState },
    Retain { restore_to: Option<SyncState> },
    PlaceInConflict {
        local_type: ConflictType,
        server_type: ConflictType,
    },
}

impl PlacementDecision {
    pub fn outcome(self) -> ServerChangeOutcome {
        match self {
            Self::DeleteLocally => ServerChangeOutcome::LocallyDeleted,
            Self::ApplyServer {
                sync_state: SyncState::SyncedPendingFiles,
            } => ServerChangeOutcome::LocallySyncedPendingFiles,
            Self::ApplyServer { .. } => ServerChangeOutcome::LocallySynced,
            Self::Retain { .. } => ServerChangeOutcome::LocalChangesRetained,
            Self::PlaceInConflict { .. } => ServerChangeOutcome::LocallyInConflict,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PlacementError {
    #[error("row is in conflict but carries no local conflict tag")]
    MissingLocalConflictType,
    #[error("only the local conflict version may remain before applying a server row")]
    ServerVersionPresent,
    #[error("local version is a checkpoint")]
    LocalIsCheckpoint,
}

/// Decides how a server row reconciles with the local settled version.
pub fn decide_placement(
    local: &RowVersion,
    server: &ServerRow,
    columns: &OrderedColumns,
    actor_is_privileged: bool,
) -> Result<PlacementDecision, PlacementError> {
    if local.is_checkpoint() {
        return Err(PlacementError::LocalIsCheckpoint);
    }

    let state = local.sync_state;
    let local_conflict = if state == SyncState::InConflict {
        let conflict = local
            .conflict_type
            .ok_or(PlacementError::MissingLocalConflictType)?;
        if conflict.is_server() {
            return Err(PlacementError::ServerVersionPresent);
        }
        Some(conflict)
    } else {
        None
    };

    if server.deleted {
        if state.is_synced()
            || state == SyncState::Deleted
            || local_conflict == Some(ConflictType::LocalDeletedOldValues)
        {
            return Ok(PlacementDecision::DeleteLocally);
        }
    } else if state.is_synced() {
        let pending = state == SyncState::SyncedPendingFiles
            || server_attachments_differ(local, server, columns);
        return Ok(PlacementDecision::ApplyServer {
            sync_state: synced_state(pending),
        });
    }

    let same_etag = local.row_etag.as_deref() == Some(server.row_etag.as_str());
    if same_etag {
        let restore_to = local_conflict.map(|conflict| match conflict {
            ConflictType::LocalDeletedOldValues => SyncState::Deleted,
            _ => SyncState::Changed,
        });
        return Ok(PlacementDecision::Retain { restore_to });
    }

    let local_type = match (state, local_conflict) {
        (_, Some(conflict)) => conflict,
        (SyncState::Deleted, None) => ConflictType::LocalDeletedOldValues,
        _ => ConflictType::LocalUpdatedUpdatedValues,
    };

    let privileged_fields_differ = local.filter_scope != server.filter_scope;
    let data_differs = data_differs(local, server, columns);

    if server.deleted
        || data_differs
        || local_type == ConflictType::LocalDeletedOldValues
        || (actor_is_privileged && privileged_fields_differ)
    {
        let server_type = if server.deleted {
            ConflictType::ServerDeletedOldValues
        } else {
            ConflictType::ServerUpdatedUpdatedValues
        };
        return Ok(PlacementDecision::PlaceInConflict {
            local_type,
            server_type,
        });
    }

    Ok(PlacementDecision::ApplyServer {
        sync_state: synced_state(server_attachments_differ(local, server, columns)),
    })
}

fn synced_state(pending_files: bool) -> SyncState {
    if pending_files {
        SyncState::SyncedPendingFiles
    } else {
        SyncState::Synced
    }
}

/// User columns, form id and locale. Savepoint bookkeeping and the filter scope are excluded.
pub fn data_differs(local: &RowVersion, server: &ServerRow, columns: &OrderedColumns) -> bool {
    if local.form_id != server.form_id || local.locale != server.locale {
        return true;
    }
    columns.retention_columns().any(|cd| {
        let server_value = server
            .values
            .get(cd.element_key())
            .unwrap_or(&ColumnValue::Null);
        !identical_value(local.value(cd.element_key()), server_value, cd.data_type())
    })
}

/// True when the server references a rowpath attachment the local row does not already hold.
pub fn server_attachments_differ(
    local: &RowVersion,
    server: &ServerRow,
    columns: &OrderedColumns,
) -> bool {
    rowpath_columns(columns).any(|key| {
        let Some(server_uri) = server.values.get(key).and_then(ColumnValue::as_text) else {
            return false;
        };
        local.value(key).as_text() != Some(server_uri)
    })
}

/// True when any rowpath column of `values` is non-empty.
pub fn references_attachments(values: &RowValues, columns: &OrderedColumns) -> bool {
    rowpath_columns(columns).any(|key| {
        values
            .get(key)
            .and_then(ColumnValue::as_text)
            .is_some_and(|uri| !uri.is_empty())
    })
}

fn rowpath_columns(columns: &OrderedColumns) -> impl Iterator<Item = &str> {
    columns
        .retention_columns()
        .filter(|cd| cd.data_type() == ElementDataType::Rowpath)
        .map(|cd| cd.element_key())
}
