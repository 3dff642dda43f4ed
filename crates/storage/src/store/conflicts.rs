#![forbid(unsafe_code)]

use super::clock::{SavepointClock, check_supplied_timestamp};
use super::error::{LifecycleError, Result, placement_error};
use super::requests::{ResolveWithDeltasRequest, RowRequest};
use super::rows::{RowScope, access_state, overlay_values};
use super::sql::{
    StoredVersion, check_user_values, delete_all_versions, delete_version, insert_version,
    update_version,
};
use super::tables::load_user_table;
use super::{SqliteStore, begin_write, canonicalize_row, canonicalize_table};
use odt_core::{
    ActionNotAuthorized, Actor, ConflictType, PlacementDecision, RowChange, RowVersion,
    ServerChangeOutcome, ServerRow, SyncState, decide_placement, references_attachments,
};
use rusqlite::Connection;
use tracing::{debug, warn};

/// The two tagged versions of a row in conflict.
struct ConflictPair {
    local: StoredVersion,
    server: StoredVersion,
}

impl ConflictPair {
    fn load(conn: &Connection, scope: RowScope<'_>) -> Result<Self> {
        let versions = scope.load(conn)?;
        if versions.is_empty() {
            return Err(scope.not_found());
        }
        let tagged = |local: bool| {
            versions.iter().find(|stored| {
                stored
                    .version
                    .conflict_type
                    .is_some_and(|conflict| conflict.is_local() == local)
            })
        };
        match (versions.len(), tagged(true), tagged(false)) {
            (2, Some(local), Some(server)) => Ok(Self {
                local: local.clone(),
                server: server.clone(),
            }),
            _ => Err(scope.illegal("row is not in conflict")),
        }
    }

    fn local_type(&self) -> Option<ConflictType> {
        self.local.version.conflict_type
    }

    fn server_type(&self) -> Option<ConflictType> {
        self.server.version.conflict_type
    }

    /// Replaces the pair with a single settled version stored in the local slot.
    fn settle(self, conn: &Connection, scope: RowScope<'_>, version: &RowVersion) -> Result<()> {
        delete_version(conn, scope.table, self.server.rowid)?;
        update_version(conn, scope.table, self.local.rowid, version)
    }
}

impl SqliteStore {
    /// Reconciles a server row with the single settled local version: syncs it, deletes it,
    /// keeps pending local changes, or places the row in conflict.
    pub fn place_row_into_conflict_or_sync(
        &mut self,
        table_id: &str,
        actor: &Actor,
        server: &ServerRow,
    ) -> Result<ServerChangeOutcome> {
        let table_id = canonicalize_table(table_id)?;
        let row_id = canonicalize_row(&table_id, &server.row_id)?;
        check_supplied_timestamp(&server.savepoint_timestamp)?;
        let tx = begin_write(&mut self.conn)?;
        let table = load_user_table(&tx, &table_id)?;
        let scope = RowScope {
            table: &table,
            row_id: &row_id,
            actor,
        };
        check_user_values(&table, &server.values)?;

        let (stale, local): (Vec<StoredVersion>, Vec<StoredVersion>) =
            scope.load(&tx)?.into_iter().partition(|stored| {
                stored
                    .version
                    .conflict_type
                    .is_some_and(ConflictType::is_server)
            });
        for stored in &stale {
            delete_version(&tx, &table, stored.rowid)?;
        }
        let local = match local.as_slice() {
            [] => return Err(scope.not_found()),
            [only] => only,
            _ => return Err(scope.illegal("row has checkpoints or more than one local version")),
        };

        let decision = decide_placement(
            &local.version,
            server,
            &table.columns,
            actor.is_privileged(),
        )
        .map_err(|err| placement_error(table_id.as_str(), row_id.as_str(), err))?;

        match decision {
            PlacementDecision::DeleteLocally => {
                delete_all_versions(&tx, &table, row_id.as_str())?;
            }
            PlacementDecision::ApplyServer { sync_state } => {
                let version = server_version(&mut self.clock, server, sync_state, None)?;
                update_version(&tx, &table, local.rowid, &version)?;
            }
            PlacementDecision::Retain { restore_to } => {
                if let Some(sync_state) = restore_to {
                    let mut version = local.version.clone();
                    version.sync_state = sync_state;
                    version.conflict_type = None;
                    update_version(&tx, &table, local.rowid, &version)?;
                }
            }
            PlacementDecision::PlaceInConflict {
                local_type,
                server_type,
            } => {
                let mut version = local.version.clone();
                version.sync_state = SyncState::InConflict;
                version.conflict_type = Some(local_type);
                update_version(&tx, &table, local.rowid, &version)?;
                let incoming = server_version(
                    &mut self.clock,
                    server,
                    SyncState::InConflict,
                    Some(server_type),
                )?;
                insert_version(&tx, &table, &incoming)?;
            }
        }

        tx.commit()?;
        let outcome = decision.outcome();
        debug!(
            table_id = %table_id,
            row_id = %row_id,
            outcome = ?outcome,
            stale_server_versions = stale.len(),
            "applied server row"
        );
        Ok(outcome)
    }

    /// Keeps the local version. A local deletion ends as a `deleted` tombstone.
    pub fn resolve_take_local(&mut self, request: RowRequest) -> Result<RowVersion> {
        let table_id = canonicalize_table(&request.table_id)?;
        let row_id = canonicalize_row(&table_id, &request.row_id)?;
        let tx = begin_write(&mut self.conn)?;
        let table = load_user_table(&tx, &table_id)?;
        let scope = RowScope {
            table: &table,
            row_id: &row_id,
            actor: &request.actor,
        };
        let pair = ConflictPair::load(&tx, scope)?;

        let resolved = if pair.local_type() == Some(ConflictType::LocalDeletedOldValues) {
            scope.authorize(Some(&pair.local.version), RowChange::DeleteRow)?;
            let mut tombstone = pair.server.version.clone();
            tombstone.sync_state = SyncState::Deleted;
            tombstone.conflict_type = None;
            tombstone
        } else {
            scope.authorize(Some(&pair.local.version), RowChange::ChangeRow)?;
            let server = &pair.server.version;
            let mut kept = pair.local.version.clone();
            kept.row_etag = server.row_etag.clone();
            kept.filter_scope = server.filter_scope.clone();
            kept.savepoint_timestamp = server.savepoint_timestamp.clone();
            kept.savepoint_creator = server.savepoint_creator.clone();
            kept.sync_state = SyncState::Changed;
            kept.conflict_type = None;
            kept
        };
        pair.settle(&tx, scope, &resolved)?;
        tx.commit()?;
        debug!(table_id = %table_id, row_id = %row_id, sync_state = %resolved.sync_state, "resolved conflict taking local");
        Ok(resolved)
    }

    /// Keeps the local version with `values` applied on top and adopts the server's etag and
    /// filter scope unless the delta supplies its own scope.
    pub fn resolve_take_local_plus_server_deltas(
        &mut self,
        request: ResolveWithDeltasRequest,
    ) -> Result<RowVersion> {
        let table_id = canonicalize_table(&request.table_id)?;
        let row_id = canonicalize_row(&table_id, &request.row_id)?;
        let tx = begin_write(&mut self.conn)?;
        let table = load_user_table(&tx, &table_id)?;
        let scope = RowScope {
            table: &table,
            row_id: &row_id,
            actor: &request.actor,
        };
        let pair = ConflictPair::load(&tx, scope)?;
        if pair.local_type() == Some(ConflictType::LocalDeletedOldValues) {
            return Err(scope.illegal("local version is a deletion; take local or server instead"));
        }
        check_user_values(&table, &request.values)?;
        scope.authorize(Some(&pair.local.version), RowChange::ChangeRow)?;
        if request.filter_scope.is_some() {
            scope.authorize(Some(&pair.local.version), RowChange::ModifyFilterScope)?;
        }

        let server = &pair.server.version;
        let floor = pair
            .local
            .version
            .savepoint_timestamp
            .as_str()
            .max(server.savepoint_timestamp.as_str());
        let mut merged = pair.local.version.clone();
        overlay_values(&mut merged.values, request.values);
        merged.row_etag = server.row_etag.clone();
        merged.filter_scope = request
            .filter_scope
            .unwrap_or_else(|| server.filter_scope.clone());
        merged.savepoint_timestamp = self.clock.next_after(Some(floor));
        merged.savepoint_creator = Some(request.actor.user.clone());
        merged.sync_state = SyncState::Changed;
        merged.conflict_type = None;

        pair.settle(&tx, scope, &merged)?;
        tx.commit()?;
        debug!(table_id = %table_id, row_id = %row_id, "resolved conflict merging server deltas");
        Ok(merged)
    }

    /// Adopts the server version. Returns `None` when the server had deleted the row.
    ///
    /// Only visibility of the local row is checked: taking the server's version discards
    /// local edits rather than making new ones, so update and delete rights do not apply.
    pub fn resolve_take_server(&mut self, request: RowRequest) -> Result<Option<RowVersion>> {
        let table_id = canonicalize_table(&request.table_id)?;
        let row_id = canonicalize_row(&table_id, &request.row_id)?;
        let tx = begin_write(&mut self.conn)?;
        let table = load_user_table(&tx, &table_id)?;
        let scope = RowScope {
            table: &table,
            row_id: &row_id,
            actor: &request.actor,
        };
        let pair = ConflictPair::load(&tx, scope)?;
        if !table
            .security
            .is_visible(&request.actor, access_state(&pair.local.version))
        {
            let denied = ActionNotAuthorized {
                table_id: table_id.as_str().to_string(),
                row_id: row_id.as_str().to_string(),
                actor: request.actor.user.clone(),
                attempted_op: RowChange::ChangeRow,
            };
            warn!(table_id = %table_id, row_id = %row_id, actor = %denied.actor, "take-server denied on hidden row");
            return Err(LifecycleError::from(denied));
        }

        if pair.server_type() == Some(ConflictType::ServerDeletedOldValues) {
            delete_all_versions(&tx, &table, row_id.as_str())?;
            tx.commit()?;
            debug!(table_id = %table_id, row_id = %row_id, "resolved conflict taking server deletion");
            return Ok(None);
        }

        let mut adopted = pair.server.version.clone();
        adopted.conflict_type = None;
        adopted.sync_state = if references_attachments(&adopted.values, &table.columns) {
            SyncState::SyncedPendingFiles
        } else {
            SyncState::Synced
        };
        pair.settle(&tx, scope, &adopted)?;
        tx.commit()?;
        debug!(table_id = %table_id, row_id = %row_id, sync_state = %adopted.sync_state, "resolved conflict taking server");
        Ok(Some(adopted))
    }
}

fn server_version(
    clock: &mut SavepointClock,
    server: &ServerRow,
    sync_state: SyncState,
    conflict_type: Option<ConflictType>,
) -> Result<RowVersion> {
    let mut version = server.to_version(sync_state, conflict_type);
    version.savepoint_timestamp = clock.supplied_or_next(Some(&server.savepoint_timestamp))?;
    version.values.retain(|_, value| !value.is_null());
    Ok(version)
}
