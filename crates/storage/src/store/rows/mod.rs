#![forbid(unsafe_code)]

mod privileged;
mod query;

pub use query::{QueriedRow, RowCursor};

use super::clock::SavepointClock;
use super::config::StoreConfig;
use super::error::{LifecycleError, Result};
use super::requests::{CheckpointRequest, InsertRowRequest, RowMetadata, RowRequest, UpdateRowRequest};
use super::sql::{
    StoredVersion, check_user_values, delete_all_versions, delete_version, insert_version,
    load_versions, quote_ident, update_version,
};
use super::tables::{UserTable, load_user_table};
use super::{SqliteStore, begin_read, begin_write, canonicalize_row, canonicalize_table};
use odt_core::ids::RowId;
use odt_core::{
    Actor, RowAccessState, RowChange, RowValues, RowVersion, SavepointType, SyncState, TableHealth,
};
use rusqlite::Connection;
use tracing::{debug, warn};

/// The row a lifecycle step acts on and who is acting.
#[derive(Clone, Copy)]
pub(crate) struct RowScope<'a> {
    pub(crate) table: &'a UserTable,
    pub(crate) row_id: &'a RowId,
    pub(crate) actor: &'a Actor,
}

impl RowScope<'_> {
    pub(crate) fn illegal(&self, reason: impl Into<String>) -> LifecycleError {
        LifecycleError::illegal_state(self.table.table_id.as_str(), self.row_id.as_str(), reason)
    }

    pub(crate) fn not_found(&self) -> LifecycleError {
        LifecycleError::row_not_found(self.table.table_id.as_str(), self.row_id.as_str())
    }

    /// Denials are logged and surfaced as `NotAuthorized`; nothing has been written yet.
    pub(crate) fn authorize(&self, row: Option<&RowVersion>, change: RowChange) -> Result<()> {
        self.table
            .security
            .allow_row_change(self.actor, self.row_id.as_str(), row.map(access_state), change)
            .map_err(|denied| {
                warn!(
                    table_id = %denied.table_id,
                    row_id = %denied.row_id,
                    actor = %denied.actor,
                    op = denied.attempted_op.as_str(),
                    "row change denied"
                );
                LifecycleError::from(denied)
            })
    }

    pub(crate) fn load(&self, conn: &Connection) -> Result<Vec<StoredVersion>> {
        load_versions(conn, self.table, self.row_id.as_str())
    }
}

pub(crate) fn access_state(version: &RowVersion) -> RowAccessState<'_> {
    RowAccessState {
        sync_state: version.sync_state,
        filter_scope: &version.filter_scope,
    }
}

pub(crate) fn is_in_conflict(versions: &[StoredVersion]) -> bool {
    versions.iter().any(|stored| {
        stored.version.conflict_type.is_some() || stored.version.sync_state == SyncState::InConflict
    })
}

fn ensure_not_in_conflict(scope: RowScope<'_>, versions: &[StoredVersion]) -> Result<()> {
    if is_in_conflict(versions) {
        return Err(scope.illegal("row is in conflict; resolve the conflict first"));
    }
    Ok(())
}

/// Most recent version of a chain that is not in conflict.
fn latest_version<'v>(
    scope: RowScope<'_>,
    versions: &'v [StoredVersion],
) -> Result<Option<&'v StoredVersion>> {
    let Some(last) = versions.last() else {
        return Ok(None);
    };
    let ties = versions
        .iter()
        .filter(|stored| stored.version.savepoint_timestamp == last.version.savepoint_timestamp)
        .count();
    if ties > 1 {
        return Err(scope.illegal("multiple versions share the latest savepoint timestamp"));
    }
    Ok(Some(last))
}

fn latest_timestamp(versions: &[StoredVersion]) -> Option<&str> {
    versions
        .iter()
        .map(|stored| stored.version.savepoint_timestamp.as_str())
        .max()
}

/// Applies `delta` on top of `base`; a null value clears the column.
pub(crate) fn overlay_values(base: &mut RowValues, delta: RowValues) {
    for (key, value) in delta {
        if value.is_null() {
            base.remove(&key);
        } else {
            base.insert(key, value);
        }
    }
}

fn insert_row_tx(
    conn: &Connection,
    clock: &mut SavepointClock,
    config: &StoreConfig,
    scope: RowScope<'_>,
    mut values: RowValues,
    metadata: RowMetadata,
) -> Result<RowVersion> {
    check_user_values(scope.table, &values)?;
    if !scope.load(conn)?.is_empty() {
        return Err(scope.illegal("row already exists; update it or append a checkpoint"));
    }

    scope.authorize(None, RowChange::NewRow)?;
    if metadata.filter_scope.is_some() {
        scope.authorize(None, RowChange::ModifyFilterScope)?;
    }

    let sync_state = metadata.sync_state.unwrap_or(SyncState::NewRow);
    if sync_state == SyncState::InConflict {
        return Err(LifecycleError::InvalidInput(
            "rows cannot be inserted in conflict".to_string(),
        ));
    }
    values.retain(|_, value| !value.is_null());

    let version = RowVersion {
        row_id: scope.row_id.as_str().to_string(),
        row_etag: metadata.row_etag,
        sync_state,
        conflict_type: None,
        filter_scope: metadata
            .filter_scope
            .unwrap_or_else(|| scope.table.security.scope_on_creation(scope.actor)),
        form_id: metadata.form_id,
        locale: metadata
            .locale
            .or_else(|| Some(config.default_locale.clone())),
        savepoint_type: Some(metadata.savepoint_type.unwrap_or(SavepointType::Complete)),
        savepoint_timestamp: clock.supplied_or_next(metadata.savepoint_timestamp.as_deref())?,
        savepoint_creator: metadata
            .savepoint_creator
            .or_else(|| Some(scope.actor.user.clone())),
        values,
    };
    insert_version(conn, scope.table, &version)?;
    Ok(version)
}

fn checkpoint_tx(
    conn: &Connection,
    clock: &mut SavepointClock,
    config: &StoreConfig,
    scope: RowScope<'_>,
    values: RowValues,
) -> Result<RowVersion> {
    check_user_values(scope.table, &values)?;
    let versions = scope.load(conn)?;
    ensure_not_in_conflict(scope, &versions)?;

    let version = match latest_version(scope, &versions)? {
        None => {
            scope.authorize(None, RowChange::NewRow)?;
            let mut fresh = RowValues::new();
            overlay_values(&mut fresh, values);
            RowVersion {
                row_id: scope.row_id.as_str().to_string(),
                row_etag: None,
                sync_state: SyncState::NewRow,
                conflict_type: None,
                filter_scope: scope.table.security.scope_on_creation(scope.actor),
                form_id: None,
                locale: Some(config.default_locale.clone()),
                savepoint_type: None,
                savepoint_timestamp: clock.next(),
                savepoint_creator: Some(scope.actor.user.clone()),
                values: fresh,
            }
        }
        Some(latest) => {
            if latest.version.sync_state == SyncState::Deleted {
                return Err(scope.illegal("row is deleted"));
            }
            scope.authorize(Some(&latest.version), RowChange::ChangeRow)?;
            let mut next = latest.version.clone();
            overlay_values(&mut next.values, values);
            next.sync_state = latest.version.sync_state.after_local_edit();
            next.savepoint_type = None;
            next.savepoint_timestamp = clock.next_after(latest_timestamp(&versions));
            next.savepoint_creator = Some(scope.actor.user.clone());
            next
        }
    };
    insert_version(conn, scope.table, &version)?;
    Ok(version)
}

/// Keeps the newest checkpoint as the settled version and drops everything older.
fn collapse_checkpoints_tx(
    conn: &Connection,
    scope: RowScope<'_>,
    savepoint_type: SavepointType,
) -> Result<StoredVersion> {
    let versions = scope.load(conn)?;
    if versions.is_empty() {
        return Err(scope.not_found());
    }
    ensure_not_in_conflict(scope, &versions)?;
    let latest = latest_version(scope, &versions)?.ok_or_else(|| scope.not_found())?;
    scope.authorize(Some(&latest.version), RowChange::ChangeRow)?;

    if !versions.iter().any(|stored| stored.version.is_checkpoint()) {
        return Ok(latest.clone());
    }

    let mut kept = latest.clone();
    kept.version.savepoint_type = Some(savepoint_type);
    kept.version.sync_state = kept.version.sync_state.after_local_edit();
    for stale in versions.iter().filter(|stored| stored.rowid != latest.rowid) {
        delete_version(conn, scope.table, stale.rowid)?;
    }
    update_version(conn, scope.table, kept.rowid, &kept.version)?;
    Ok(kept)
}

/// Drops the newest checkpoint (or all of them) and returns what is current afterwards.
fn delete_checkpoints_tx(
    conn: &Connection,
    scope: RowScope<'_>,
    only_last: bool,
) -> Result<Option<RowVersion>> {
    let versions = scope.load(conn)?;
    if versions.is_empty() {
        return Err(scope.not_found());
    }
    ensure_not_in_conflict(scope, &versions)?;
    let latest = latest_version(scope, &versions)?.ok_or_else(|| scope.not_found())?;
    scope.authorize(Some(&latest.version), RowChange::ChangeRow)?;

    let doomed: Vec<i64> = if only_last {
        if latest.version.is_checkpoint() {
            vec![latest.rowid]
        } else {
            Vec::new()
        }
    } else {
        versions
            .iter()
            .filter(|stored| stored.version.is_checkpoint())
            .map(|stored| stored.rowid)
            .collect()
    };
    for rowid in &doomed {
        delete_version(conn, scope.table, *rowid)?;
    }

    Ok(versions
        .into_iter()
        .filter(|stored| !doomed.contains(&stored.rowid))
        .last()
        .map(|stored| stored.version))
}

/// Physically removes a never-synced row, otherwise leaves a `deleted` tombstone.
fn delete_row_tx(
    conn: &Connection,
    clock: &mut SavepointClock,
    scope: RowScope<'_>,
) -> Result<Option<RowVersion>> {
    let versions = scope.load(conn)?;
    if versions.is_empty() {
        return Err(scope.not_found());
    }
    ensure_not_in_conflict(scope, &versions)?;

    let settled = versions
        .iter()
        .filter(|stored| !stored.version.is_checkpoint())
        .last();
    let subject = settled.or_else(|| versions.last());
    scope.authorize(subject.map(|stored| &stored.version), RowChange::DeleteRow)?;

    for checkpoint in versions.iter().filter(|stored| stored.version.is_checkpoint()) {
        delete_version(conn, scope.table, checkpoint.rowid)?;
    }
    let Some(settled) = settled else {
        return Ok(None);
    };
    if settled.version.sync_state == SyncState::NewRow {
        delete_all_versions(conn, scope.table, scope.row_id.as_str())?;
        return Ok(None);
    }

    let mut tombstone = settled.version.clone();
    tombstone.sync_state = SyncState::Deleted;
    tombstone.savepoint_timestamp = clock.next_after(latest_timestamp(&versions));
    tombstone.savepoint_creator = Some(scope.actor.user.clone());
    update_version(conn, scope.table, settled.rowid, &tombstone)?;
    Ok(Some(tombstone))
}

impl SqliteStore {
    pub fn insert_row(&mut self, request: InsertRowRequest) -> Result<RowVersion> {
        let table_id = canonicalize_table(&request.table_id)?;
        let row_id = canonicalize_row(&table_id, &request.row_id)?;
        let tx = begin_write(&mut self.conn)?;
        let table = load_user_table(&tx, &table_id)?;
        let scope = RowScope {
            table: &table,
            row_id: &row_id,
            actor: &request.actor,
        };
        let version = insert_row_tx(
            &tx,
            &mut self.clock,
            &self.config,
            scope,
            request.values,
            request.metadata,
        )?;
        tx.commit()?;
        debug!(table_id = %table_id, row_id = %row_id, sync_state = %version.sync_state, "inserted row");
        Ok(version)
    }

    /// Appends a mid-edit version. The first checkpoint of an unknown row starts it as `new_row`.
    pub fn insert_checkpoint(&mut self, request: CheckpointRequest) -> Result<RowVersion> {
        let table_id = canonicalize_table(&request.table_id)?;
        let row_id = canonicalize_row(&table_id, &request.row_id)?;
        if request.values.is_empty() {
            return Err(LifecycleError::InvalidInput(
                "a checkpoint needs at least one column value".to_string(),
            ));
        }
        let tx = begin_write(&mut self.conn)?;
        let table = load_user_table(&tx, &table_id)?;
        let scope = RowScope {
            table: &table,
            row_id: &row_id,
            actor: &request.actor,
        };
        let version = checkpoint_tx(&tx, &mut self.clock, &self.config, scope, request.values)?;
        tx.commit()?;
        debug!(table_id = %table_id, row_id = %row_id, "appended checkpoint");
        Ok(version)
    }

    /// A checkpoint collapsed straight to `COMPLETE`.
    pub fn update_row(&mut self, request: UpdateRowRequest) -> Result<RowVersion> {
        let table_id = canonicalize_table(&request.table_id)?;
        let row_id = canonicalize_row(&table_id, &request.row_id)?;
        let tx = begin_write(&mut self.conn)?;
        let table = load_user_table(&tx, &table_id)?;
        let scope = RowScope {
            table: &table,
            row_id: &row_id,
            actor: &request.actor,
        };

        let versions = scope.load(&tx)?;
        if versions.is_empty() {
            return Err(scope.not_found());
        }
        ensure_not_in_conflict(scope, &versions)?;
        if request.filter_scope.is_some() {
            let current = latest_version(scope, &versions)?.map(|stored| &stored.version);
            scope.authorize(current, RowChange::ModifyFilterScope)?;
        }

        checkpoint_tx(&tx, &mut self.clock, &self.config, scope, request.values)?;
        let mut settled = collapse_checkpoints_tx(&tx, scope, SavepointType::Complete)?;
        if let Some(filter_scope) = request.filter_scope {
            settled.version.filter_scope = filter_scope;
            update_version(&tx, &table, settled.rowid, &settled.version)?;
        }
        let version = settled.version;
        tx.commit()?;
        debug!(table_id = %table_id, row_id = %row_id, sync_state = %version.sync_state, "updated row");
        Ok(version)
    }

    pub fn save_checkpoint_as_complete(&mut self, request: RowRequest) -> Result<RowVersion> {
        self.save_checkpoint(request, SavepointType::Complete)
    }

    pub fn save_checkpoint_as_incomplete(&mut self, request: RowRequest) -> Result<RowVersion> {
        self.save_checkpoint(request, SavepointType::Incomplete)
    }

    fn save_checkpoint(
        &mut self,
        request: RowRequest,
        savepoint_type: SavepointType,
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
        let version = collapse_checkpoints_tx(&tx, scope, savepoint_type)?.version;
        tx.commit()?;
        debug!(
            table_id = %table_id,
            row_id = %row_id,
            savepoint_type = %savepoint_type,
            "saved checkpoints"
        );
        Ok(version)
    }

    /// Returns the version that is current afterwards, `None` when no version remains.
    pub fn delete_last_checkpoint(&mut self, request: RowRequest) -> Result<Option<RowVersion>> {
        self.delete_checkpoints(request, true)
    }

    pub fn delete_all_checkpoints(&mut self, request: RowRequest) -> Result<Option<RowVersion>> {
        self.delete_checkpoints(request, false)
    }

    fn delete_checkpoints(
        &mut self,
        request: RowRequest,
        only_last: bool,
    ) -> Result<Option<RowVersion>> {
        let table_id = canonicalize_table(&request.table_id)?;
        let row_id = canonicalize_row(&table_id, &request.row_id)?;
        let tx = begin_write(&mut self.conn)?;
        let table = load_user_table(&tx, &table_id)?;
        let scope = RowScope {
            table: &table,
            row_id: &row_id,
            actor: &request.actor,
        };
        let current = delete_checkpoints_tx(&tx, scope, only_last)?;
        tx.commit()?;
        debug!(table_id = %table_id, row_id = %row_id, only_last, "deleted checkpoints");
        Ok(current)
    }

    /// Returns the tombstone, or `None` when the row was removed outright.
    pub fn delete_row(&mut self, request: RowRequest) -> Result<Option<RowVersion>> {
        let table_id = canonicalize_table(&request.table_id)?;
        let row_id = canonicalize_row(&table_id, &request.row_id)?;
        let tx = begin_write(&mut self.conn)?;
        let table = load_user_table(&tx, &table_id)?;
        let scope = RowScope {
            table: &table,
            row_id: &row_id,
            actor: &request.actor,
        };
        let tombstone = delete_row_tx(&tx, &mut self.clock, scope)?;
        tx.commit()?;
        debug!(
            table_id = %table_id,
            row_id = %row_id,
            tombstoned = tombstone.is_some(),
            "deleted row"
        );
        Ok(tombstone)
    }

    /// Every version of the row the actor may see, in chain order.
    pub fn get_rows_with_id(&self, request: &RowRequest) -> Result<Vec<RowVersion>> {
        let table_id = canonicalize_table(&request.table_id)?;
        let row_id = canonicalize_row(&table_id, &request.row_id)?;
        let tx = begin_read(&self.conn)?;
        let table = load_user_table(&tx, &table_id)?;
        let versions = load_versions(&tx, &table, row_id.as_str())?;
        Ok(versions
            .into_iter()
            .map(|stored| stored.version)
            .filter(|version| table.security.is_visible(&request.actor, access_state(version)))
            .collect())
    }

    pub fn get_most_recent_row_with_id(&self, request: &RowRequest) -> Result<Option<RowVersion>> {
        let table_id = canonicalize_table(&request.table_id)?;
        let row_id = canonicalize_row(&table_id, &request.row_id)?;
        let tx = begin_read(&self.conn)?;
        let table = load_user_table(&tx, &table_id)?;
        let scope = RowScope {
            table: &table,
            row_id: &row_id,
            actor: &request.actor,
        };
        let versions = scope.load(&tx)?;
        ensure_not_in_conflict(scope, &versions)?;
        Ok(latest_version(scope, &versions)?
            .map(|stored| stored.version.clone())
            .filter(|version| table.security.is_visible(&request.actor, access_state(version))))
    }

    /// Sync state of the settled versions; a pure checkpoint chain reports its own state.
    pub fn get_sync_state(&self, table_id: &str, row_id: &str) -> Result<Option<SyncState>> {
        let table_id = canonicalize_table(table_id)?;
        let row_id = canonicalize_row(&table_id, row_id)?;
        let tx = begin_read(&self.conn)?;
        let table = load_user_table(&tx, &table_id)?;
        let versions = load_versions(&tx, &table, row_id.as_str())?;

        let settled: Vec<SyncState> = versions
            .iter()
            .filter(|stored| !stored.version.is_checkpoint())
            .map(|stored| stored.version.sync_state)
            .collect();
        let states = if settled.is_empty() {
            versions
                .iter()
                .map(|stored| stored.version.sync_state)
                .collect()
        } else {
            settled
        };
        let Some(first) = states.first().copied() else {
            return Ok(None);
        };
        if states.iter().any(|state| *state != first) {
            return Err(LifecycleError::illegal_state(
                table_id.as_str(),
                row_id.as_str(),
                "versions disagree on sync state",
            ));
        }
        Ok(Some(first))
    }

    pub fn table_health(&self, table_id: &str) -> Result<TableHealth> {
        let table_id = canonicalize_table(table_id)?;
        let tx = begin_read(&self.conn)?;
        let table = load_user_table(&tx, &table_id)?;
        let name = quote_ident(table.table_id.as_str());
        let checkpoints: i64 = tx.query_row(
            &format!("SELECT COUNT(1) FROM {name} WHERE _savepoint_type IS NULL"),
            [],
            |row| row.get(0),
        )?;
        let conflicts: i64 = tx.query_row(
            &format!("SELECT COUNT(1) FROM {name} WHERE _conflict_type IS NOT NULL"),
            [],
            |row| row.get(0),
        )?;
        Ok(TableHealth::from_counts(
            u64::try_from(checkpoints).unwrap_or_default(),
            u64::try_from(conflicts).unwrap_or_default(),
        ))
    }
}
