#![forbid(unsafe_code)]

//! Sync-engine entry points. They bypass row authorization; callers are trusted.

use super::is_in_conflict;
use crate::store::error::{LifecycleError, Result};
use crate::store::sql::{
    check_user_values, delete_all_versions, insert_version, load_versions, update_version,
};
use crate::store::tables::load_user_table;
use crate::store::{SqliteStore, begin_write, canonicalize_row, canonicalize_table};
use odt_core::{RowVersion, ServerRow, SyncState, references_attachments};
use tracing::debug;

impl SqliteStore {
    /// Inserts a row exactly as the server supplied it.
    pub fn privileged_insert_row(&mut self, table_id: &str, server: &ServerRow) -> Result<RowVersion> {
        let table_id = canonicalize_table(table_id)?;
        let row_id = canonicalize_row(&table_id, &server.row_id)?;
        if server.deleted {
            return Err(LifecycleError::InvalidInput(format!(
                "server row `{row_id}` is deleted and cannot be inserted"
            )));
        }

        let tx = begin_write(&mut self.conn)?;
        let table = load_user_table(&tx, &table_id)?;
        check_user_values(&table, &server.values)?;
        if !load_versions(&tx, &table, row_id.as_str())?.is_empty() {
            return Err(LifecycleError::illegal_state(
                table_id.as_str(),
                row_id.as_str(),
                "row already exists",
            ));
        }

        let sync_state = if references_attachments(&server.values, &table.columns) {
            SyncState::SyncedPendingFiles
        } else {
            SyncState::Synced
        };
        let mut version = server.to_version(sync_state, None);
        version.savepoint_timestamp = self
            .clock
            .supplied_or_next(Some(&server.savepoint_timestamp))?;
        version.values.retain(|_, value| !value.is_null());
        insert_version(&tx, &table, &version)?;
        tx.commit()?;
        debug!(table_id = %table_id, row_id = %row_id, sync_state = %sync_state, "inserted server row");
        Ok(version)
    }

    /// Stamps the settled version with the etag and state a sync exchange produced.
    pub fn privileged_update_row_etag_and_sync_state(
        &mut self,
        table_id: &str,
        row_id: &str,
        row_etag: Option<&str>,
        sync_state: SyncState,
    ) -> Result<()> {
        let table_id = canonicalize_table(table_id)?;
        let row_id = canonicalize_row(&table_id, row_id)?;
        if sync_state == SyncState::InConflict {
            return Err(LifecycleError::InvalidInput(
                "conflicts are placed through place_row_into_conflict_or_sync".to_string(),
            ));
        }

        let tx = begin_write(&mut self.conn)?;
        let table = load_user_table(&tx, &table_id)?;
        let versions = load_versions(&tx, &table, row_id.as_str())?;
        if versions.is_empty() {
            return Err(LifecycleError::row_not_found(table_id.as_str(), row_id.as_str()));
        }
        if is_in_conflict(&versions) {
            return Err(LifecycleError::illegal_state(
                table_id.as_str(),
                row_id.as_str(),
                "row is in conflict",
            ));
        }
        for stored in versions.iter().filter(|stored| !stored.version.is_checkpoint()) {
            let mut version = stored.version.clone();
            version.row_etag = row_etag.map(str::to_string);
            version.sync_state = sync_state;
            update_version(&tx, &table, stored.rowid, &version)?;
        }
        tx.commit()?;
        debug!(table_id = %table_id, row_id = %row_id, sync_state = %sync_state, "updated row etag");
        Ok(())
    }

    /// Removes every version of the row, tombstone or not.
    pub fn privileged_delete_row(&mut self, table_id: &str, row_id: &str) -> Result<()> {
        let table_id = canonicalize_table(table_id)?;
        let row_id = canonicalize_row(&table_id, row_id)?;
        let tx = begin_write(&mut self.conn)?;
        let table = load_user_table(&tx, &table_id)?;
        if delete_all_versions(&tx, &table, row_id.as_str())? == 0 {
            return Err(LifecycleError::row_not_found(table_id.as_str(), row_id.as_str()));
        }
        tx.commit()?;
        debug!(table_id = %table_id, row_id = %row_id, "physically deleted row");
        Ok(())
    }
}
