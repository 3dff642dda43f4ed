#![forbid(unsafe_code)]

use super::error::{LifecycleError, Result};
use super::kvs::{load_security_settings, put_entry_tx, security_entries};
use super::requests::CreateTableRequest;
use super::sql::{create_data_table_sql, quote_ident};
use super::{SqliteStore, begin_read, begin_write, canonicalize_table, now_ms};
use odt_core::ids::TableId;
use odt_core::{
    Column, ConflictType, OrderedColumns, SchemaValidationError, SyncState, TableSecuritySettings,
    validate_columns,
};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Everything a row operation needs to know about its table.
#[derive(Clone, Debug)]
pub(crate) struct UserTable {
    pub(crate) table_id: TableId,
    pub(crate) columns: OrderedColumns,
    pub(crate) security: TableSecuritySettings,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub table_id: String,
    /// Changes whenever table metadata is replaced.
    pub rev_id: String,
    pub schema_etag: Option<String>,
    pub last_data_etag: Option<String>,
    /// Milliseconds since the epoch, `-1` when never synced.
    pub last_sync_time: i64,
}

impl SqliteStore {
    /// Creates the table when it does not exist yet; otherwise checks the stored column list
    /// matches and returns it.
    pub fn create_or_open_table(&mut self, request: CreateTableRequest) -> Result<OrderedColumns> {
        let table_id = canonicalize_table(&request.table_id)?;
        let columns = validate_columns(&request.columns)?;

        let tx = begin_write(&mut self.conn)?;
        if table_definition_tx(&tx, &table_id)?.is_some() {
            let stored = load_user_table(&tx, &table_id)?;
            if stored.columns.columns() != columns.columns() {
                return Err(SchemaValidationError::SchemaMismatch {
                    table_id: table_id.into_string(),
                }
                .into());
            }
            debug!(table_id = %table_id, "opened existing table");
            return Ok(stored.columns);
        }

        tx.execute(
            "INSERT INTO _table_definitions(table_id, rev_id, schema_etag, last_data_etag, last_sync_time) \
             VALUES (?1, ?2, NULL, NULL, -1)",
            params![table_id.as_str(), new_rev_id()],
        )?;
        for column in columns.columns() {
            tx.execute(
                "INSERT INTO _column_definitions(table_id, element_key, element_name, element_type, list_child_element_keys) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    table_id.as_str(),
                    column.element_key,
                    column.element_name,
                    column.element_type,
                    serde_json::to_string(&column.list_child_element_keys)?,
                ],
            )?;
        }

        let table = UserTable {
            table_id: table_id.clone(),
            columns,
            security: TableSecuritySettings {
                table_id: table_id.as_str().to_string(),
                locked: request.locked,
                unverified_user_can_create: request.unverified_user_can_create,
                filter_type_on_creation: request.filter_type_on_creation,
            },
        };
        tx.execute_batch(&create_data_table_sql(&table))?;

        for entry in security_entries(&table.security)
            .into_iter()
            .chain(request.metadata)
        {
            if entry.table_id != table_id.as_str() {
                return Err(odt_core::KvsError::TableMismatch {
                    table_id: table_id.as_str().to_string(),
                    entry_table: entry.table_id,
                }
                .into());
            }
            put_entry_tx(&tx, entry)?;
        }

        tx.commit()?;
        info!(
            table_id = %table.table_id,
            columns = table.columns.len(),
            locked = table.security.locked,
            "created table"
        );
        Ok(table.columns)
    }

    pub fn delete_table_and_all_data(&mut self, table_id: &str) -> Result<()> {
        let table_id = canonicalize_table(table_id)?;
        let tx = begin_write(&mut self.conn)?;
        if table_definition_tx(&tx, &table_id)?.is_none() {
            return Err(LifecycleError::table_not_found(table_id.as_str()));
        }
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {};",
            quote_ident(table_id.as_str())
        ))?;
        tx.execute(
            "DELETE FROM _table_definitions WHERE table_id=?1",
            params![table_id.as_str()],
        )?;
        tx.commit()?;
        info!(table_id = %table_id, "deleted table and all data");
        Ok(())
    }

    pub fn get_all_table_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT table_id FROM _table_definitions ORDER BY table_id ASC")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get::<_, String>(0)?);
        }
        Ok(out)
    }

    pub fn has_table_id(&self, table_id: &str) -> Result<bool> {
        let Ok(table_id) = TableId::try_new(table_id) else {
            return Ok(false);
        };
        Ok(table_definition_tx(&self.conn, &table_id)?.is_some())
    }

    pub fn get_table_definition(&self, table_id: &str) -> Result<TableDefinition> {
        let table_id = canonicalize_table(table_id)?;
        table_definition_tx(&self.conn, &table_id)?
            .ok_or_else(|| LifecycleError::table_not_found(table_id.as_str()))
    }

    pub fn get_ordered_columns(&self, table_id: &str) -> Result<OrderedColumns> {
        let table_id = canonicalize_table(table_id)?;
        let tx = begin_read(&self.conn)?;
        Ok(load_user_table(&tx, &table_id)?.columns)
    }

    pub fn privileged_update_table_etags(
        &mut self,
        table_id: &str,
        schema_etag: Option<&str>,
        last_data_etag: Option<&str>,
    ) -> Result<()> {
        let table_id = canonicalize_table(table_id)?;
        let tx = begin_write(&mut self.conn)?;
        let updated = tx.execute(
            "UPDATE _table_definitions SET schema_etag=?2, last_data_etag=?3 WHERE table_id=?1",
            params![table_id.as_str(), schema_etag, last_data_etag],
        )?;
        if updated == 0 {
            return Err(LifecycleError::table_not_found(table_id.as_str()));
        }
        tx.commit()?;
        debug!(table_id = %table_id, "updated table etags");
        Ok(())
    }

    pub fn privileged_update_table_last_sync_time(&mut self, table_id: &str) -> Result<()> {
        let table_id = canonicalize_table(table_id)?;
        let tx = begin_write(&mut self.conn)?;
        let updated = tx.execute(
            "UPDATE _table_definitions SET last_sync_time=?2 WHERE table_id=?1",
            params![table_id.as_str(), now_ms()],
        )?;
        if updated == 0 {
            return Err(LifecycleError::table_not_found(table_id.as_str()));
        }
        tx.commit()?;
        Ok(())
    }

    /// Resets sync bookkeeping when the server's schema etag moved. Returns `false` when the
    /// etag is unchanged and nothing was touched.
    pub fn server_table_schema_etag_changed(
        &mut self,
        table_id: &str,
        new_schema_etag: &str,
    ) -> Result<bool> {
        let table_id = canonicalize_table(table_id)?;
        let tx = begin_write(&mut self.conn)?;
        let definition = table_definition_tx(&tx, &table_id)?
            .ok_or_else(|| LifecycleError::table_not_found(table_id.as_str()))?;
        if definition.schema_etag.as_deref() == Some(new_schema_etag) {
            return Ok(false);
        }

        let name = quote_ident(table_id.as_str());
        tx.execute(
            &format!("DELETE FROM {name} WHERE _conflict_type IN (?1, ?2)"),
            params![
                ConflictType::ServerDeletedOldValues.code(),
                ConflictType::ServerUpdatedUpdatedValues.code()
            ],
        )?;
        for (conflict, restored) in [
            (ConflictType::LocalDeletedOldValues, SyncState::Deleted),
            (ConflictType::LocalUpdatedUpdatedValues, SyncState::Changed),
        ] {
            tx.execute(
                &format!("UPDATE {name} SET _sync_state=?1, _conflict_type=NULL WHERE _conflict_type=?2"),
                params![restored.as_str(), conflict.code()],
            )?;
        }
        tx.execute(
            &format!(
                "UPDATE {name} SET _sync_state=?1, _row_etag=NULL WHERE _sync_state IN (?2, ?3)"
            ),
            params![
                SyncState::NewRow.as_str(),
                SyncState::Synced.as_str(),
                SyncState::SyncedPendingFiles.as_str()
            ],
        )?;
        tx.execute(
            "UPDATE _table_definitions SET schema_etag=?2, last_data_etag=NULL WHERE table_id=?1",
            params![table_id.as_str(), new_schema_etag],
        )?;
        tx.commit()?;
        info!(
            table_id = %table_id,
            previous = definition.schema_etag.as_deref().unwrap_or("<none>"),
            current = new_schema_etag,
            "server schema etag changed; sync state reset"
        );
        Ok(true)
    }
}

pub(crate) fn table_definition_tx(
    conn: &Connection,
    table_id: &TableId,
) -> Result<Option<TableDefinition>> {
    let definition = conn
        .query_row(
            "SELECT table_id, rev_id, schema_etag, last_data_etag, last_sync_time \
             FROM _table_definitions WHERE table_id=?1",
            params![table_id.as_str()],
            |row| {
                Ok(TableDefinition {
                    table_id: row.get(0)?,
                    rev_id: row.get(1)?,
                    schema_etag: row.get(2)?,
                    last_data_etag: row.get(3)?,
                    last_sync_time: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(definition)
}

pub(crate) fn load_user_table(conn: &Connection, table_id: &TableId) -> Result<UserTable> {
    if table_definition_tx(conn, table_id)?.is_none() {
        return Err(LifecycleError::table_not_found(table_id.as_str()));
    }

    let mut stmt = conn.prepare(
        "SELECT element_key, element_name, element_type, list_child_element_keys \
         FROM _column_definitions WHERE table_id=?1 ORDER BY element_key ASC",
    )?;
    let mut rows = stmt.query(params![table_id.as_str()])?;
    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        let children: String = row.get(3)?;
        columns.push(Column {
            element_key: row.get(0)?,
            element_name: row.get(1)?,
            element_type: row.get(2)?,
            list_child_element_keys: serde_json::from_str(&children)?,
        });
    }

    Ok(UserTable {
        table_id: table_id.clone(),
        columns: validate_columns(&columns)?,
        security: load_security_settings(conn, table_id)?,
    })
}

pub(crate) fn bump_rev_id_tx(conn: &Connection, table_id: &TableId) -> Result<()> {
    conn.execute(
        "UPDATE _table_definitions SET rev_id=?2 WHERE table_id=?1",
        params![table_id.as_str(), new_rev_id()],
    )?;
    Ok(())
}

fn new_rev_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
