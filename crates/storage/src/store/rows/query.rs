#![forbid(unsafe_code)]

use super::access_state;
use crate::store::error::{LifecycleError, Result};
use crate::store::requests::RowQuery;
use crate::store::sql::{StoredVersion, select_versions};
use crate::store::tables::{UserTable, load_user_table};
use crate::store::{SqliteStore, begin_read, canonicalize_table};
use odt_core::{AccessContext, Actor, EffectiveAccess, RowVersion, admin_columns};
use rusqlite::ToSql;

/// One result row; `effective_access` is present when the access context asks for it.
#[derive(Clone, Debug, PartialEq)]
pub struct QueriedRow {
    pub version: RowVersion,
    pub effective_access: Option<EffectiveAccess>,
}

/// Finite, restartable result set. Rows are owned by the cursor, so it holds no connection.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RowCursor {
    rows: Vec<QueriedRow>,
    position: usize,
}

impl RowCursor {
    fn new(rows: Vec<QueriedRow>) -> Self {
        Self { rows, position: 0 }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rewind(&mut self) {
        self.position = 0;
    }

    pub fn rows(&self) -> &[QueriedRow] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<QueriedRow> {
        self.rows
    }
}

impl Iterator for RowCursor {
    type Item = QueriedRow;

    fn next(&mut self) -> Option<Self::Item> {
        let row = self.rows.get(self.position)?.clone();
        self.position += 1;
        Some(row)
    }
}

impl SqliteStore {
    pub fn get_access_context<S: AsRef<str>>(
        &self,
        table_id: &str,
        actor: &Actor,
        projection: Option<&[S]>,
    ) -> Result<AccessContext> {
        let table_id = canonicalize_table(table_id)?;
        let tx = begin_read(&self.conn)?;
        let table = load_user_table(&tx, &table_id)?;
        Ok(table.security.access_context(actor, projection))
    }

    /// Versions the actor may see, in row id then chain order. A projection narrows the user
    /// values each row carries; metadata is always returned.
    pub fn query_rows(&self, query: &RowQuery) -> Result<RowCursor> {
        let table_id = canonicalize_table(&query.table_id)?;
        let tx = begin_read(&self.conn)?;
        let table = load_user_table(&tx, &table_id)?;
        if let Some(projection) = &query.projection {
            check_projection(&table, projection)?;
        }
        let context = table
            .security
            .access_context(&query.actor, query.projection.as_deref());

        let sync_state = query.sync_state.map(|state| state.as_str());
        let args: [&dyn ToSql; 2] = [&query.row_id, &sync_state];
        let versions = select_versions(
            &tx,
            &table,
            "(?1 IS NULL OR _id = ?1) AND (?2 IS NULL OR _sync_state = ?2)",
            &args,
        )?;

        let limit = query.limit.unwrap_or(usize::MAX);
        let rows = versions
            .into_iter()
            .filter(|stored| {
                table
                    .security
                    .is_visible(&query.actor, access_state(&stored.version))
            })
            .take(limit)
            .map(|stored| project_row(&table, query, &context, stored))
            .collect();
        Ok(RowCursor::new(rows))
    }
}

fn check_projection(table: &UserTable, projection: &[String]) -> Result<()> {
    for name in projection {
        let known = admin_columns::is_admin_column(name)
            || table
                .columns
                .find(name)
                .is_some_and(|cd| cd.is_unit_of_retention());
        if !known {
            return Err(LifecycleError::InvalidInput(format!(
                "unknown column `{name}` in projection of `{}`",
                table.table_id
            )));
        }
    }
    Ok(())
}

fn project_row(
    table: &UserTable,
    query: &RowQuery,
    context: &AccessContext,
    stored: StoredVersion,
) -> QueriedRow {
    let mut version = stored.version;
    if let Some(projection) = &query.projection {
        version
            .values
            .retain(|key, _| projection.iter().any(|name| name == key));
    }
    let effective_access = context
        .requires_effective_access_column
        .then(|| table.security.effective_access(&query.actor, access_state(&version)));
    QueriedRow {
        version,
        effective_access,
    }
}
