#![forbid(unsafe_code)]

use super::error::{LifecycleError, Result};
use super::tables::UserTable;
use odt_core::{
    ColumnDefinition, ColumnValue, ConflictType, ElementDataType, FilterType, RowFilterScope,
    RowValues, RowVersion, SavepointType, SyncState, admin_columns,
};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, ToSql, params, params_from_iter};

/// A version together with the SQLite rowid that addresses it inside the chain.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct StoredVersion {
    pub(crate) rowid: i64,
    pub(crate) version: RowVersion,
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) fn create_data_table_sql(table: &UserTable) -> String {
    let mut columns = vec![
        format!("{} TEXT NOT NULL", admin_columns::ID),
        format!("{} TEXT", admin_columns::ROW_ETAG),
        format!("{} TEXT NOT NULL", admin_columns::SYNC_STATE),
        format!("{} INTEGER", admin_columns::CONFLICT_TYPE),
        format!("{} TEXT NOT NULL", admin_columns::FILTER_TYPE),
        format!("{} TEXT", admin_columns::FILTER_VALUE),
        format!("{} TEXT", admin_columns::FORM_ID),
        format!("{} TEXT", admin_columns::LOCALE),
        format!("{} TEXT", admin_columns::SAVEPOINT_TYPE),
        format!("{} TEXT NOT NULL", admin_columns::SAVEPOINT_TIMESTAMP),
        format!("{} TEXT", admin_columns::SAVEPOINT_CREATOR),
    ];
    for cd in table.columns.retention_columns() {
        columns.push(format!(
            "{} {}",
            quote_ident(cd.element_key()),
            cd.data_type().sql_type()
        ));
    }
    let table_name = quote_ident(table.table_id.as_str());
    format!(
        "CREATE TABLE IF NOT EXISTS {table_name} ({});\n\
         CREATE INDEX IF NOT EXISTS {} ON {table_name}({}, {});",
        columns.join(", "),
        quote_ident(&format!("{}_id_idx", table.table_id.as_str())),
        admin_columns::ID,
        admin_columns::SAVEPOINT_TIMESTAMP,
    )
}

fn select_list(table: &UserTable) -> String {
    let mut names: Vec<String> = std::iter::once("rowid".to_string())
        .chain(admin_columns::STORED.iter().map(|name| name.to_string()))
        .collect();
    names.extend(
        table
            .columns
            .retention_columns()
            .map(|cd| quote_ident(cd.element_key())),
    );
    names.join(", ")
}

/// Versions matching `filter` (a SQL predicate over the data table), in chain order.
pub(crate) fn select_versions(
    conn: &Connection,
    table: &UserTable,
    filter: &str,
    args: &[&dyn ToSql],
) -> Result<Vec<StoredVersion>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE {filter} ORDER BY {}, {} ASC, rowid ASC",
        select_list(table),
        quote_ident(table.table_id.as_str()),
        admin_columns::ID,
        admin_columns::SAVEPOINT_TIMESTAMP,
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(args)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(decode_version(table, row)?);
    }
    Ok(out)
}

pub(crate) fn load_versions(
    conn: &Connection,
    table: &UserTable,
    row_id: &str,
) -> Result<Vec<StoredVersion>> {
    select_versions(conn, table, "_id = ?1", params![row_id])
}

fn decode_version(table: &UserTable, row: &rusqlite::Row<'_>) -> Result<StoredVersion> {
    let rowid: i64 = row.get(0)?;
    let sync_state: SyncState = row.get::<_, String>(3)?.parse()?;
    let conflict_type = match row.get::<_, Option<i64>>(4)? {
        Some(code) => Some(ConflictType::try_from(code)?),
        None => None,
    };
    let filter_type: FilterType = row.get::<_, String>(5)?.parse()?;
    let savepoint_type = match row.get::<_, Option<String>>(9)? {
        Some(raw) => Some(raw.parse::<SavepointType>()?),
        None => None,
    };

    let mut values = RowValues::new();
    let first_user_column = 1 + admin_columns::STORED.len();
    for (offset, cd) in table.columns.retention_columns().enumerate() {
        let value = from_sql_value(cd, row.get_ref(first_user_column + offset)?);
        if !value.is_null() {
            values.insert(cd.element_key().to_string(), value);
        }
    }

    Ok(StoredVersion {
        rowid,
        version: RowVersion {
            row_id: row.get(1)?,
            row_etag: row.get(2)?,
            sync_state,
            conflict_type,
            filter_scope: RowFilterScope {
                filter_type,
                filter_value: row.get(6)?,
            },
            form_id: row.get(7)?,
            locale: row.get(8)?,
            savepoint_type,
            savepoint_timestamp: row.get(10)?,
            savepoint_creator: row.get(11)?,
            values,
        },
    })
}

fn version_params(table: &UserTable, version: &RowVersion) -> Result<Vec<Value>> {
    let mut out = vec![
        Value::Text(version.row_id.clone()),
        optional_text(version.row_etag.as_deref()),
        Value::Text(version.sync_state.as_str().to_string()),
        version
            .conflict_type
            .map_or(Value::Null, |conflict| Value::Integer(conflict.code())),
        Value::Text(version.filter_scope.filter_type.as_str().to_string()),
        optional_text(version.filter_scope.filter_value.as_deref()),
        optional_text(version.form_id.as_deref()),
        optional_text(version.locale.as_deref()),
        optional_text(version.savepoint_type.map(SavepointType::as_str)),
        Value::Text(version.savepoint_timestamp.clone()),
        optional_text(version.savepoint_creator.as_deref()),
    ];
    for cd in table.columns.retention_columns() {
        out.push(to_sql_value(table, cd, version.value(cd.element_key()))?);
    }
    Ok(out)
}

fn optional_text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |value| Value::Text(value.to_string()))
}

fn stored_column_names(table: &UserTable) -> Vec<String> {
    admin_columns::STORED
        .iter()
        .map(|name| name.to_string())
        .chain(
            table
                .columns
                .retention_columns()
                .map(|cd| quote_ident(cd.element_key())),
        )
        .collect()
}

pub(crate) fn insert_version(
    conn: &Connection,
    table: &UserTable,
    version: &RowVersion,
) -> Result<i64> {
    let names = stored_column_names(table);
    let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table.table_id.as_str()),
        names.join(", "),
        placeholders.join(", ")
    );
    conn.execute(&sql, params_from_iter(version_params(table, version)?))?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn update_version(
    conn: &Connection,
    table: &UserTable,
    rowid: i64,
    version: &RowVersion,
) -> Result<()> {
    let names = stored_column_names(table);
    let assignments: Vec<String> = names
        .iter()
        .enumerate()
        .map(|(i, name)| format!("{name} = ?{}", i + 1))
        .collect();
    let mut args = version_params(table, version)?;
    args.push(Value::Integer(rowid));
    let sql = format!(
        "UPDATE {} SET {} WHERE rowid = ?{}",
        quote_ident(table.table_id.as_str()),
        assignments.join(", "),
        args.len()
    );
    conn.execute(&sql, params_from_iter(args))?;
    Ok(())
}

pub(crate) fn delete_version(conn: &Connection, table: &UserTable, rowid: i64) -> Result<()> {
    conn.execute(
        &format!(
            "DELETE FROM {} WHERE rowid = ?1",
            quote_ident(table.table_id.as_str())
        ),
        params![rowid],
    )?;
    Ok(())
}

pub(crate) fn delete_all_versions(conn: &Connection, table: &UserTable, row_id: &str) -> Result<usize> {
    let deleted = conn.execute(
        &format!(
            "DELETE FROM {} WHERE _id = ?1",
            quote_ident(table.table_id.as_str())
        ),
        params![row_id],
    )?;
    Ok(deleted)
}

/// Rejects metadata keys and keys that are not persisted user columns, and checks every value
/// converts to its column's storage type.
pub(crate) fn check_user_values(table: &UserTable, values: &RowValues) -> Result<()> {
    for (key, value) in values {
        if key.starts_with('_') || admin_columns::is_admin_column(key) {
            return Err(LifecycleError::InvalidInput(format!(
                "`{key}` is a reserved metadata column of table `{}`",
                table.table_id
            )));
        }
        let Some(cd) = table
            .columns
            .find(key)
            .filter(|cd| cd.is_unit_of_retention())
        else {
            return Err(LifecycleError::InvalidInput(format!(
                "`{key}` is not a stored column of table `{}`",
                table.table_id
            )));
        };
        to_sql_value(table, cd, value)?;
    }
    Ok(())
}

fn to_sql_value(table: &UserTable, cd: &ColumnDefinition, value: &ColumnValue) -> Result<Value> {
    let mismatch = || {
        LifecycleError::InvalidInput(format!(
            "value for `{}` in table `{}` is not a valid {}",
            cd.element_key(),
            table.table_id,
            cd.data_type().as_str()
        ))
    };
    let converted = match (cd.data_type(), value) {
        (_, ColumnValue::Null) => Value::Null,
        (ElementDataType::Integer, ColumnValue::Integer(v)) => Value::Integer(*v),
        (ElementDataType::Integer, ColumnValue::Bool(v)) => Value::Integer(i64::from(*v)),
        (ElementDataType::Integer, ColumnValue::Number(v)) => {
            if v.fract() != 0.0 || !v.is_finite() {
                return Err(mismatch());
            }
            Value::Integer(*v as i64)
        }
        (ElementDataType::Integer, ColumnValue::Text(v)) => {
            Value::Integer(v.trim().parse::<i64>().map_err(|_| mismatch())?)
        }
        (ElementDataType::Bool, ColumnValue::Bool(v)) => Value::Integer(i64::from(*v)),
        (ElementDataType::Bool, ColumnValue::Integer(v)) => Value::Integer(i64::from(*v != 0)),
        (ElementDataType::Bool, ColumnValue::Text(v)) => match v.trim() {
            "1" | "true" | "TRUE" | "True" => Value::Integer(1),
            "0" | "false" | "FALSE" | "False" => Value::Integer(0),
            _ => return Err(mismatch()),
        },
        (ElementDataType::Bool, ColumnValue::Number(_)) => return Err(mismatch()),
        (ElementDataType::Number, ColumnValue::Number(v)) => Value::Real(*v),
        (ElementDataType::Number, ColumnValue::Integer(v)) => Value::Real(*v as f64),
        (ElementDataType::Number, ColumnValue::Text(v)) => {
            Value::Real(v.trim().parse::<f64>().map_err(|_| mismatch())?)
        }
        (ElementDataType::Number, ColumnValue::Bool(_)) => return Err(mismatch()),
        (_, other) => match other.to_canonical_string() {
            Some(text) => Value::Text(text),
            None => Value::Null,
        },
    };
    Ok(converted)
}

fn from_sql_value(cd: &ColumnDefinition, value: ValueRef<'_>) -> ColumnValue {
    match (cd.data_type(), value) {
        (_, ValueRef::Null) => ColumnValue::Null,
        (ElementDataType::Bool, ValueRef::Integer(v)) => ColumnValue::Bool(v != 0),
        (ElementDataType::Number, ValueRef::Integer(v)) => ColumnValue::Number(v as f64),
        (_, ValueRef::Integer(v)) => ColumnValue::Integer(v),
        (_, ValueRef::Real(v)) => ColumnValue::Number(v),
        (_, ValueRef::Text(bytes)) | (_, ValueRef::Blob(bytes)) => {
            ColumnValue::Text(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}
