#![forbid(unsafe_code)]

mod clock;
mod config;
mod conflicts;
mod error;
mod kvs;
mod requests;
mod rows;
mod sql;
mod tables;

pub use config::StoreConfig;
pub use error::{LifecycleError, Result};
pub use requests::*;
pub use rows::{QueriedRow, RowCursor};
pub use tables::TableDefinition;

use clock::SavepointClock;
use error::row_id_error;
use odt_core::ids::{RowId, TableId};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;

const SCHEMA_VERSION: i64 = 1;

const SYSTEM_TABLES: [&str; 5] = [
    "_store_state",
    "_table_definitions",
    "_column_definitions",
    "_key_value_store_active",
    "_choice_lists",
];

/// One connection to an app's row database. Every public operation runs in its own
/// transaction; the connection is released when the store is dropped.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    storage_dir: PathBuf,
    config: StoreConfig,
    clock: SavepointClock,
}

impl SqliteStore {
    pub fn open(storage_dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(storage_dir, StoreConfig::default())
    }

    pub fn open_with_config(storage_dir: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let storage_dir = storage_dir.as_ref().to_path_buf();
        let app_dir = storage_dir.join(&config.app_name);
        std::fs::create_dir_all(&app_dir)?;

        let db_path = app_dir.join(&config.db_file_name);
        let conn = Connection::open(&db_path)?;
        conn.busy_timeout(config.busy_timeout())?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        preflight_gate(&conn)?;
        install_schema(&conn, &config)?;
        debug!(app_name = %config.app_name, path = %db_path.display(), "opened row store");

        Ok(Self {
            conn,
            storage_dir,
            config,
            clock: SavepointClock::default(),
        })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}

/// Writers take the database lock up front so concurrent mutators of a row serialize.
fn begin_write(conn: &mut Connection) -> Result<Transaction<'_>> {
    Ok(conn.transaction_with_behavior(TransactionBehavior::Immediate)?)
}

/// Multi-statement reads observe one committed snapshot.
fn begin_read(conn: &Connection) -> Result<Transaction<'_>> {
    Ok(conn.unchecked_transaction()?)
}

fn preflight_gate(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
    )?;
    let mut rows = stmt.query([])?;
    let mut tables = BTreeSet::new();
    while let Some(row) = rows.next()? {
        tables.insert(row.get::<_, String>(0)?);
    }

    if tables.is_empty() {
        return Ok(());
    }

    let required: BTreeSet<&str> = SYSTEM_TABLES.into_iter().collect();
    if tables
        .iter()
        .any(|table| table.starts_with('_') && !required.contains(table.as_str()))
    {
        return Err(reset_required("unsupported tables detected"));
    }
    for table in required {
        if !tables.contains(table) {
            return Err(reset_required("required table is missing"));
        }
    }

    let version = conn
        .query_row(
            "SELECT schema_version FROM _store_state WHERE singleton=1",
            [],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    match version {
        Some(v) if v == SCHEMA_VERSION => {}
        Some(_) => return Err(reset_required("schema version mismatch")),
        None => return Err(reset_required("schema state row is missing")),
    }

    for table in tables.iter().filter(|table| !table.starts_with('_')) {
        let registered = conn
            .query_row(
                "SELECT 1 FROM _table_definitions WHERE table_id=?1",
                params![table],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .is_some();
        if !registered {
            return Err(reset_required("unregistered data table detected"));
        }
    }
    Ok(())
}

fn reset_required(reason: &str) -> LifecycleError {
    LifecycleError::Config(format!("RESET_REQUIRED: {reason}"))
}

fn install_schema(conn: &Connection, config: &StoreConfig) -> Result<()> {
    let now_ms = now_ms();

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS _store_state (
          singleton INTEGER PRIMARY KEY CHECK(singleton = 1),
          schema_version INTEGER NOT NULL,
          app_name TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS _table_definitions (
          table_id TEXT PRIMARY KEY,
          rev_id TEXT NOT NULL,
          schema_etag TEXT,
          last_data_etag TEXT,
          last_sync_time INTEGER NOT NULL DEFAULT -1
        );

        CREATE TABLE IF NOT EXISTS _column_definitions (
          table_id TEXT NOT NULL,
          element_key TEXT NOT NULL,
          element_name TEXT NOT NULL,
          element_type TEXT NOT NULL,
          list_child_element_keys TEXT NOT NULL,
          PRIMARY KEY(table_id, element_key),
          FOREIGN KEY(table_id) REFERENCES _table_definitions(table_id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS _key_value_store_active (
          _table_id TEXT NOT NULL,
          _partition TEXT NOT NULL,
          _aspect TEXT NOT NULL,
          _key TEXT NOT NULL,
          _type TEXT,
          _value TEXT,
          PRIMARY KEY(_table_id, _partition, _aspect, _key),
          FOREIGN KEY(_table_id) REFERENCES _table_definitions(table_id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS _choice_lists (
          choice_list_id TEXT PRIMARY KEY,
          choice_list_json TEXT NOT NULL
        );
        "#,
    )?;

    conn.execute(
        "INSERT INTO _store_state(singleton, schema_version, app_name, created_at_ms, updated_at_ms) \
         VALUES (1, ?1, ?2, ?3, ?3) \
         ON CONFLICT(singleton) DO UPDATE SET updated_at_ms=excluded.updated_at_ms",
        params![SCHEMA_VERSION, config.app_name, now_ms],
    )?;
    Ok(())
}

fn canonicalize_table(value: &str) -> Result<TableId> {
    Ok(TableId::try_new(value)?)
}

fn canonicalize_row(table_id: &TableId, value: &str) -> Result<RowId> {
    RowId::try_new(value).map_err(|err| row_id_error(table_id.as_str(), value, err))
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration,
        Err(_) => return 0,
    };

    i64::try_from(now.as_millis()).unwrap_or(i64::MAX)
}
