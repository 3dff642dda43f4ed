#![forbid(unsafe_code)]

use super::error::{LifecycleError, Result};
use super::requests::MetadataFilter;
use super::tables::{bump_rev_id_tx, table_definition_tx};
use super::{SqliteStore, begin_write, canonicalize_table};
use odt_core::ids::TableId;
use odt_core::{
    ElementDataType, FilterType, KeyValueStoreEntry, KvsError, PARTITION_TABLE,
    TableSecuritySettings, normalize_entry, parse_bool_value, security,
};
use rusqlite::{Connection, OptionalExtension, params};
use sha2::Digest;
use std::fmt::Write as _;
use tracing::{debug, warn};

impl SqliteStore {
    /// Writes `entries` for one table, optionally clearing every existing entry first.
    pub fn replace_table_metadata(
        &mut self,
        table_id: &str,
        entries: Vec<KeyValueStoreEntry>,
        clear_all_first: bool,
    ) -> Result<()> {
        let table_id = canonicalize_table(table_id)?;
        ensure_same_table(&table_id, &entries)?;

        let tx = begin_write(&mut self.conn)?;
        ensure_table_tx(&tx, &table_id)?;
        if clear_all_first {
            tx.execute(
                "DELETE FROM _key_value_store_active WHERE _table_id=?1",
                params![table_id.as_str()],
            )?;
        }
        let count = entries.len();
        for entry in entries {
            put_entry_tx(&tx, entry)?;
        }
        bump_rev_id_tx(&tx, &table_id)?;
        tx.commit()?;
        debug!(table_id = %table_id, entries = count, clear_all_first, "replaced table metadata");
        Ok(())
    }

    /// Replaces every entry under `(partition, aspect)` with `entries`.
    pub fn replace_table_metadata_sub_list(
        &mut self,
        table_id: &str,
        partition: &str,
        aspect: &str,
        entries: Vec<KeyValueStoreEntry>,
    ) -> Result<()> {
        let table_id = canonicalize_table(table_id)?;
        ensure_same_table(&table_id, &entries)?;
        if let Some(stray) = entries
            .iter()
            .find(|entry| entry.partition != partition || entry.aspect != aspect)
        {
            return Err(LifecycleError::InvalidInput(format!(
                "entry `{}` is outside partition `{partition}` aspect `{aspect}`",
                stray.key
            )));
        }

        let tx = begin_write(&mut self.conn)?;
        ensure_table_tx(&tx, &table_id)?;
        tx.execute(
            "DELETE FROM _key_value_store_active WHERE _table_id=?1 AND _partition=?2 AND _aspect=?3",
            params![table_id.as_str(), partition, aspect],
        )?;
        for entry in entries {
            put_entry_tx(&tx, entry)?;
        }
        bump_rev_id_tx(&tx, &table_id)?;
        tx.commit()?;
        Ok(())
    }

    /// Deletes the entries of `table_id` matching the given selectors; `None` matches all.
    pub fn delete_table_metadata(
        &mut self,
        table_id: &str,
        partition: Option<&str>,
        aspect: Option<&str>,
        key: Option<&str>,
    ) -> Result<usize> {
        let table_id = canonicalize_table(table_id)?;
        let tx = begin_write(&mut self.conn)?;
        ensure_table_tx(&tx, &table_id)?;
        let deleted = tx.execute(
            "DELETE FROM _key_value_store_active \
             WHERE _table_id=?1 \
               AND (?2 IS NULL OR _partition=?2) \
               AND (?3 IS NULL OR _aspect=?3) \
               AND (?4 IS NULL OR _key=?4)",
            params![table_id.as_str(), partition, aspect, key],
        )?;
        if deleted > 0 {
            bump_rev_id_tx(&tx, &table_id)?;
        }
        tx.commit()?;
        Ok(deleted)
    }

    pub fn get_table_metadata(&self, filter: &MetadataFilter) -> Result<Vec<KeyValueStoreEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT _table_id, _partition, _aspect, _key, _type, _value \
             FROM _key_value_store_active \
             WHERE (?1 IS NULL OR _table_id=?1) \
               AND (?2 IS NULL OR _partition=?2) \
               AND (?3 IS NULL OR _aspect=?3) \
               AND (?4 IS NULL OR _key=?4) \
             ORDER BY _table_id ASC, _partition ASC, _aspect ASC, _key ASC",
        )?;
        let mut rows = stmt.query(params![
            filter.table_id,
            filter.partition,
            filter.aspect,
            filter.key
        ])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(KeyValueStoreEntry {
                table_id: row.get(0)?,
                partition: row.get(1)?,
                aspect: row.get(2)?,
                key: row.get(3)?,
                entry_type: row.get(4)?,
                value: row.get(5)?,
            });
        }
        Ok(out)
    }

    pub fn get_table_security_settings(&self, table_id: &str) -> Result<TableSecuritySettings> {
        let table_id = canonicalize_table(table_id)?;
        ensure_table_tx(&self.conn, &table_id)?;
        load_security_settings(&self.conn, &table_id)
    }

    /// Stores a choice list and returns its content-derived id. Storing the same text twice
    /// yields the same id.
    pub fn set_choice_list(&mut self, choice_list_json: &str) -> Result<String> {
        if choice_list_json.trim().is_empty() {
            return Err(LifecycleError::InvalidInput(
                "choice list must not be empty".to_string(),
            ));
        }
        serde_json::from_str::<serde_json::Value>(choice_list_json)?;

        let id = sha256_hex(choice_list_json.as_bytes());
        let tx = begin_write(&mut self.conn)?;
        tx.execute(
            "INSERT OR IGNORE INTO _choice_lists(choice_list_id, choice_list_json) VALUES (?1, ?2)",
            params![id, choice_list_json],
        )?;
        tx.commit()?;
        Ok(id)
    }

    pub fn get_choice_list(&self, choice_list_id: &str) -> Result<Option<String>> {
        let json = self
            .conn
            .query_row(
                "SELECT choice_list_json FROM _choice_lists WHERE choice_list_id=?1",
                params![choice_list_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(json)
    }
}

fn ensure_same_table(table_id: &TableId, entries: &[KeyValueStoreEntry]) -> Result<()> {
    match entries
        .iter()
        .find(|entry| entry.table_id != table_id.as_str())
    {
        Some(entry) => Err(KvsError::TableMismatch {
            table_id: table_id.as_str().to_string(),
            entry_table: entry.table_id.clone(),
        }
        .into()),
        None => Ok(()),
    }
}

fn ensure_table_tx(conn: &Connection, table_id: &TableId) -> Result<()> {
    match table_definition_tx(conn, table_id)? {
        Some(_) => Ok(()),
        None => Err(LifecycleError::table_not_found(table_id.as_str())),
    }
}

/// Validates one entry and upserts it; an empty value removes the entry.
pub(crate) fn put_entry_tx(conn: &Connection, entry: KeyValueStoreEntry) -> Result<()> {
    let normalized = normalize_entry(entry)?;
    let entry = normalized.entry;
    if let Some(original) = normalized.corrected_from {
        warn!(
            table_id = %entry.table_id,
            partition = %entry.partition,
            key = %entry.key,
            original = %original,
            corrected = entry.entry_type.as_deref().unwrap_or_default(),
            "corrected key-value entry type"
        );
    }

    if entry.value.is_none() {
        conn.execute(
            "DELETE FROM _key_value_store_active \
             WHERE _table_id=?1 AND _partition=?2 AND _aspect=?3 AND _key=?4",
            params![entry.table_id, entry.partition, entry.aspect, entry.key],
        )?;
        return Ok(());
    }

    conn.execute(
        "INSERT INTO _key_value_store_active(_table_id, _partition, _aspect, _key, _type, _value) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
         ON CONFLICT(_table_id, _partition, _aspect, _key) \
         DO UPDATE SET _type=excluded._type, _value=excluded._value",
        params![
            entry.table_id,
            entry.partition,
            entry.aspect,
            entry.key,
            entry.entry_type,
            entry.value
        ],
    )?;
    Ok(())
}

pub(crate) fn security_entries(settings: &TableSecuritySettings) -> Vec<KeyValueStoreEntry> {
    let entry = |key: &str, entry_type: ElementDataType, value: &str| {
        KeyValueStoreEntry::new(
            settings.table_id.as_str(),
            PARTITION_TABLE,
            security::ASPECT,
            key,
            entry_type,
            value,
        )
    };
    vec![
        entry(
            security::KEY_LOCKED,
            ElementDataType::Bool,
            bool_literal(settings.locked),
        ),
        entry(
            security::KEY_UNVERIFIED_USER_CAN_CREATE,
            ElementDataType::Bool,
            bool_literal(settings.unverified_user_can_create),
        ),
        entry(
            security::KEY_FILTER_TYPE_ON_CREATION,
            ElementDataType::String,
            settings.filter_type_on_creation.as_str(),
        ),
    ]
}

fn bool_literal(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

/// Reads the `Table/security` entries; a missing or unreadable entry keeps its default.
pub(crate) fn load_security_settings(
    conn: &Connection,
    table_id: &TableId,
) -> Result<TableSecuritySettings> {
    let mut settings = TableSecuritySettings::new(table_id.as_str());
    let mut stmt = conn.prepare(
        "SELECT _key, _value FROM _key_value_store_active \
         WHERE _table_id=?1 AND _partition=?2 AND _aspect=?3",
    )?;
    let mut rows = stmt.query(params![table_id.as_str(), PARTITION_TABLE, security::ASPECT])?;
    while let Some(row) = rows.next()? {
        let key: String = row.get(0)?;
        let Some(value) = row.get::<_, Option<String>>(1)? else {
            continue;
        };
        let applied = match key.as_str() {
            security::KEY_LOCKED => parse_bool_value(&value).map(|v| settings.locked = v),
            security::KEY_UNVERIFIED_USER_CAN_CREATE => {
                parse_bool_value(&value).map(|v| settings.unverified_user_can_create = v)
            }
            security::KEY_FILTER_TYPE_ON_CREATION => value
                .parse::<FilterType>()
                .ok()
                .map(|v| settings.filter_type_on_creation = v),
            _ => Some(()),
        };
        if applied.is_none() {
            warn!(table_id = %table_id, key = %key, value = %value, "ignoring unreadable security setting");
        }
    }
    Ok(settings)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = sha2::Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for b in digest {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
