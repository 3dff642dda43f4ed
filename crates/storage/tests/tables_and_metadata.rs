#![forbid(unsafe_code)]

use odt_core::{
    Actor, Column, ColumnValue, ElementDataType, FilterType, KeyValueStoreEntry, PARTITION_COLUMN,
    PARTITION_TABLE, RowFilterScope, RowValues, SchemaValidationError, ServerRow, SyncState,
    security,
};
use odt_storage::{
    CreateTableRequest, InsertRowRequest, LifecycleError, MetadataFilter, RowRequest,
    SqliteStore, StoreConfig,
};
use rusqlite::{Connection, params};
use std::path::{Path, PathBuf};

const TABLE: &str = "visits";

fn temp_storage_dir(label: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("odt_storage_{label}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn visit_columns() -> Vec<Column> {
    vec![
        Column::new("name", "name", "string", &[]),
        Column::new("age", "age", "integer", &[]),
        Column::new(
            "location",
            "location",
            "geopoint",
            &[
                "location_accuracy",
                "location_altitude",
                "location_latitude",
                "location_longitude",
            ],
        ),
        Column::new("location_accuracy", "accuracy", "number", &[]),
        Column::new("location_altitude", "altitude", "number", &[]),
        Column::new("location_latitude", "latitude", "number", &[]),
        Column::new("location_longitude", "longitude", "number", &[]),
    ]
}

fn db_path(storage_dir: &Path) -> PathBuf {
    storage_dir.join("default").join("odt_rows.db")
}

fn server_row(row_id: &str, etag: &str) -> ServerRow {
    let mut values = RowValues::new();
    values.insert("name".to_string(), ColumnValue::text("Ada"));
    ServerRow {
        row_id: row_id.to_string(),
        row_etag: etag.to_string(),
        deleted: false,
        filter_scope: RowFilterScope::new(FilterType::Default, None),
        form_id: None,
        locale: None,
        savepoint_type: None,
        savepoint_timestamp: "2024-01-01T00:00:00.000000000".to_string(),
        savepoint_creator: Some("mailto:server@example.org".to_string()),
        values,
    }
}

#[test]
fn create_table_orders_columns_and_reopens_identically() {
    let storage_dir = temp_storage_dir("create_table_orders_columns");
    let mut store = SqliteStore::open(&storage_dir).expect("open store");

    let columns = store
        .create_or_open_table(CreateTableRequest::new(TABLE, visit_columns()))
        .expect("create table");
    let keys: Vec<&str> = columns
        .definitions()
        .iter()
        .map(|cd| cd.element_key())
        .collect();
    assert_eq!(
        keys,
        vec![
            "age",
            "location",
            "location_accuracy",
            "location_altitude",
            "location_latitude",
            "location_longitude",
            "name",
        ]
    );

    let mut shuffled = visit_columns();
    shuffled.reverse();
    let reopened = store
        .create_or_open_table(CreateTableRequest::new(TABLE, shuffled))
        .expect("reopen with the same columns in another order");
    assert_eq!(reopened, columns);

    let definition = store.get_table_definition(TABLE).expect("definition");
    assert_eq!(definition.last_sync_time, -1);
    assert!(definition.schema_etag.is_none());
    assert!(store.has_table_id(TABLE).expect("has table"));
    assert!(!store.has_table_id("missing").expect("has table"));
    assert!(!store.has_table_id("not a table id").expect("has table"));
    assert_eq!(store.get_all_table_ids().expect("ids"), vec![TABLE.to_string()]);
}

#[test]
fn reopening_with_different_columns_is_a_schema_mismatch() {
    let storage_dir = temp_storage_dir("schema_mismatch");
    let mut store = SqliteStore::open(&storage_dir).expect("open store");
    store
        .create_or_open_table(CreateTableRequest::new(TABLE, visit_columns()))
        .expect("create table");

    let err = store
        .create_or_open_table(CreateTableRequest::new(
            TABLE,
            vec![Column::new("name", "name", "string", &[])],
        ))
        .expect_err("changed column list must be rejected");
    assert!(matches!(
        err,
        LifecycleError::SchemaValidation(SchemaValidationError::SchemaMismatch { .. })
    ));
    assert_eq!(err.code(), "SCHEMA_VALIDATION");
}

#[test]
fn partial_geopoint_never_creates_a_table() {
    let storage_dir = temp_storage_dir("partial_geopoint");
    let mut store = SqliteStore::open(&storage_dir).expect("open store");

    let columns = vec![
        Column::new(
            "location",
            "location",
            "geopoint",
            &["location_latitude", "location_longitude"],
        ),
        Column::new("location_latitude", "latitude", "number", &[]),
        Column::new("location_longitude", "longitude", "number", &[]),
    ];
    let err = store
        .create_or_open_table(CreateTableRequest::new(TABLE, columns))
        .expect_err("partial geopoint must be rejected");
    assert!(matches!(err, LifecycleError::SchemaValidation(_)));
    assert!(!store.has_table_id(TABLE).expect("has table"));

    let empty = store
        .create_or_open_table(CreateTableRequest::new("emptyTable", Vec::new()))
        .expect("an empty column list is valid");
    assert!(empty.is_empty());
}

#[test]
fn invalid_table_ids_are_rejected() {
    let storage_dir = temp_storage_dir("invalid_table_id");
    let mut store = SqliteStore::open(&storage_dir).expect("open store");
    let err = store
        .create_or_open_table(CreateTableRequest::new("1visits", visit_columns()))
        .expect_err("table ids must start with a letter");
    assert_eq!(err.code(), "INVALID_INPUT");

    let err = store
        .get_table_definition("visits")
        .expect_err("unknown table");
    assert!(matches!(err, LifecycleError::NotFound { entity: "table", .. }));
}

#[test]
fn delete_table_removes_data_and_metadata() {
    let storage_dir = temp_storage_dir("delete_table");
    let mut store = SqliteStore::open(&storage_dir).expect("open store");
    store
        .create_or_open_table(CreateTableRequest::new(TABLE, visit_columns()))
        .expect("create table");
    store
        .insert_row(InsertRowRequest::new(
            TABLE,
            "r1",
            Actor::user("mailto:a@example.org"),
            RowValues::new(),
        ))
        .expect("insert row");

    store.delete_table_and_all_data(TABLE).expect("delete table");
    assert!(!store.has_table_id(TABLE).expect("has table"));
    let leftovers = store
        .get_table_metadata(&MetadataFilter {
            table_id: Some(TABLE.to_string()),
            ..MetadataFilter::default()
        })
        .expect("metadata");
    assert!(leftovers.is_empty());

    let err = store
        .delete_table_and_all_data(TABLE)
        .expect_err("second delete");
    assert_eq!(err.code(), "NOT_FOUND");

    drop(store);
    let reopened = SqliteStore::open(&storage_dir).expect("reopen after drop");
    assert!(reopened.get_all_table_ids().expect("ids").is_empty());
}

#[test]
fn security_settings_default_and_follow_metadata() {
    let storage_dir = temp_storage_dir("security_settings");
    let mut store = SqliteStore::open(&storage_dir).expect("open store");
    store
        .create_or_open_table(CreateTableRequest::new(TABLE, visit_columns()))
        .expect("create table");

    let settings = store.get_table_security_settings(TABLE).expect("settings");
    assert!(!settings.locked);
    assert!(settings.unverified_user_can_create);
    assert_eq!(settings.filter_type_on_creation, FilterType::Default);

    let before = store.get_table_definition(TABLE).expect("definition").rev_id;
    store
        .replace_table_metadata(
            TABLE,
            vec![
                KeyValueStoreEntry::new(
                    TABLE,
                    PARTITION_TABLE,
                    security::ASPECT,
                    security::KEY_LOCKED,
                    ElementDataType::Bool,
                    "true",
                ),
                KeyValueStoreEntry::new(
                    TABLE,
                    PARTITION_TABLE,
                    security::ASPECT,
                    security::KEY_FILTER_TYPE_ON_CREATION,
                    ElementDataType::String,
                    "HIDDEN",
                ),
            ],
            false,
        )
        .expect("replace security entries");
    let after = store.get_table_definition(TABLE).expect("definition").rev_id;
    assert_ne!(before, after);

    let settings = store.get_table_security_settings(TABLE).expect("settings");
    assert!(settings.locked);
    assert_eq!(settings.filter_type_on_creation, FilterType::Hidden);

    let err = store
        .insert_row(InsertRowRequest::new(
            TABLE,
            "r1",
            Actor::user("mailto:a@example.org"),
            RowValues::new(),
        ))
        .expect_err("locked tables refuse inserts from ordinary users");
    assert!(matches!(err, LifecycleError::NotAuthorized(_)));
}

#[test]
fn metadata_entries_are_normalized_and_replaced_atomically() {
    let storage_dir = temp_storage_dir("metadata_entries");
    let mut store = SqliteStore::open(&storage_dir).expect("open store");
    store
        .create_or_open_table(CreateTableRequest::new(TABLE, visit_columns()))
        .expect("create table");

    let col_order = KeyValueStoreEntry {
        table_id: TABLE.to_string(),
        partition: PARTITION_TABLE.to_string(),
        aspect: "default".to_string(),
        key: "colOrder".to_string(),
        entry_type: Some("string".to_string()),
        value: Some("[\"name\",\"age\"]".to_string()),
    };
    store
        .replace_table_metadata(TABLE, vec![col_order], false)
        .expect("store colOrder");

    let stored = store
        .get_table_metadata(&MetadataFilter {
            table_id: Some(TABLE.to_string()),
            key: Some("colOrder".to_string()),
            ..MetadataFilter::default()
        })
        .expect("metadata");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].entry_type.as_deref(), Some("array"));

    let rev_before = store.get_table_definition(TABLE).expect("definition").rev_id;
    let good = KeyValueStoreEntry::new(
        TABLE,
        PARTITION_COLUMN,
        "name",
        "displayVisible",
        ElementDataType::Bool,
        "true",
    );
    let bad = KeyValueStoreEntry::new(
        TABLE,
        PARTITION_TABLE,
        "default",
        "sortCol",
        ElementDataType::Object,
        "{\"name\":",
    );
    let err = store
        .replace_table_metadata(TABLE, vec![good.clone(), bad], false)
        .expect_err("malformed object must be rejected");
    assert_eq!(err.code(), "INVALID_INPUT");
    assert_eq!(
        store.get_table_definition(TABLE).expect("definition").rev_id,
        rev_before
    );
    let visible = store
        .get_table_metadata(&MetadataFilter {
            table_id: Some(TABLE.to_string()),
            partition: Some(PARTITION_COLUMN.to_string()),
            ..MetadataFilter::default()
        })
        .expect("metadata");
    assert!(visible.is_empty(), "failed replace must not leave partial writes");

    store
        .replace_table_metadata_sub_list(TABLE, PARTITION_COLUMN, "name", vec![good])
        .expect("sub list");
    let deleted = store
        .delete_table_metadata(TABLE, Some(PARTITION_COLUMN), None, None)
        .expect("delete column metadata");
    assert_eq!(deleted, 1);

    let foreign = KeyValueStoreEntry::new(
        "other",
        PARTITION_TABLE,
        "default",
        "indexCol",
        ElementDataType::String,
        "name",
    );
    let err = store
        .replace_table_metadata(TABLE, vec![foreign], false)
        .expect_err("entries for another table");
    assert_eq!(err.code(), "INVALID_INPUT");
}

#[test]
fn clear_all_first_keeps_only_the_new_entries() {
    let storage_dir = temp_storage_dir("clear_all_first");
    let mut store = SqliteStore::open(&storage_dir).expect("open store");
    store
        .create_or_open_table(CreateTableRequest::new(TABLE, visit_columns()))
        .expect("create table");

    let index_col = KeyValueStoreEntry::new(
        TABLE,
        PARTITION_TABLE,
        "default",
        "indexCol",
        ElementDataType::String,
        "name",
    );
    store
        .replace_table_metadata(TABLE, vec![index_col.clone()], true)
        .expect("replace");
    let all = store
        .get_table_metadata(&MetadataFilter {
            table_id: Some(TABLE.to_string()),
            ..MetadataFilter::default()
        })
        .expect("metadata");
    assert_eq!(all, vec![index_col]);

    let settings = store.get_table_security_settings(TABLE).expect("settings");
    assert!(!settings.locked, "cleared security entries fall back to defaults");
}

#[test]
fn choice_lists_are_content_addressed() {
    let storage_dir = temp_storage_dir("choice_lists");
    let mut store = SqliteStore::open(&storage_dir).expect("open store");

    let json = r#"[{"data_value":"yes"},{"data_value":"no"}]"#;
    let id = store.set_choice_list(json).expect("store choice list");
    assert_eq!(id.len(), 64);
    assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(store.set_choice_list(json).expect("idempotent"), id);
    assert_eq!(
        store.get_choice_list(&id).expect("read").as_deref(),
        Some(json)
    );
    assert!(store.get_choice_list("unknown").expect("read").is_none());

    let err = store.set_choice_list("[oops").expect_err("invalid json");
    assert_eq!(err.code(), "SERIALIZATION");
}

#[test]
fn schema_etag_change_resets_sync_bookkeeping() {
    let storage_dir = temp_storage_dir("schema_etag_change");
    let mut store = SqliteStore::open(&storage_dir).expect("open store");
    store
        .create_or_open_table(CreateTableRequest::new(TABLE, visit_columns()))
        .expect("create table");
    store
        .privileged_insert_row(TABLE, &server_row("r1", "etag-1"))
        .expect("server row");
    store
        .privileged_update_table_etags(TABLE, Some("schema-1"), Some("data-1"))
        .expect("etags");

    assert!(
        !store
            .server_table_schema_etag_changed(TABLE, "schema-1")
            .expect("same etag")
    );
    assert_eq!(
        store.get_sync_state(TABLE, "r1").expect("state"),
        Some(SyncState::Synced)
    );

    assert!(
        store
            .server_table_schema_etag_changed(TABLE, "schema-2")
            .expect("new etag")
    );
    let rows = store
        .get_rows_with_id(&RowRequest::new(TABLE, "r1", Actor::administrator("admin")))
        .expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].sync_state, SyncState::NewRow);
    assert!(rows[0].row_etag.is_none());

    let definition = store.get_table_definition(TABLE).expect("definition");
    assert_eq!(definition.schema_etag.as_deref(), Some("schema-2"));
    assert!(definition.last_data_etag.is_none());

    store
        .privileged_update_table_last_sync_time(TABLE)
        .expect("sync time");
    assert!(store.get_table_definition(TABLE).expect("definition").last_sync_time > 0);
}

#[test]
fn foreign_tables_require_a_reset() {
    let storage_dir = temp_storage_dir("foreign_tables");
    drop(SqliteStore::open(&storage_dir).expect("open store"));

    let conn = Connection::open(db_path(&storage_dir)).expect("raw connection");
    conn.execute_batch("CREATE TABLE _rogue(x INTEGER);")
        .expect("create rogue table");
    drop(conn);

    let err = SqliteStore::open(&storage_dir).expect_err("unknown system table");
    assert_eq!(err.code(), "RESET_REQUIRED");
}

#[test]
fn schema_version_mismatch_requires_a_reset() {
    let storage_dir = temp_storage_dir("schema_version_mismatch");
    drop(SqliteStore::open(&storage_dir).expect("open store"));

    let conn = Connection::open(db_path(&storage_dir)).expect("raw connection");
    conn.execute(
        "UPDATE _store_state SET schema_version=?1 WHERE singleton=1",
        params![99],
    )
    .expect("bump version");
    drop(conn);

    let err = SqliteStore::open(&storage_dir).expect_err("version mismatch");
    assert_eq!(err.code(), "RESET_REQUIRED");
}

#[test]
fn config_selects_app_directory_and_file() {
    let storage_dir = temp_storage_dir("config_paths");
    let config = StoreConfig::from_json_str(
        r#"{"app_name":"survey","db_file_name":"rows.db","default_locale":"fr"}"#,
    )
    .expect("config");
    let mut store = SqliteStore::open_with_config(&storage_dir, config).expect("open store");
    assert!(storage_dir.join("survey").join("rows.db").exists());

    store
        .create_or_open_table(CreateTableRequest::new(TABLE, visit_columns()))
        .expect("create table");
    let row = store
        .insert_row(InsertRowRequest::new(
            TABLE,
            "r1",
            Actor::user("mailto:a@example.org"),
            RowValues::new(),
        ))
        .expect("insert row");
    assert_eq!(row.locale.as_deref(), Some("fr"));

    let bad = StoreConfig {
        app_name: "../escape".to_string(),
        ..StoreConfig::default()
    };
    let err = SqliteStore::open_with_config(&storage_dir, bad).expect_err("bad app name");
    assert_eq!(err.code(), "CONFIG");
}
