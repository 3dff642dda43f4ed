#![forbid(unsafe_code)]

use odt_core::{
    Actor, Column, ColumnValue, EffectiveAccess, FilterType, RowChange, RowFilterScope,
    RowValues, SavepointType, ServerRow, SyncState,
};
use odt_storage::{
    CheckpointRequest, CreateTableRequest, InsertRowRequest, LifecycleError, RowMetadata, RowQuery, RowRequest,
    SqliteStore, UpdateRowRequest,
};
use std::path::PathBuf;

const TABLE: &str = "testAccessTable";
const COMMON: &str = "mailto:common@gmail.com";
const OTHER: &str = "mailto:other@gmail.com";

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

fn open_with_table(label: &str, configure: impl FnOnce(&mut CreateTableRequest)) -> SqliteStore {
    let storage_dir = temp_storage_dir(label);
    let mut store = SqliteStore::open(&storage_dir).expect("open store");
    let mut request = CreateTableRequest::new(
        TABLE,
        vec![
            Column::new("col0", "col0", "string", &[]),
            Column::new("col1", "col1", "integer", &[]),
        ],
    );
    configure(&mut request);
    store.create_or_open_table(request).expect("create table");
    store
}

fn col0(value: &str) -> RowValues {
    let mut values = RowValues::new();
    values.insert("col0".to_string(), ColumnValue::text(value));
    values
}

fn server_row(row_id: &str, scope: RowFilterScope) -> ServerRow {
    ServerRow {
        row_id: row_id.to_string(),
        row_etag: "etag-1".to_string(),
        deleted: false,
        filter_scope: scope,
        form_id: None,
        locale: None,
        savepoint_type: Some(SavepointType::Complete),
        savepoint_timestamp: "2024-05-01T08:00:00.000000000".to_string(),
        savepoint_creator: Some(COMMON.to_string()),
        values: col0("server"),
    }
}

fn update(actor: Actor, row_id: &str) -> UpdateRowRequest {
    UpdateRowRequest {
        table_id: TABLE.to_string(),
        row_id: row_id.to_string(),
        actor,
        values: col0("edited"),
        filter_scope: None,
    }
}

#[test]
fn anonymous_insert_follows_unverified_user_can_create() {
    let mut store = open_with_table("anonymous_insert", |request| {
        request.unverified_user_can_create = false;
    });

    let err = store
        .insert_row(InsertRowRequest::new(TABLE, "r1", Actor::anonymous(), col0("x")))
        .expect_err("anonymous create is disabled");
    match err {
        LifecycleError::NotAuthorized(denied) => {
            assert_eq!(denied.attempted_op, RowChange::NewRow);
            assert_eq!(denied.row_id, "r1");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(store.get_sync_state(TABLE, "r1").expect("state").is_none());

    let inserted = store
        .insert_row(InsertRowRequest::new(TABLE, "r1", Actor::user(COMMON), col0("x")))
        .expect("verified user inserts");
    assert_eq!(inserted.sync_state, SyncState::NewRow);
}

#[test]
fn anonymous_insert_is_allowed_by_default() {
    let mut store = open_with_table("anonymous_default", |_| {});
    let inserted = store
        .insert_row(InsertRowRequest::new(TABLE, "r1", Actor::anonymous(), col0("x")))
        .expect("anonymous create");
    assert_eq!(inserted.filter_scope.filter_type, FilterType::Default);
}

#[test]
fn hidden_row_update_needs_owner_or_admin() {
    let mut store = open_with_table("hidden_row_update", |_| {});
    store
        .privileged_insert_row(
            TABLE,
            &server_row("r1", RowFilterScope::new(FilterType::Hidden, Some(COMMON))),
        )
        .expect("server row");

    let err = store
        .update_row(update(Actor::user(OTHER), "r1"))
        .expect_err("other user may not edit a hidden row");
    assert!(matches!(err, LifecycleError::NotAuthorized(_)));

    let updated = store
        .update_row(update(Actor::administrator(OTHER), "r1"))
        .expect("administrator edits");
    assert_eq!(updated.sync_state, SyncState::Changed);
    assert_eq!(updated.value("col0"), &ColumnValue::text("edited"));
    assert_eq!(updated.savepoint_creator.as_deref(), Some(OTHER));
}

#[test]
fn hidden_rows_are_invisible_to_other_users() {
    let mut store = open_with_table("hidden_rows", |_| {});
    store
        .privileged_insert_row(
            TABLE,
            &server_row("hidden", RowFilterScope::new(FilterType::Hidden, Some(COMMON))),
        )
        .expect("hidden row");
    store
        .privileged_insert_row(
            TABLE,
            &server_row("open", RowFilterScope::new(FilterType::Default, None)),
        )
        .expect("open row");

    let seen = |store: &SqliteStore, actor: Actor| -> Vec<String> {
        store
            .query_rows(&RowQuery::all(TABLE, actor))
            .expect("query")
            .map(|row| row.version.row_id)
            .collect()
    };
    assert_eq!(seen(&store, Actor::user(OTHER)), vec!["open"]);
    assert_eq!(seen(&store, Actor::user(COMMON)), vec!["hidden", "open"]);
    assert_eq!(seen(&store, Actor::super_user(OTHER)), vec!["hidden", "open"]);

    assert!(
        store
            .get_rows_with_id(&RowRequest::new(TABLE, "hidden", Actor::user(OTHER)))
            .expect("rows")
            .is_empty()
    );
    assert!(
        store
            .get_most_recent_row_with_id(&RowRequest::new(TABLE, "hidden", Actor::user(OTHER)))
            .expect("read")
            .is_none()
    );
}

#[test]
fn read_only_and_modify_scopes_limit_other_users() {
    let mut store = open_with_table("scope_limits", |_| {});
    store
        .privileged_insert_row(
            TABLE,
            &server_row("ro", RowFilterScope::new(FilterType::ReadOnly, Some(COMMON))),
        )
        .expect("read only row");
    store
        .privileged_insert_row(
            TABLE,
            &server_row("mod", RowFilterScope::new(FilterType::Modify, Some(COMMON))),
        )
        .expect("modify row");

    for row_id in ["ro", "mod"] {
        let err = store
            .delete_row(RowRequest::new(TABLE, row_id, Actor::user(OTHER)))
            .expect_err("other users cannot delete");
        assert!(matches!(err, LifecycleError::NotAuthorized(_)));
        let err = store
            .update_row(update(Actor::user(OTHER), row_id))
            .expect_err("other users cannot update");
        assert!(matches!(err, LifecycleError::NotAuthorized(_)));
    }

    store
        .update_row(update(Actor::user(COMMON), "ro"))
        .expect("owner updates");
    let tombstone = store
        .delete_row(RowRequest::new(TABLE, "mod", Actor::user(COMMON)))
        .expect("owner deletes")
        .expect("synced rows leave a tombstone");
    assert_eq!(tombstone.sync_state, SyncState::Deleted);

    let anonymous = Actor::anonymous().user;
    let anonymous_scope = |filter_type| RowFilterScope::new(filter_type, Some(anonymous.as_str()));
    store
        .privileged_insert_row(
            TABLE,
            &server_row("ro-anon", anonymous_scope(FilterType::ReadOnly)),
        )
        .expect("anonymous read only row");
    store
        .privileged_insert_row(
            TABLE,
            &server_row("mod-anon", anonymous_scope(FilterType::Modify)),
        )
        .expect("anonymous modify row");

    for row_id in ["ro-anon", "mod-anon"] {
        let err = store
            .delete_row(RowRequest::new(TABLE, row_id, Actor::anonymous()))
            .expect_err("anonymous actors never delete these rows");
        assert!(matches!(err, LifecycleError::NotAuthorized(_)));
    }
    let err = store
        .update_row(update(Actor::anonymous(), "ro-anon"))
        .expect_err("anonymous actors never update read only rows");
    assert!(matches!(err, LifecycleError::NotAuthorized(_)));
    let updated = store
        .update_row(update(Actor::anonymous(), "mod-anon"))
        .expect("anonymous owner updates a modify row");
    assert_eq!(updated.value("col0"), &ColumnValue::text("edited"));
}

#[test]
fn anonymous_creators_keep_only_the_rights_their_filter_type_grants() {
    let mut store = open_with_table("anonymous_modify", |request| {
        request.filter_type_on_creation = FilterType::Modify;
    });
    let inserted = store
        .insert_row(InsertRowRequest::new(TABLE, "r1", Actor::anonymous(), col0("x")))
        .expect("anonymous create");
    assert_eq!(inserted.filter_scope.filter_type, FilterType::Modify);
    let err = store
        .delete_row(RowRequest::new(TABLE, "r1", Actor::anonymous()))
        .expect_err("anonymous actors never delete modify rows");
    assert!(matches!(err, LifecycleError::NotAuthorized(_)));
    assert_eq!(
        store.get_sync_state(TABLE, "r1").expect("state"),
        Some(SyncState::NewRow)
    );

    let mut store = open_with_table("anonymous_hidden", |request| {
        request.filter_type_on_creation = FilterType::Hidden;
    });
    store
        .insert_row(InsertRowRequest::new(TABLE, "r1", Actor::anonymous(), col0("x")))
        .expect("anonymous create");
    let err = store
        .insert_checkpoint(CheckpointRequest {
            table_id: TABLE.to_string(),
            row_id: "r1".to_string(),
            actor: Actor::anonymous(),
            values: col0("y"),
        })
        .expect_err("anonymous actors never edit hidden rows");
    assert!(matches!(err, LifecycleError::NotAuthorized(_)));
    assert_eq!(
        store
            .get_rows_with_id(&RowRequest::new(TABLE, "r1", Actor::anonymous()))
            .expect("rows")
            .len(),
        1
    );
}

#[test]
fn locked_tables_restrict_creation_and_deletion() {
    let mut store = open_with_table("locked_table", |request| {
        request.locked = true;
    });

    let err = store
        .insert_row(InsertRowRequest::new(TABLE, "r1", Actor::user(COMMON), col0("x")))
        .expect_err("users cannot create on locked tables");
    assert!(matches!(err, LifecycleError::NotAuthorized(_)));

    let mut request =
        InsertRowRequest::new(TABLE, "draft", Actor::administrator("mailto:admin@example.org"), col0("x"));
    request.metadata = RowMetadata {
        filter_scope: Some(RowFilterScope::new(FilterType::Default, Some(COMMON))),
        ..RowMetadata::default()
    };
    store.insert_row(request).expect("administrator creates");
    store
        .privileged_insert_row(
            TABLE,
            &server_row("synced", RowFilterScope::new(FilterType::Default, Some(COMMON))),
        )
        .expect("server row");

    store
        .update_row(update(Actor::user(COMMON), "synced"))
        .expect("owner still edits on a locked table");
    let err = store
        .delete_row(RowRequest::new(TABLE, "synced", Actor::user(COMMON)))
        .expect_err("synced rows cannot be deleted on a locked table");
    assert!(matches!(err, LifecycleError::NotAuthorized(_)));

    assert!(
        store
            .delete_row(RowRequest::new(TABLE, "draft", Actor::user(COMMON)))
            .expect("owner deletes an unsynced row")
            .is_none()
    );

    let tombstone = store
        .delete_row(RowRequest::new(
            TABLE,
            "synced",
            Actor::administrator("mailto:admin@example.org"),
        ))
        .expect("administrator deletes")
        .expect("tombstone");
    assert_eq!(tombstone.sync_state, SyncState::Deleted);
}

#[test]
fn effective_access_accompanies_full_projections() {
    let mut store = open_with_table("effective_access", |request| {
        request.locked = true;
    });
    store
        .privileged_insert_row(
            TABLE,
            &server_row("mine", RowFilterScope::new(FilterType::Default, Some(COMMON))),
        )
        .expect("owned row");
    store
        .privileged_insert_row(
            TABLE,
            &server_row("theirs", RowFilterScope::new(FilterType::ReadOnly, Some(OTHER))),
        )
        .expect("foreign row");

    let rows = store
        .query_rows(&RowQuery::all(TABLE, Actor::user(COMMON)))
        .expect("query")
        .into_rows();
    let access: Vec<(String, Option<EffectiveAccess>)> = rows
        .into_iter()
        .map(|row| (row.version.row_id, row.effective_access))
        .collect();
    assert_eq!(
        access,
        vec![
            ("mine".to_string(), Some(EffectiveAccess::ReadWrite)),
            ("theirs".to_string(), Some(EffectiveAccess::Read)),
        ]
    );

    let narrow = store
        .query_rows(&RowQuery {
            projection: Some(vec![
                "col0".to_string(),
                "_filter_type".to_string(),
                "_filter_value".to_string(),
                "_sync_state".to_string(),
            ]),
            ..RowQuery::all(TABLE, Actor::user(COMMON))
        })
        .expect("query");
    assert!(narrow.rows().iter().all(|row| row.effective_access.is_some()));

    let admin = store
        .query_rows(&RowQuery::all(TABLE, Actor::administrator("mailto:admin@example.org")))
        .expect("query");
    assert!(
        admin
            .rows()
            .iter()
            .all(|row| row.effective_access == Some(EffectiveAccess::ReadWriteDelete))
    );
}

#[test]
fn access_context_summarizes_table_rights() {
    let store = open_with_table("access_context", |request| {
        request.locked = true;
    });

    let user = store
        .get_access_context(TABLE, &Actor::user(COMMON), Some(&["col0"][..]))
        .expect("context");
    assert!(!user.is_privileged);
    assert!(!user.can_create);
    assert!(user.can_update);
    assert!(!user.can_delete);
    assert!(!user.requires_effective_access_column);

    let admin = store
        .get_access_context::<&str>(TABLE, &Actor::administrator("mailto:admin@example.org"), None)
        .expect("context");
    assert!(admin.is_privileged);
    assert!(admin.can_create && admin.can_delete);
    assert!(admin.requires_effective_access_column);
}
