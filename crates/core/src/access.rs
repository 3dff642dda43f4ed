#![forbid(unsafe_code)]

use crate::row::{FilterType, RowFilterScope, SyncState, admin_columns};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

pub const ROLE_USER: &str = "ROLE_USER";
pub const ROLE_SUPER_USER: &str = "ROLE_SUPER_USER_TABLES";
pub const ROLE_ADMINISTRATOR: &str = "ROLE_ADMINISTER_TABLES";
pub const ANONYMOUS_USER: &str = "anonymous";

/// Roles granted to a verified user. An empty set is treated the same as no set at all.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleSet(BTreeSet<String>);

impl RoleSet {
    pub fn new<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(roles.into_iter().map(Into::into).collect())
    }

    pub fn user() -> Self {
        Self::new([ROLE_USER])
    }

    pub fn super_user() -> Self {
        Self::new([ROLE_USER, ROLE_SUPER_USER])
    }

    pub fn administrator() -> Self {
        Self::new([ROLE_USER, ROLE_SUPER_USER, ROLE_ADMINISTRATOR])
    }

    /// Parses a JSON list of role names, e.g. `["ROLE_USER"]`.
    pub fn from_json_list(value: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(value)
    }

    pub fn contains(&self, role: &str) -> bool {
        self.0.contains(role)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// Identity on whose behalf a lifecycle operation runs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user: String,
    pub roles: Option<RoleSet>,
}

impl Actor {
    pub fn new(user: impl Into<String>, roles: Option<RoleSet>) -> Self {
        Self {
            user: user.into(),
            roles,
        }
    }

    pub fn anonymous() -> Self {
        Self::new(ANONYMOUS_USER, None)
    }

    pub fn user(user: impl Into<String>) -> Self {
        Self::new(user, Some(RoleSet::user()))
    }

    pub fn super_user(user: impl Into<String>) -> Self {
        Self::new(user, Some(RoleSet::super_user()))
    }

    pub fn administrator(user: impl Into<String>) -> Self {
        Self::new(user, Some(RoleSet::administrator()))
    }

    /// No verified role set: anonymous or unverified.
    pub fn is_unverified(&self) -> bool {
        self.roles.as_ref().is_none_or(RoleSet::is_empty)
    }

    pub fn is_privileged(&self) -> bool {
        self.roles.as_ref().is_some_and(|roles| {
            roles.contains(ROLE_SUPER_USER) || roles.contains(ROLE_ADMINISTRATOR)
        })
    }

    pub fn owns(&self, scope: &RowFilterScope) -> bool {
        scope.is_owned_by(&self.user)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RowChange {
    NewRow,
    ChangeRow,
    DeleteRow,
    ModifyFilterScope,
}

impl RowChange {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewRow => "insert",
            Self::ChangeRow => "update",
            Self::DeleteRow => "delete",
            Self::ModifyFilterScope => "modify filter scope",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{actor} is not authorized to {} row `{row_id}` in table `{table_id}`", .attempted_op.as_str())]
pub struct ActionNotAuthorized {
    pub table_id: String,
    pub row_id: String,
    pub actor: String,
    pub attempted_op: RowChange,
}

/// Row state an authorization decision is made against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RowAccessState<'a> {
    pub sync_state: SyncState,
    pub filter_scope: &'a RowFilterScope,
}

/// Per-table security settings, stored as `Table/security` key-value entries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSecuritySettings {
    pub table_id: String,
    pub locked: bool,
    pub unverified_user_can_create: bool,
    pub filter_type_on_creation: FilterType,
}

impl TableSecuritySettings {
    pub fn new(table_id: impl Into<String>) -> Self {
        Self {
            table_id: table_id.into(),
            locked: false,
            unverified_user_can_create: true,
            filter_type_on_creation: FilterType::Default,
        }
    }

    /// Whether a non-privileged actor may create rows at all.
    pub fn can_create_row(&self, actor: &Actor) -> bool {
        if actor.is_privileged() {
            return true;
        }
        if self.locked {
            return false;
        }
        if actor.is_unverified() {
            return self.unverified_user_can_create;
        }
        true
    }

    /// Filter scope a new row receives when the caller does not supply one.
    pub fn scope_on_creation(&self, actor: &Actor) -> RowFilterScope {
        RowFilterScope::new(self.filter_type_on_creation, Some(actor.user.as_str()))
    }

    pub fn allows(&self, actor: &Actor, row: Option<RowAccessState<'_>>, change: RowChange) -> bool {
        if actor.is_privileged() {
            return true;
        }
        match change {
            RowChange::NewRow => self.can_create_row(actor),
            RowChange::ModifyFilterScope => false,
            RowChange::ChangeRow => {
                row.is_none_or(|row| scope_permits_edit(actor, row.filter_scope, change))
            }
            RowChange::DeleteRow => row.is_none_or(|row| {
                if self.locked && row.sync_state != SyncState::NewRow {
                    return false;
                }
                scope_permits_edit(actor, row.filter_scope, change)
            }),
        }
    }

    /// Gate every mutation passes before any write happens.
    pub fn allow_row_change(
        &self,
        actor: &Actor,
        row_id: &str,
        row: Option<RowAccessState<'_>>,
        change: RowChange,
    ) -> Result<(), ActionNotAuthorized> {
        if self.allows(actor, row, change) {
            return Ok(());
        }
        Err(ActionNotAuthorized {
            table_id: self.table_id.clone(),
            row_id: row_id.to_string(),
            actor: actor.user.clone(),
            attempted_op: change,
        })
    }

    /// Rows hidden from non-privileged actors: `HIDDEN` rows they do not own, once synced.
    pub fn is_visible(&self, actor: &Actor, row: RowAccessState<'_>) -> bool {
        actor.is_privileged()
            || row.filter_scope.filter_type != FilterType::Hidden
            || row.sync_state == SyncState::NewRow
            || actor.owns(row.filter_scope)
    }

    pub fn effective_access(&self, actor: &Actor, row: RowAccessState<'_>) -> EffectiveAccess {
        if self.allows(actor, Some(row), RowChange::DeleteRow) {
            EffectiveAccess::ReadWriteDelete
        } else if self.allows(actor, Some(row), RowChange::ChangeRow) {
            EffectiveAccess::ReadWrite
        } else {
            EffectiveAccess::Read
        }
    }

    /// Table-level summary for `actor`. Update/delete flags describe a synced, unowned
    /// `DEFAULT` row; individual rows may be narrower.
    pub fn access_context<S: AsRef<str>>(
        &self,
        actor: &Actor,
        projection: Option<&[S]>,
    ) -> AccessContext {
        let unowned = RowFilterScope::default();
        let synced = RowAccessState {
            sync_state: SyncState::Synced,
            filter_scope: &unowned,
        };
        AccessContext {
            table_id: self.table_id.clone(),
            is_privileged: actor.is_privileged(),
            can_create: self.can_create_row(actor),
            can_read: true,
            can_update: self.allows(actor, Some(synced), RowChange::ChangeRow),
            can_delete: self.allows(actor, Some(synced), RowChange::DeleteRow),
            requires_effective_access_column: projection_needs_access_column(projection),
        }
    }
}

/// Update and delete rights a filter scope grants a non-privileged actor: everyone may edit an
/// unowned `DEFAULT` row, otherwise only the owner may.
///
/// Unverified actors never own `HIDDEN` or `READ_ONLY` rows and may only update `MODIFY` rows,
/// even when the row carries their identity.
fn scope_permits_edit(actor: &Actor, scope: &RowFilterScope, change: RowChange) -> bool {
    let unowned_default = scope.filter_type == FilterType::Default && scope.filter_value.is_none();
    if actor.is_unverified() {
        return match scope.filter_type {
            FilterType::Default => unowned_default || actor.owns(scope),
            FilterType::Modify => change == RowChange::ChangeRow && actor.owns(scope),
            FilterType::Hidden | FilterType::ReadOnly => false,
        };
    }
    actor.owns(scope) || unowned_default
}

/// `None` projects every column.
fn projection_needs_access_column<S: AsRef<str>>(projection: Option<&[S]>) -> bool {
    let Some(projection) = projection else {
        return true;
    };
    let has = |name: &str| projection.iter().any(|column| column.as_ref() == name);
    has(admin_columns::FILTER_TYPE)
        && has(admin_columns::FILTER_VALUE)
        && has(admin_columns::SYNC_STATE)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessContext {
    pub table_id: String,
    pub is_privileged: bool,
    pub can_create: bool,
    pub can_read: bool,
    pub can_update: bool,
    pub can_delete: bool,
    pub requires_effective_access_column: bool,
}

/// Per-row permission indicator appended to query results.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EffectiveAccess {
    #[serde(rename = "r")]
    Read,
    #[serde(rename = "rw")]
    ReadWrite,
    #[serde(rename = "rwd")]
    ReadWriteDelete,
}

impl EffectiveAccess {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "r",
            Self::ReadWrite => "rw",
            Self::ReadWriteDelete => "rwd",
        }
    }

    pub fn can_write(self) -> bool {
        !matches!(self, Self::Read)
    }

    pub fn can_delete(self) -> bool {
        matches!(self, Self::ReadWriteDelete)
    }
}
