#![forbid(unsafe_code)]

use odt_core::ids::{RowIdError, TableIdError};
use odt_core::{ActionNotAuthorized, KvsError, PlacementError, SchemaValidationError, UnknownLiteral};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("schema validation failed: {0}")]
    SchemaValidation(#[from] SchemaValidationError),
    #[error(transparent)]
    NotAuthorized(#[from] ActionNotAuthorized),
    #[error("illegal row state for `{row_id}` in `{table_id}`: {reason}")]
    IllegalRowState {
        table_id: String,
        row_id: String,
        reason: String,
    },
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("config: {0}")]
    Config(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("json: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

impl LifecycleError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::SchemaValidation(_) => "SCHEMA_VALIDATION",
            Self::NotAuthorized(_) => "NOT_AUTHORIZED",
            Self::IllegalRowState { .. } => "ILLEGAL_ROW_STATE",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Config(message) if message.starts_with("RESET_REQUIRED") => "RESET_REQUIRED",
            Self::Config(_) => "CONFIG",
            Self::Io(_) => "IO",
            Self::Storage(_) => "STORAGE",
            Self::Serialization(_) => "SERIALIZATION",
        }
    }

    pub(crate) fn illegal_state(table_id: &str, row_id: &str, reason: impl Into<String>) -> Self {
        Self::IllegalRowState {
            table_id: table_id.to_string(),
            row_id: row_id.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn table_not_found(table_id: &str) -> Self {
        Self::NotFound {
            entity: "table",
            id: table_id.to_string(),
        }
    }

    pub(crate) fn row_not_found(table_id: &str, row_id: &str) -> Self {
        Self::NotFound {
            entity: "row",
            id: format!("{table_id}/{row_id}"),
        }
    }
}

impl From<TableIdError> for LifecycleError {
    fn from(value: TableIdError) -> Self {
        Self::InvalidInput(format!("invalid table id: {value}"))
    }
}

impl From<KvsError> for LifecycleError {
    fn from(value: KvsError) -> Self {
        Self::InvalidInput(value.to_string())
    }
}

impl From<UnknownLiteral> for LifecycleError {
    fn from(value: UnknownLiteral) -> Self {
        Self::InvalidInput(value.to_string())
    }
}

/// Empty or malformed row ids are a row-state violation, not a lookup miss.
pub(crate) fn row_id_error(table_id: &str, raw: &str, err: RowIdError) -> LifecycleError {
    LifecycleError::illegal_state(table_id, raw, err.to_string())
}

pub(crate) fn placement_error(table_id: &str, row_id: &str, err: PlacementError) -> LifecycleError {
    LifecycleError::illegal_state(table_id, row_id, err.to_string())
}
