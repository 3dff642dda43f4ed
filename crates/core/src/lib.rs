#![forbid(unsafe_code)]

pub mod access;
pub mod kvs;
pub mod row;
pub mod schema;
pub mod sync;

pub use access::*;
pub use kvs::*;
pub use row::*;
pub use schema::*;
pub use sync::*;

pub mod ids {
    use thiserror::Error;

    const MAX_TABLE_ID_LEN: usize = 64;
    const MAX_ROW_ID_LEN: usize = 256;

    /// Identifier of a user table. Doubles as the SQL table name, so it is held to the
    /// identifier grammar: ASCII letter first, then ASCII alphanumerics or `_`.
    #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct TableId(String);

    impl TableId {
        pub fn as_str(&self) -> &str {
            &self.0
        }

        pub fn into_string(self) -> String {
            self.0
        }

        pub fn try_new(value: impl Into<String>) -> Result<Self, TableIdError> {
            let value = value.into();
            validate_table_id(&value)?;
            Ok(Self(value))
        }
    }

    impl std::fmt::Display for TableId {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(&self.0)
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq, Error)]
    pub enum TableIdError {
        #[error("table id must not be empty")]
        Empty,
        #[error("table id is too long")]
        TooLong,
        #[error("table id must start with an ASCII letter")]
        InvalidFirstChar,
        #[error("table id contains invalid character {ch:?} at index {index}")]
        InvalidChar { ch: char, index: usize },
    }

    fn validate_table_id(value: &str) -> Result<(), TableIdError> {
        if value.is_empty() {
            return Err(TableIdError::Empty);
        }
        if value.len() > MAX_TABLE_ID_LEN {
            return Err(TableIdError::TooLong);
        }
        let mut chars = value.chars();
        let Some(first) = chars.next() else {
            return Err(TableIdError::Empty);
        };
        if !first.is_ascii_alphabetic() {
            return Err(TableIdError::InvalidFirstChar);
        }
        for (index, ch) in value.chars().enumerate().skip(1) {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                continue;
            }
            return Err(TableIdError::InvalidChar { ch, index });
        }
        Ok(())
    }

    #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct RowId(String);

    impl RowId {
        pub fn as_str(&self) -> &str {
            &self.0
        }

        pub fn into_string(self) -> String {
            self.0
        }

        pub fn try_new(value: impl Into<String>) -> Result<Self, RowIdError> {
            let value = value.into();
            validate_row_id(&value)?;
            Ok(Self(value))
        }
    }

    impl std::fmt::Display for RowId {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(&self.0)
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq, Error)]
    pub enum RowIdError {
        #[error("row id must not be empty")]
        Empty,
        #[error("row id is too long")]
        TooLong,
        #[error("row id contains control characters")]
        ContainsControl,
    }

    fn validate_row_id(value: &str) -> Result<(), RowIdError> {
        if value.trim().is_empty() {
            return Err(RowIdError::Empty);
        }
        if value.len() > MAX_ROW_ID_LEN {
            return Err(RowIdError::TooLong);
        }
        if value.chars().any(|c| c.is_control()) {
            return Err(RowIdError::ContainsControl);
        }
        Ok(())
    }

}
