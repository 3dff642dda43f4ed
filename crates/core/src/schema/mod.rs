#![forbid(unsafe_code)]

mod element_type;
mod validator;

pub use element_type::*;
pub use validator::*;

use serde::{Deserialize, Serialize};

/// Column as it is declared by a table definition (and persisted in `_column_definitions`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub element_key: String,
    pub element_name: String,
    pub element_type: String,
    #[serde(default)]
    pub list_child_element_keys: Vec<String>,
}

impl Column {
    pub fn new(
        element_key: impl Into<String>,
        element_name: impl Into<String>,
        element_type: impl Into<String>,
        children: &[&str],
    ) -> Self {
        Self {
            element_key: element_key.into(),
            element_name: element_name.into(),
            element_type: element_type.into(),
            list_child_element_keys: children.iter().map(|c| c.to_string()).collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ColumnDefinition {
    element_key: String,
    element_name: String,
    element_type: ElementType,
    child_element_keys: Vec<String>,
    parent_key: Option<String>,
    unit_of_retention: bool,
}

impl ColumnDefinition {
    pub fn element_key(&self) -> &str {
        &self.element_key
    }

    pub fn element_name(&self) -> &str {
        &self.element_name
    }

    pub fn element_type(&self) -> &ElementType {
        &self.element_type
    }

    pub fn data_type(&self) -> ElementDataType {
        self.element_type.data_type()
    }

    /// Children in ascending element-key order.
    pub fn child_element_keys(&self) -> &[String] {
        &self.child_element_keys
    }

    pub fn parent_key(&self) -> Option<&str> {
        self.parent_key.as_deref()
    }

    /// True when the element is persisted as its own storage column.
    pub fn is_unit_of_retention(&self) -> bool {
        self.unit_of_retention
    }

    pub fn to_column(&self) -> Column {
        Column {
            element_key: self.element_key.clone(),
            element_name: self.element_name.clone(),
            element_type: self.element_type.raw().to_string(),
            list_child_element_keys: self.child_element_keys.clone(),
        }
    }
}

/// Validated column list: every compound parent immediately precedes its children.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OrderedColumns {
    definitions: Vec<ColumnDefinition>,
}

impl OrderedColumns {
    pub fn definitions(&self) -> &[ColumnDefinition] {
        &self.definitions
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn find(&self, element_key: &str) -> Option<&ColumnDefinition> {
        self.definitions
            .iter()
            .find(|cd| cd.element_key == element_key)
    }

    pub fn retention_columns(&self) -> impl Iterator<Item = &ColumnDefinition> {
        self.definitions.iter().filter(|cd| cd.unit_of_retention)
    }

    pub fn retention_column_names(&self) -> Vec<String> {
        self.retention_columns()
            .map(|cd| cd.element_key.clone())
            .collect()
    }

    pub fn columns(&self) -> Vec<Column> {
        self.definitions.iter().map(ColumnDefinition::to_column).collect()
    }
}
