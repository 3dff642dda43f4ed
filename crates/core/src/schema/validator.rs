#![forbid(unsafe_code)]

use super::{Column, ColumnDefinition, ElementDataType, ElementKind, ElementType, OrderedColumns};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

const MAX_ELEMENT_KEY_LEN: usize = 64;

const GEOPOINT_CHILDREN: [&str; 4] = ["accuracy", "altitude", "latitude", "longitude"];
const ARRAY_CHILD: &str = "items";
const MIME_URI_CHILDREN: [(&str, ElementDataType); 2] = [
    ("contentType", ElementDataType::String),
    ("uriFragment", ElementDataType::Rowpath),
];

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SchemaValidationError {
    #[error("invalid element key `{key}`: {reason}")]
    InvalidElementKey { key: String, reason: &'static str },
    #[error("duplicate element key `{key}`")]
    DuplicateElementKey { key: String },
    #[error("element `{key}` has an empty element name")]
    EmptyElementName { key: String },
    #[error("element `{key}` has unparseable type `{element_type}`")]
    InvalidElementType { key: String, element_type: String },
    #[error("element `{key}` of type `{element_type}` cannot declare children")]
    ChildrenNotAllowed { key: String, element_type: String },
    #[error("element `{parent}` references unknown child `{child}`")]
    UnknownChild { parent: String, child: String },
    #[error("element `{child}` is claimed by both `{first}` and `{second}`")]
    MultipleParents {
        child: String,
        first: String,
        second: String,
    },
    #[error("element `{key}` is part of a parent/child cycle")]
    Cycle { key: String },
    #[error("{kind} element `{key}` has malformed children: {reason}")]
    MalformedCompound {
        key: String,
        kind: &'static str,
        reason: String,
    },
    #[error("stored definition of `{table_id}` does not match the requested columns")]
    SchemaMismatch { table_id: String },
}

/// Validates a proposed column list and returns it in table order: roots ascending by element
/// key, each compound column immediately followed by its children (also ascending).
pub fn validate_columns(columns: &[Column]) -> Result<OrderedColumns, SchemaValidationError> {
    let mut by_key: BTreeMap<&str, &Column> = BTreeMap::new();
    for column in columns {
        validate_element_key(&column.element_key)?;
        if column.element_name.trim().is_empty() {
            return Err(SchemaValidationError::EmptyElementName {
                key: column.element_key.clone(),
            });
        }
        if by_key.insert(column.element_key.as_str(), column).is_some() {
            return Err(SchemaValidationError::DuplicateElementKey {
                key: column.element_key.clone(),
            });
        }
    }

    let mut types: BTreeMap<&str, ElementType> = BTreeMap::new();
    for column in columns {
        let has_children = !column.list_child_element_keys.is_empty();
        let element_type = ElementType::parse(&column.element_type, has_children).ok_or_else(
            || SchemaValidationError::InvalidElementType {
                key: column.element_key.clone(),
                element_type: column.element_type.clone(),
            },
        )?;
        if has_children
            && !matches!(
                element_type.data_type(),
                ElementDataType::Object | ElementDataType::Array
            )
        {
            return Err(SchemaValidationError::ChildrenNotAllowed {
                key: column.element_key.clone(),
                element_type: column.element_type.clone(),
            });
        }
        types.insert(column.element_key.as_str(), element_type);
    }

    let mut parents: BTreeMap<&str, &str> = BTreeMap::new();
    for column in columns {
        let mut seen = BTreeSet::new();
        for child in &column.list_child_element_keys {
            if !by_key.contains_key(child.as_str()) {
                return Err(SchemaValidationError::UnknownChild {
                    parent: column.element_key.clone(),
                    child: child.clone(),
                });
            }
            if child == &column.element_key {
                return Err(SchemaValidationError::Cycle {
                    key: child.clone(),
                });
            }
            if !seen.insert(child.as_str()) {
                return Err(malformed(
                    column,
                    ElementKind::Custom,
                    format!("child `{child}` is listed twice"),
                ));
            }
            if let Some(first) = parents.insert(child.as_str(), column.element_key.as_str()) {
                return Err(SchemaValidationError::MultipleParents {
                    child: child.clone(),
                    first: first.to_string(),
                    second: column.element_key.clone(),
                });
            }
        }
    }

    for column in columns {
        let Some(element_type) = types.get(column.element_key.as_str()) else {
            continue;
        };
        check_reserved_children(column, element_type, &by_key, &types)?;
    }

    let mut ordered = Vec::with_capacity(columns.len());
    for root in by_key
        .keys()
        .copied()
        .filter(|key| !parents.contains_key(key))
    {
        push_subtree(root, None, false, &by_key, &types, &mut ordered);
    }

    if ordered.len() != columns.len() {
        let placed: BTreeSet<&str> = ordered.iter().map(|cd| cd.element_key()).collect();
        let key = by_key
            .keys()
            .find(|key| !placed.contains(*key))
            .map(|key| key.to_string())
            .unwrap_or_default();
        return Err(SchemaValidationError::Cycle { key });
    }

    Ok(OrderedColumns {
        definitions: ordered,
    })
}

fn validate_element_key(key: &str) -> Result<(), SchemaValidationError> {
    let fail = |reason: &'static str| SchemaValidationError::InvalidElementKey {
        key: key.to_string(),
        reason,
    };
    let mut chars = key.chars();
    let Some(first) = chars.next() else {
        return Err(fail("must not be empty"));
    };
    if key.len() > MAX_ELEMENT_KEY_LEN {
        return Err(fail("is too long"));
    }
    if !first.is_ascii_alphabetic() {
        return Err(fail("must start with an ASCII letter"));
    }
    if !chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
        return Err(fail("may only contain ASCII letters, digits and '_'"));
    }
    Ok(())
}

fn check_reserved_children(
    column: &Column,
    element_type: &ElementType,
    by_key: &BTreeMap<&str, &Column>,
    types: &BTreeMap<&str, ElementType>,
) -> Result<(), SchemaValidationError> {
    let children = &column.list_child_element_keys;
    match element_type.kind() {
        ElementKind::Geopoint => {
            if children.is_empty() {
                return Ok(());
            }
            let expected: Vec<(&str, ElementDataType)> = GEOPOINT_CHILDREN
                .iter()
                .map(|name| (*name, ElementDataType::Number))
                .collect();
            check_named_children(column, ElementKind::Geopoint, &expected, by_key, types)
        }
        ElementKind::Array => {
            if children.len() != 1 {
                return Err(malformed(
                    column,
                    ElementKind::Array,
                    format!("expected exactly one child, found {}", children.len()),
                ));
            }
            let child_key = format!("{}_{ARRAY_CHILD}", column.element_key);
            let child = by_key.get(children[0].as_str());
            if children[0] != child_key || child.is_none_or(|c| c.element_name != ARRAY_CHILD) {
                return Err(malformed(
                    column,
                    ElementKind::Array,
                    format!("child must be `{child_key}` named `{ARRAY_CHILD}`"),
                ));
            }
            Ok(())
        }
        ElementKind::MimeUri => {
            check_named_children(column, ElementKind::MimeUri, &MIME_URI_CHILDREN, by_key, types)
        }
        ElementKind::Custom | ElementKind::Primitive => Ok(()),
    }
}

fn check_named_children(
    column: &Column,
    kind: ElementKind,
    expected: &[(&str, ElementDataType)],
    by_key: &BTreeMap<&str, &Column>,
    types: &BTreeMap<&str, ElementType>,
) -> Result<(), SchemaValidationError> {
    let children = &column.list_child_element_keys;
    if children.len() != expected.len() {
        return Err(malformed(
            column,
            kind,
            format!(
                "expected {} children, found {}",
                expected.len(),
                children.len()
            ),
        ));
    }

    for (name, data_type) in expected {
        let key = format!("{}_{name}", column.element_key);
        if !children.iter().any(|child| child == &key) {
            return Err(malformed(column, kind, format!("missing child `{key}`")));
        }
        let named_correctly = by_key
            .get(key.as_str())
            .is_some_and(|child| child.element_name == *name);
        if !named_correctly {
            return Err(malformed(
                column,
                kind,
                format!("child `{key}` must be named `{name}`"),
            ));
        }
        let typed_correctly = types
            .get(key.as_str())
            .is_some_and(|child_type| child_type.data_type() == *data_type);
        if !typed_correctly {
            return Err(malformed(
                column,
                kind,
                format!("child `{key}` must be of type {}", data_type.as_str()),
            ));
        }
    }
    Ok(())
}

fn malformed(column: &Column, kind: ElementKind, reason: String) -> SchemaValidationError {
    SchemaValidationError::MalformedCompound {
        key: column.element_key.clone(),
        kind: kind.label(),
        reason,
    }
}

fn push_subtree(
    key: &str,
    parent: Option<&str>,
    under_array: bool,
    by_key: &BTreeMap<&str, &Column>,
    types: &BTreeMap<&str, ElementType>,
    out: &mut Vec<ColumnDefinition>,
) {
    let (Some(column), Some(element_type)) = (by_key.get(key), types.get(key)) else {
        return;
    };
    let mut children = column.list_child_element_keys.clone();
    children.sort();

    let is_array = element_type.kind() == ElementKind::Array;
    let unit_of_retention = is_array || (children.is_empty() && !under_array);

    out.push(ColumnDefinition {
        element_key: column.element_key.clone(),
        element_name: column.element_name.clone(),
        element_type: element_type.clone(),
        child_element_keys: children.clone(),
        parent_key: parent.map(str::to_string),
        unit_of_retention,
    });

    for child in &children {
        push_subtree(
            child,
            Some(key),
            under_array || is_array,
            by_key,
            types,
            out,
        );
    }
}
