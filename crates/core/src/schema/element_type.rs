#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// Storage-level data type an element type resolves to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementDataType {
    String,
    Integer,
    Number,
    Bool,
    Array,
    Object,
    Rowpath,
    Configpath,
}

impl ElementDataType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Bool => "bool",
            Self::Array => "array",
            Self::Object => "object",
            Self::Rowpath => "rowpath",
            Self::Configpath => "configpath",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "string" => Self::String,
            "integer" => Self::Integer,
            "number" => Self::Number,
            "bool" => Self::Bool,
            "array" => Self::Array,
            "object" => Self::Object,
            "rowpath" => Self::Rowpath,
            "configpath" => Self::Configpath,
            _ => return None,
        })
    }

    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Integer | Self::Bool => "INTEGER",
            Self::Number => "REAL",
            Self::String | Self::Array | Self::Object | Self::Rowpath | Self::Configpath => "TEXT",
        }
    }
}

/// Which reserved-children contract (if any) an element must satisfy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Primitive,
    Array,
    Geopoint,
    MimeUri,
    Custom,
}

impl ElementKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Primitive => "primitive",
            Self::Array => "array",
            Self::Geopoint => "geopoint",
            Self::MimeUri => "mimeUri",
            Self::Custom => "custom",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElementType {
    raw: String,
    data_type: ElementDataType,
    kind: ElementKind,
    max_length: Option<u32>,
}

impl ElementType {
    /// Parses `name`, `name(len)`, or `name:datatype`. Unknown names are custom types: objects when
    /// the element declares children, strings otherwise.
    pub fn parse(raw: &str, has_children: bool) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }

        let (base, max_length) = match trimmed.split_once('(') {
            Some((base, rest)) => {
                let digits = rest.strip_suffix(')')?;
                (base, Some(digits.parse::<u32>().ok()?))
            }
            None => (trimmed, None),
        };
        if base.is_empty() {
            return None;
        }

        let (name, data_type) = match base.split_once(':') {
            Some((name, data_type)) => {
                if name.is_empty() {
                    return None;
                }
                (name, ElementDataType::parse(data_type)?)
            }
            None => {
                let data_type = match base {
                    "geopoint" | "mimeUri" => ElementDataType::Object,
                    "date" | "dateTime" | "time" => ElementDataType::String,
                    other => match ElementDataType::parse(other) {
                        Some(data_type) => data_type,
                        None if has_children => ElementDataType::Object,
                        None => ElementDataType::String,
                    },
                };
                (base, data_type)
            }
        };

        let kind = match name {
            "array" => ElementKind::Array,
            "geopoint" => ElementKind::Geopoint,
            "mimeUri" => ElementKind::MimeUri,
            _ if data_type == ElementDataType::Array => ElementKind::Array,
            _ if has_children => ElementKind::Custom,
            _ => ElementKind::Primitive,
        };

        Some(Self {
            raw: trimmed.to_string(),
            data_type,
            kind,
            max_length,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn data_type(&self) -> ElementDataType {
        self.data_type
    }

    pub fn kind(&self) -> ElementKind {
        self.kind
    }

    pub fn max_length(&self) -> Option<u32> {
        self.max_length
    }
}
