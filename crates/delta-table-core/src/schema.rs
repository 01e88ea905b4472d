//! Table schema model and validation.
//!
//! Schemas travel through the log as a JSON document inside
//! `Metadata.schemaString`:
//!
//! ```json
//! {"type":"struct","fields":[
//!   {"name":"key","type":"integer","nullable":false,"metadata":{}},
//!   {"name":"tags","type":{"type":"array","elementType":"string",
//!                          "containsNull":true},"nullable":true,"metadata":{}}
//! ]}
//! ```
//!
//! Primitive types are encoded as bare strings, container types as tagged
//! objects. This module models that document, validates column names, and
//! hosts the compatibility rules (read compatibility, numeric widening,
//! evolution merge) in [`compat`] and the SET/INSERT assignment-path checks
//! in [`assignments`].

pub mod assignments;
pub mod compat;

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{Backtrace, prelude::*};

/// Characters that may not appear in a column name.
const INVALID_NAME_CHARS: &[char] = &[' ', ',', ';', '{', '}', '(', ')', '\n', '\t', '='];

/// Errors raised while parsing or validating schemas.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SchemaError {
    /// The schema document failed to parse.
    #[snafu(display("Invalid schema document: {source}"))]
    ParseSchema {
        /// Underlying JSON error.
        source: serde_json::Error,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// A column name contains a forbidden character.
    #[snafu(display("Invalid column name: {name:?}"))]
    InvalidColumnName {
        /// The offending name.
        name: String,
    },

    /// Two columns share a name.
    #[snafu(display("Duplicate column name: {name}"))]
    DuplicateColumn {
        /// The duplicated name.
        name: String,
    },

    /// A referenced column does not exist.
    #[snafu(display("Unknown column: {name}"))]
    UnknownColumn {
        /// The missing column path.
        name: String,
    },

    /// Schemas cannot be reconciled (conflicting or narrowing types).
    #[snafu(display("Incompatible schema change for column {column}: {existing} -> {incoming}"))]
    IncompatibleSchema {
        /// The column whose type conflicts.
        column: String,
        /// The existing type.
        existing: String,
        /// The incoming type.
        incoming: String,
    },

    /// An assignment path traverses a non-struct column.
    #[snafu(display("Cannot set nested field {path}: {column} is not a struct"))]
    NotAStructPath {
        /// The full assignment path.
        path: String,
        /// The non-struct component.
        column: String,
    },

    /// INSERT value maps must be flat; nested paths are rejected.
    #[snafu(display("Nested field {path} may not appear in an INSERT value map"))]
    NestedFieldInInsert {
        /// The nested path that was supplied.
        path: String,
    },

    /// Two assignments target overlapping paths.
    #[snafu(display("Conflicting assignments: {first} and {second}"))]
    ConflictingAssignments {
        /// The first path.
        first: String,
        /// The overlapping path.
        second: String,
    },
}

/// Primitive column types, encoded as bare strings in the schema document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveType {
    /// Boolean value.
    Boolean,
    /// 8-bit signed integer.
    Byte,
    /// 16-bit signed integer.
    Short,
    /// 32-bit signed integer.
    Integer,
    /// 64-bit signed integer.
    Long,
    /// 32-bit floating point.
    Float,
    /// 64-bit floating point.
    Double,
    /// UTF-8 string.
    String,
    /// Variable-length binary data.
    Binary,
    /// Calendar date without time.
    Date,
    /// Microsecond-precision UTC timestamp.
    Timestamp,
}

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PrimitiveType::Boolean => "boolean",
            PrimitiveType::Byte => "byte",
            PrimitiveType::Short => "short",
            PrimitiveType::Integer => "integer",
            PrimitiveType::Long => "long",
            PrimitiveType::Float => "float",
            PrimitiveType::Double => "double",
            PrimitiveType::String => "string",
            PrimitiveType::Binary => "binary",
            PrimitiveType::Date => "date",
            PrimitiveType::Timestamp => "timestamp",
        };
        write!(f, "{name}")
    }
}

macro_rules! container_tag {
    ($name:ident, $tag:literal) => {
        #[doc = concat!("Marker for the `", $tag, "` container tag.")]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
        pub enum $name {
            #[doc = "The only value."]
            #[serde(rename = $tag)]
            #[default]
            Tag,
        }
    };
}

container_tag!(StructTag, "struct");
container_tag!(ArrayTag, "array");
container_tag!(MapTag, "map");

/// A column (or nested field) definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructField {
    /// Field name.
    pub name: String,

    /// Field type.
    #[serde(rename = "type")]
    pub data_type: DataType,

    /// Whether the field admits NULL.
    pub nullable: bool,

    /// Field-level metadata (column invariants live here under
    /// `delta.invariants`).
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl StructField {
    /// A new field with empty metadata.
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
            metadata: HashMap::new(),
        }
    }

    /// Whether the field declares a column invariant in its metadata.
    pub fn has_invariant(&self) -> bool {
        self.metadata.contains_key("delta.invariants")
    }
}

/// A struct type: an ordered list of named fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructType {
    #[serde(rename = "type")]
    tag: StructTag,

    /// Ordered fields.
    pub fields: Vec<StructField>,
}

/// An array type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrayType {
    #[serde(rename = "type")]
    tag: ArrayTag,

    /// Element type.
    pub element_type: DataType,

    /// Whether elements admit NULL.
    pub contains_null: bool,
}

/// A map type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapType {
    #[serde(rename = "type")]
    tag: MapTag,

    /// Key type.
    pub key_type: DataType,

    /// Value type.
    pub value_type: DataType,

    /// Whether values admit NULL.
    pub value_contains_null: bool,
}

/// Any column type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataType {
    /// A primitive, encoded as a bare string.
    Primitive(PrimitiveType),
    /// A nested struct.
    Struct(Box<StructType>),
    /// An array.
    Array(Box<ArrayType>),
    /// A map.
    Map(Box<MapType>),
}

impl DataType {
    /// Shorthand for a primitive type.
    pub const fn primitive(p: PrimitiveType) -> Self {
        DataType::Primitive(p)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Primitive(p) => write!(f, "{p}"),
            DataType::Struct(s) => {
                write!(f, "struct<")?;
                for (i, field) in s.fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", field.name, field.data_type)?;
                }
                write!(f, ">")
            }
            DataType::Array(a) => write!(f, "array<{}>", a.element_type),
            DataType::Map(m) => write!(f, "map<{}, {}>", m.key_type, m.value_type),
        }
    }
}

impl ArrayType {
    /// A new array type.
    pub fn new(element_type: DataType, contains_null: bool) -> Self {
        Self {
            tag: ArrayTag::Tag,
            element_type,
            contains_null,
        }
    }
}

impl MapType {
    /// A new map type.
    pub fn new(key_type: DataType, value_type: DataType, value_contains_null: bool) -> Self {
        Self {
            tag: MapTag::Tag,
            key_type,
            value_type,
            value_contains_null,
        }
    }
}

impl StructType {
    /// Construct a validated struct type.
    ///
    /// Rejects duplicate and malformed column names, recursively.
    pub fn new(fields: Vec<StructField>) -> Result<Self, SchemaError> {
        let schema = Self {
            tag: StructTag::Tag,
            fields,
        };
        schema.validate()?;
        Ok(schema)
    }

    fn validate(&self) -> Result<(), SchemaError> {
        let mut seen = HashSet::new();
        for field in &self.fields {
            validate_column_name(&field.name)?;
            if !seen.insert(field.name.as_str()) {
                return DuplicateColumnSnafu {
                    name: field.name.clone(),
                }
                .fail();
            }
            if let DataType::Struct(nested) = &field.data_type {
                nested.validate()?;
            }
        }
        Ok(())
    }

    /// Parse a schema from its `schemaString` JSON form.
    pub fn from_json(schema_string: &str) -> Result<Self, SchemaError> {
        let schema: StructType = serde_json::from_str(schema_string).context(ParseSchemaSnafu)?;
        schema.validate()?;
        Ok(schema)
    }

    /// Serialize to the `schemaString` JSON form.
    pub fn to_json(&self) -> Result<String, SchemaError> {
        serde_json::to_string(self).context(ParseSchemaSnafu)
    }

    /// Look up a top-level field by name.
    pub fn field(&self, name: &str) -> Option<&StructField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Position of a top-level field.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Top-level field names in order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Resolve a dotted path (`a.b.c`) through nested structs.
    ///
    /// Fails with [`SchemaError::UnknownColumn`] if a component is missing
    /// and [`SchemaError::NotAStructPath`] if a non-terminal component is
    /// not a struct.
    pub fn field_at_path(&self, path: &str) -> Result<&StructField, SchemaError> {
        let mut parts = path.split('.');
        let head = parts.next().unwrap_or_default();
        let mut current = self.field(head).context(UnknownColumnSnafu { name: head })?;

        for part in parts {
            let nested = match &current.data_type {
                DataType::Struct(s) => s,
                _ => {
                    return NotAStructPathSnafu {
                        path: path.to_string(),
                        column: current.name.clone(),
                    }
                    .fail();
                }
            };
            current = nested
                .field(part)
                .context(UnknownColumnSnafu { name: path })?;
        }
        Ok(current)
    }

    /// Whether any field (recursively) declares a column invariant.
    pub fn has_invariants(&self) -> bool {
        fn walk(fields: &[StructField]) -> bool {
            fields.iter().any(|f| {
                f.has_invariant()
                    || matches!(&f.data_type, DataType::Struct(s) if walk(&s.fields))
            })
        }
        walk(&self.fields)
    }
}

/// Reject names containing characters that break the on-disk formats.
pub fn validate_column_name(name: &str) -> Result<(), SchemaError> {
    if name.is_empty() || name.contains(INVALID_NAME_CHARS) {
        return InvalidColumnNameSnafu { name }.fail();
    }
    Ok(())
}
