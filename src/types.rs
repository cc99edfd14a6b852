//! Core type definitions for the storage adapter
//!
//! Field descriptors as the platform declares them, and the mapping between those
//! and PostgreSQL column types.

use serde::{Deserialize, Serialize};

use crate::error::{AdapterError, Result};

// ============================================================================
// Field Types
// ============================================================================

/// Abstract field type as declared in a class schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Date,
    Object,
    Array,
    Pointer,
    Relation,
    GeoPoint,
    Polygon,
    Bytes,
    File,
    /// A type name this adapter has no column mapping for
    Other(String),
}

impl From<String> for FieldType {
    fn from(name: String) -> Self {
        match name.as_str() {
            "String" => FieldType::String,
            "Number" => FieldType::Number,
            "Boolean" => FieldType::Boolean,
            "Date" => FieldType::Date,
            "Object" => FieldType::Object,
            "Array" => FieldType::Array,
            "Pointer" => FieldType::Pointer,
            "Relation" => FieldType::Relation,
            "GeoPoint" => FieldType::GeoPoint,
            "Polygon" => FieldType::Polygon,
            "Bytes" => FieldType::Bytes,
            "File" => FieldType::File,
            _ => FieldType::Other(name),
        }
    }
}

impl From<FieldType> for String {
    fn from(field_type: FieldType) -> Self {
        field_type.as_str().to_string()
    }
}

impl FieldType {
    pub fn as_str(&self) -> &str {
        match self {
            FieldType::String => "String",
            FieldType::Number => "Number",
            FieldType::Boolean => "Boolean",
            FieldType::Date => "Date",
            FieldType::Object => "Object",
            FieldType::Array => "Array",
            FieldType::Pointer => "Pointer",
            FieldType::Relation => "Relation",
            FieldType::GeoPoint => "GeoPoint",
            FieldType::Polygon => "Polygon",
            FieldType::Bytes => "Bytes",
            FieldType::File => "File",
            FieldType::Other(name) => name,
        }
    }
}

// ============================================================================
// Field Descriptor
// ============================================================================

/// Declaration of a single field in a class schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    #[serde(rename = "type")]
    pub field_type: FieldType,

    /// Target class for Pointer and Relation fields
    #[serde(rename = "targetClass", skip_serializing_if = "Option::is_none")]
    pub target_class: Option<String>,

    /// Element type for Array fields
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contents: Option<Box<FieldDescriptor>>,

    /// Extra keys the platform stores alongside (required, defaultValue, ...)
    #[serde(flatten)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl FieldDescriptor {
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            target_class: None,
            contents: None,
            options: serde_json::Map::new(),
        }
    }

    pub fn pointer(target_class: impl Into<String>) -> Self {
        Self::new(FieldType::Pointer).with_target(target_class)
    }

    pub fn relation(target_class: impl Into<String>) -> Self {
        Self::new(FieldType::Relation).with_target(target_class)
    }

    /// Array of the given element type
    pub fn array_of(contents: FieldType) -> Self {
        let mut descriptor = Self::new(FieldType::Array);
        descriptor.contents = Some(Box::new(Self::new(contents)));
        descriptor
    }

    pub fn with_target(mut self, target_class: impl Into<String>) -> Self {
        self.target_class = Some(target_class.into());
        self
    }

    pub fn is_relation(&self) -> bool {
        self.field_type == FieldType::Relation
    }

    /// Whether this is an Array with String contents (native text[] column)
    pub fn is_string_array(&self) -> bool {
        self.field_type == FieldType::Array
            && self
                .contents
                .as_ref()
                .is_some_and(|c| c.field_type == FieldType::String)
    }

    /// Column type for this field
    ///
    /// Relation fields have no column; they are stored in a join table and
    /// map to [`ColumnType::None`].
    pub fn to_column_type(&self) -> Result<ColumnType> {
        Ok(match &self.field_type {
            FieldType::String => ColumnType::Text,
            FieldType::Date => ColumnType::Timestamp,
            FieldType::Object => ColumnType::Jsonb,
            FieldType::File => ColumnType::Text,
            FieldType::Boolean => ColumnType::Boolean,
            FieldType::Pointer => ColumnType::Text,
            FieldType::Number => ColumnType::DoublePrecision,
            FieldType::GeoPoint => ColumnType::Point,
            FieldType::Bytes => ColumnType::Jsonb,
            FieldType::Polygon => ColumnType::Polygon,
            FieldType::Array if self.is_string_array() => ColumnType::TextArray,
            FieldType::Array => ColumnType::Jsonb,
            FieldType::Relation => ColumnType::None,
            FieldType::Other(name) => {
                return Err(AdapterError::UnsupportedType(format!(
                    "no type for {} yet",
                    name
                )));
            }
        })
    }
}

// ============================================================================
// Column Types
// ============================================================================

/// PostgreSQL column type a field materializes as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    TextArray,
    Timestamp,
    Jsonb,
    Boolean,
    DoublePrecision,
    Point,
    Polygon,
    /// No column (Relation)
    None,
}

impl ColumnType {
    /// PostgreSQL type string used in DDL
    pub fn to_sql_type(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::TextArray => "text[]",
            ColumnType::Timestamp => "timestamp with time zone",
            ColumnType::Jsonb => "jsonb",
            ColumnType::Boolean => "boolean",
            ColumnType::DoublePrecision => "double precision",
            ColumnType::Point => "point",
            ColumnType::Polygon => "polygon",
            ColumnType::None => "",
        }
    }

    /// Parse a type name as reported by `information_schema.columns.data_type`
    pub fn from_sql_type(sql_type: &str) -> Option<Self> {
        match sql_type.to_lowercase().as_str() {
            "text" | "character varying" => Some(ColumnType::Text),
            "text[]" | "array" => Some(ColumnType::TextArray),
            "timestamp with time zone" | "timestamptz" => Some(ColumnType::Timestamp),
            "jsonb" | "json" => Some(ColumnType::Jsonb),
            "boolean" => Some(ColumnType::Boolean),
            "double precision" => Some(ColumnType::DoublePrecision),
            "point" => Some(ColumnType::Point),
            "polygon" => Some(ColumnType::Polygon),
            _ => None,
        }
    }

    /// Best-effort field descriptor for a column type
    ///
    /// The mapping is lossy: text columns could be String, File or Pointer, and
    /// jsonb columns could be Object, Bytes or Array.
    pub fn to_field_descriptor(&self) -> Option<FieldDescriptor> {
        let field_type = match self {
            ColumnType::Text => FieldType::String,
            ColumnType::TextArray => return Some(FieldDescriptor::array_of(FieldType::String)),
            ColumnType::Timestamp => FieldType::Date,
            ColumnType::Jsonb => FieldType::Object,
            ColumnType::Boolean => FieldType::Boolean,
            ColumnType::DoublePrecision => FieldType::Number,
            ColumnType::Point => FieldType::GeoPoint,
            ColumnType::Polygon => FieldType::Polygon,
            ColumnType::None => return None,
        };
        Some(FieldDescriptor::new(field_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // =========================================================================
    // Column Type Mapping Tests
    // =========================================================================

    #[test]
    fn test_scalar_types() {
        let cases = [
            (FieldType::String, "text"),
            (FieldType::Number, "double precision"),
            (FieldType::Boolean, "boolean"),
            (FieldType::Date, "timestamp with time zone"),
            (FieldType::Object, "jsonb"),
            (FieldType::Bytes, "jsonb"),
            (FieldType::File, "text"),
            (FieldType::GeoPoint, "point"),
            (FieldType::Polygon, "polygon"),
        ];
        for (field_type, sql) in cases {
            let column = FieldDescriptor::new(field_type).to_column_type().unwrap();
            assert_eq!(column.to_sql_type(), sql);
        }
    }

    #[test]
    fn test_pointer_maps_to_text() {
        let column = FieldDescriptor::pointer("_User").to_column_type().unwrap();
        assert_eq!(column, ColumnType::Text);
    }

    #[test]
    fn test_string_array_is_native() {
        let column = FieldDescriptor::array_of(FieldType::String)
            .to_column_type()
            .unwrap();
        assert_eq!(column, ColumnType::TextArray);
    }

    #[test]
    fn test_other_arrays_are_jsonb() {
        let untyped = FieldDescriptor::new(FieldType::Array).to_column_type().unwrap();
        assert_eq!(untyped, ColumnType::Jsonb);

        let numbers = FieldDescriptor::array_of(FieldType::Number)
            .to_column_type()
            .unwrap();
        assert_eq!(numbers, ColumnType::Jsonb);
    }

    #[test]
    fn test_relation_has_no_column() {
        let column = FieldDescriptor::relation("Post").to_column_type().unwrap();
        assert_eq!(column, ColumnType::None);
    }

    #[test]
    fn test_unknown_type_fails() {
        let err = FieldDescriptor::new(FieldType::Other("Money".to_string()))
            .to_column_type()
            .unwrap_err();
        assert!(matches!(err, AdapterError::UnsupportedType(_)));
        assert!(err.to_string().contains("Money"));
    }

    #[test]
    fn test_reverse_mapping() {
        let descriptor = ColumnType::from_sql_type("double precision")
            .and_then(|c| c.to_field_descriptor())
            .unwrap();
        assert_eq!(descriptor.field_type, FieldType::Number);
        assert!(ColumnType::None.to_field_descriptor().is_none());
        assert!(ColumnType::TextArray.to_field_descriptor().unwrap().is_string_array());
    }

    // =========================================================================
    // Serialization Tests
    // =========================================================================

    #[test]
    fn test_descriptor_deserialization() {
        let descriptor: FieldDescriptor =
            serde_json::from_value(json!({"type": "Pointer", "targetClass": "_User"})).unwrap();
        assert_eq!(descriptor.field_type, FieldType::Pointer);
        assert_eq!(descriptor.target_class.as_deref(), Some("_User"));
    }

    #[test]
    fn test_descriptor_keeps_extra_keys() {
        let value = json!({"type": "String", "required": true, "defaultValue": "x"});
        let descriptor: FieldDescriptor = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(descriptor.options.get("required"), Some(&json!(true)));
        assert_eq!(serde_json::to_value(&descriptor).unwrap(), value);
    }

    #[test]
    fn test_unknown_type_name_round_trips() {
        let descriptor: FieldDescriptor = serde_json::from_value(json!({"type": "ACL"})).unwrap();
        assert_eq!(descriptor.field_type, FieldType::Other("ACL".to_string()));
        assert_eq!(serde_json::to_value(&descriptor).unwrap(), json!({"type": "ACL"}));
    }
}
