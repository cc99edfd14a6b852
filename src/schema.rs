//! Class schema types
//!
//! A class schema is stored as one JSON blob per class in the metadata table.
//! Schemas are normalized on the way in ([`to_storage_schema`]) and on the way
//! out ([`from_storage_schema`]).

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::types::{FieldDescriptor, FieldType};

/// Class whose schema carries password and token secrets
pub const USER_CLASS: &str = "_User";

/// Prefix of join table names
pub const JOIN_TABLE_PREFIX: &str = "_Join:";

/// Permission map of a single CLP operation
pub type PermissionMap = Map<String, Value>;

/// Index definition: ordered field name to direction/kind
pub type IndexKey = Map<String, Value>;

/// Class-level permissions
///
/// Every operation key is always present once a schema has been normalized.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClassLevelPermissions {
    #[serde(default)]
    pub find: PermissionMap,
    #[serde(default)]
    pub get: PermissionMap,
    #[serde(default)]
    pub count: PermissionMap,
    #[serde(default)]
    pub create: PermissionMap,
    #[serde(default)]
    pub update: PermissionMap,
    #[serde(default)]
    pub delete: PermissionMap,
    #[serde(default, rename = "addField")]
    pub add_field: PermissionMap,
    #[serde(default, rename = "protectedFields")]
    pub protected_fields: PermissionMap,
    /// Pointer-permission keys and anything else the platform stores
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl ClassLevelPermissions {
    /// Public access for every operation
    pub fn permissive() -> Self {
        let public = || {
            let mut map = Map::new();
            map.insert("*".to_string(), Value::Bool(true));
            map
        };
        let mut protected_fields = Map::new();
        protected_fields.insert("*".to_string(), json!([]));

        Self {
            find: public(),
            get: public(),
            count: public(),
            create: public(),
            update: public(),
            delete: public(),
            add_field: public(),
            protected_fields,
            other: Map::new(),
        }
    }
}

/// Schema of one class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassSchema {
    #[serde(rename = "className")]
    pub class_name: String,

    #[serde(default)]
    pub fields: IndexMap<String, FieldDescriptor>,

    #[serde(
        rename = "classLevelPermissions",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub class_level_permissions: Option<ClassLevelPermissions>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexes: Option<IndexMap<String, IndexKey>>,
}

impl ClassSchema {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            fields: IndexMap::new(),
            class_level_permissions: None,
            indexes: None,
        }
    }

    /// Schema with the default columns every class has
    pub fn with_default_fields(class_name: impl Into<String>) -> Self {
        Self::new(class_name)
            .field("objectId", FieldDescriptor::new(FieldType::String))
            .field("createdAt", FieldDescriptor::new(FieldType::Date))
            .field("updatedAt", FieldDescriptor::new(FieldType::Date))
    }

    pub fn field(mut self, name: impl Into<String>, descriptor: FieldDescriptor) -> Self {
        self.fields.insert(name.into(), descriptor);
        self
    }

    pub fn with_permissions(mut self, clp: ClassLevelPermissions) -> Self {
        self.class_level_permissions = Some(clp);
        self
    }

    pub fn with_indexes(mut self, indexes: IndexMap<String, IndexKey>) -> Self {
        self.indexes = Some(indexes);
        self
    }

    pub fn field_type(&self, name: &str) -> Option<&FieldType> {
        self.fields.get(name).map(|f| &f.field_type)
    }

    pub fn is_array_field(&self, name: &str) -> bool {
        self.field_type(name) == Some(&FieldType::Array)
    }

    /// Names of the join tables backing this class's Relation fields
    pub fn join_tables(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|(_, f)| f.is_relation())
            .map(|(name, _)| join_table_name(name, &self.class_name))
            .collect()
    }
}

/// Join table name for a Relation field
pub fn join_table_name(field_name: &str, class_name: &str) -> String {
    format!("{}{}:{}", JOIN_TABLE_PREFIX, field_name, class_name)
}

/// Whether a relation name refers to a join table rather than a class
pub fn is_join_table(name: &str) -> bool {
    name.starts_with(JOIN_TABLE_PREFIX)
}

/// Join tables for a stored schema blob
pub fn join_tables_for_schema(schema: &ClassSchema) -> Vec<String> {
    schema.join_tables()
}

/// Prepare a schema for storage and DDL
///
/// Adds the `_rperm`/`_wperm` ACL columns and, for `_User`, the password columns.
pub fn to_storage_schema(schema: &ClassSchema) -> ClassSchema {
    let mut schema = schema.clone();
    schema
        .fields
        .insert("_wperm".to_string(), FieldDescriptor::array_of(FieldType::String));
    schema
        .fields
        .insert("_rperm".to_string(), FieldDescriptor::array_of(FieldType::String));
    if schema.class_name == USER_CLASS {
        schema
            .fields
            .insert("_hashed_password".to_string(), FieldDescriptor::new(FieldType::String));
        schema.fields.insert(
            "_password_history".to_string(),
            FieldDescriptor::new(FieldType::Array),
        );
    }
    schema
}

/// Normalize a stored schema for callers
///
/// Strips internal columns and fills in class-level permissions: a schema with
/// no stored permissions gets [`ClassLevelPermissions::permissive`], otherwise
/// missing operation keys are empty.
pub fn from_storage_schema(schema: &ClassSchema) -> ClassSchema {
    let mut schema = schema.clone();
    if schema.class_name == USER_CLASS {
        schema.fields.shift_remove("_hashed_password");
    }
    schema.fields.shift_remove("_wperm");
    schema.fields.shift_remove("_rperm");
    if schema.class_level_permissions.is_none() {
        schema.class_level_permissions = Some(ClassLevelPermissions::permissive());
    }
    if schema.indexes.as_ref().is_some_and(|i| i.is_empty()) {
        schema.indexes = None;
    }
    schema
}

/// Secret `_User` fields that may be written without being declared
pub const USER_SECRET_FIELDS: &[(&str, FieldType)] = &[
    ("_email_verify_token_expires_at", FieldType::Date),
    ("_email_verify_token", FieldType::String),
    ("_account_lockout_expires_at", FieldType::Date),
    ("_failed_login_count", FieldType::Number),
    ("_perishable_token", FieldType::String),
    ("_perishable_token_expires_at", FieldType::Date),
    ("_password_changed_at", FieldType::Date),
    ("_password_history", FieldType::Array),
];

/// Descriptor of an undeclared `_User` secret field
pub fn user_secret_field(name: &str) -> Option<FieldDescriptor> {
    USER_SECRET_FIELDS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, t)| FieldDescriptor::new(t.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_schema() -> ClassSchema {
        ClassSchema::with_default_fields(USER_CLASS)
            .field("username", FieldDescriptor::new(FieldType::String))
            .field("friends", FieldDescriptor::relation(USER_CLASS))
    }

    // =========================================================================
    // Normalization Tests
    // =========================================================================

    #[test]
    fn test_to_storage_adds_acl_columns() {
        let schema = to_storage_schema(&ClassSchema::with_default_fields("Post"));
        assert!(schema.fields["_rperm"].is_string_array());
        assert!(schema.fields["_wperm"].is_string_array());
        assert!(!schema.fields.contains_key("_hashed_password"));
    }

    #[test]
    fn test_to_storage_adds_user_secrets() {
        let schema = to_storage_schema(&user_schema());
        assert!(schema.fields.contains_key("_hashed_password"));
        assert!(schema.fields.contains_key("_password_history"));
    }

    #[test]
    fn test_from_storage_strips_internal_columns() {
        let stored = to_storage_schema(&user_schema());
        let schema = from_storage_schema(&stored);
        assert!(!schema.fields.contains_key("_hashed_password"));
        assert!(!schema.fields.contains_key("_rperm"));
        assert!(!schema.fields.contains_key("_wperm"));
        assert!(schema.fields.contains_key("username"));
    }

    #[test]
    fn test_from_storage_defaults_to_permissive_clp() {
        let schema = from_storage_schema(&ClassSchema::new("Post"));
        let clp = schema.class_level_permissions.unwrap();
        assert_eq!(clp.find.get("*"), Some(&Value::Bool(true)));
        assert_eq!(clp.protected_fields.get("*"), Some(&json!([])));
    }

    #[test]
    fn test_partial_clp_gets_every_key() {
        let stored: ClassSchema = serde_json::from_value(json!({
            "className": "Post",
            "fields": {},
            "classLevelPermissions": {"find": {"role:admin": true}}
        }))
        .unwrap();
        let schema = from_storage_schema(&stored);
        let value = serde_json::to_value(schema.class_level_permissions.unwrap()).unwrap();
        for key in [
            "find",
            "get",
            "count",
            "create",
            "update",
            "delete",
            "addField",
            "protectedFields",
        ] {
            assert!(value.get(key).is_some(), "missing CLP key {}", key);
        }
        assert_eq!(value["find"], json!({"role:admin": true}));
        assert_eq!(value["get"], json!({}));
    }

    // =========================================================================
    // Join Table Tests
    // =========================================================================

    #[test]
    fn test_join_tables() {
        assert_eq!(user_schema().join_tables(), vec!["_Join:friends:_User"]);
        assert!(is_join_table("_Join:friends:_User"));
        assert!(!is_join_table("_User"));
    }

    #[test]
    fn test_fields_keep_declaration_order() {
        let schema: ClassSchema = serde_json::from_value(json!({
            "className": "Post",
            "fields": {"zeta": {"type": "String"}, "alpha": {"type": "Number"}}
        }))
        .unwrap();
        let names: Vec<_> = schema.fields.keys().cloned().collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
    }

    #[test]
    fn test_user_secret_field_lookup() {
        assert_eq!(
            user_secret_field("_failed_login_count").unwrap().field_type,
            FieldType::Number
        );
        assert!(user_secret_field("username").is_none());
    }
}
