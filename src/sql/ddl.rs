//! DDL Generation for class tables
//!
//! Generates PostgreSQL DDL for the metadata table, class tables, join tables,
//! columns and indexes, plus the helper functions compiled statements call.
//! Everything that may race across processes is emitted as idempotent DDL.

use crate::config::AdapterConfig;
use crate::error::Result;
use crate::schema::{ClassSchema, USER_CLASS, USER_SECRET_FIELDS, join_table_name, to_storage_schema};
use crate::sql::sanitize::quote_identifier;
use crate::types::{ColumnType, FieldDescriptor};

/// Helper functions installed once per database
const HELPER_FUNCTIONS: &[&str] = &[
    r#"CREATE OR REPLACE FUNCTION array_add("array" jsonb, "values" jsonb)
RETURNS jsonb LANGUAGE sql IMMUTABLE STRICT AS $function$
  SELECT "array" || "values";
$function$"#,
    r#"CREATE OR REPLACE FUNCTION array_add_unique("array" jsonb, "values" jsonb)
RETURNS jsonb LANGUAGE sql IMMUTABLE STRICT AS $function$
  SELECT COALESCE(jsonb_agg(elt ORDER BY ord), '[]'::jsonb)
  FROM (
    SELECT DISTINCT ON (elt) elt, ord
    FROM jsonb_array_elements("array" || "values") WITH ORDINALITY AS t(elt, ord)
    ORDER BY elt, ord
  ) AS uniq;
$function$"#,
    r#"CREATE OR REPLACE FUNCTION array_remove("array" jsonb, "values" jsonb)
RETURNS jsonb LANGUAGE sql IMMUTABLE STRICT AS $function$
  SELECT COALESCE(jsonb_agg(elt ORDER BY ord), '[]'::jsonb)
  FROM jsonb_array_elements("array") WITH ORDINALITY AS t(elt, ord)
  WHERE elt NOT IN (SELECT jsonb_array_elements("values"));
$function$"#,
    r#"CREATE OR REPLACE FUNCTION array_contains("array" jsonb, "values" jsonb)
RETURNS boolean LANGUAGE sql IMMUTABLE STRICT AS $function$
  SELECT EXISTS (
    SELECT 1 FROM jsonb_array_elements("array") AS elt
    WHERE elt IN (SELECT jsonb_array_elements("values"))
  );
$function$"#,
    r#"CREATE OR REPLACE FUNCTION array_contains_all("array" jsonb, "values" jsonb)
RETURNS boolean LANGUAGE sql IMMUTABLE STRICT AS $function$
  SELECT CASE
    WHEN jsonb_array_length("values") = 0 THEN false
    ELSE (
      SELECT COUNT(DISTINCT elt) = (SELECT COUNT(DISTINCT v) FROM jsonb_array_elements("values") AS v)
      FROM jsonb_array_elements("array") AS elt
      WHERE elt IN (SELECT jsonb_array_elements("values"))
    )
  END;
$function$"#,
    r#"CREATE OR REPLACE FUNCTION array_contains_all_regex("array" jsonb, "values" jsonb)
RETURNS boolean LANGUAGE sql IMMUTABLE STRICT AS $function$
  SELECT CASE
    WHEN jsonb_array_length("values") = 0 THEN false
    ELSE (
      SELECT bool_and(EXISTS (
        SELECT 1 FROM jsonb_array_elements_text("array") AS elt
        WHERE elt LIKE pattern
      ))
      FROM jsonb_array_elements_text("values") AS pattern
    )
  END;
$function$"#,
    r#"CREATE OR REPLACE FUNCTION json_object_set_key("json" jsonb, key_to_set text, value_to_set jsonb)
RETURNS jsonb LANGUAGE sql IMMUTABLE AS $function$
  SELECT CASE
    WHEN value_to_set IS NULL OR value_to_set = 'null'::jsonb
      THEN COALESCE("json", '{}'::jsonb) - key_to_set
    ELSE COALESCE("json", '{}'::jsonb) || jsonb_build_object(key_to_set, value_to_set)
  END;
$function$"#,
];

/// DDL Generator for class tables
pub struct DdlGenerator<'a> {
    config: &'a AdapterConfig,
}

impl<'a> DdlGenerator<'a> {
    pub fn new(config: &'a AdapterConfig) -> Self {
        Self { config }
    }

    /// Quoted name of the metadata table
    pub fn metadata_table(&self) -> String {
        quote_identifier(&self.config.metadata_table)
    }

    /// Generate the metadata table, one row per class
    pub fn create_metadata_table(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\"className\" varChar(120), \"schema\" jsonb, \"isParseClass\" bool, PRIMARY KEY (\"className\"))",
            self.metadata_table()
        )
    }

    /// Helper function definitions
    pub fn helper_functions(&self) -> Vec<String> {
        HELPER_FUNCTIONS.iter().map(|f| f.to_string()).collect()
    }

    /// Generate CREATE TABLE for a class plus its join tables
    ///
    /// The class table gets every non-relation field of the storage schema
    /// (so `_rperm`/`_wperm` and the `_User` secret columns are included) with `objectId`
    /// as the primary key.
    pub fn create_class_table(&self, schema: &ClassSchema) -> Result<Vec<String>> {
        let mut storage = ClassSchema::with_default_fields(&schema.class_name);
        storage.fields.extend(to_storage_schema(schema).fields);
        if storage.class_name == USER_CLASS {
            for (name, field_type) in USER_SECRET_FIELDS {
                storage
                    .fields
                    .entry(name.to_string())
                    .or_insert_with(|| FieldDescriptor::new(field_type.clone()));
            }
        }
        let mut column_defs = Vec::new();
        let mut join_tables = Vec::new();

        for (name, descriptor) in &storage.fields {
            if descriptor.is_relation() {
                join_tables.push(self.create_join_table(&join_table_name(name, &schema.class_name)));
                continue;
            }
            column_defs.push(Self::format_column_definition(name, descriptor)?);
        }
        column_defs.push("PRIMARY KEY (\"objectId\")".to_string());

        let mut statements = vec![format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_identifier(&schema.class_name),
            column_defs.join(", ")
        )];
        statements.extend(join_tables);
        Ok(statements)
    }

    /// Generate a relation join table
    pub fn create_join_table(&self, table_name: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\"relatedId\" varChar(120), \"owningId\" varChar(120), PRIMARY KEY (\"relatedId\", \"owningId\"))",
            quote_identifier(table_name)
        )
    }

    /// Generate the statement materializing one new field
    ///
    /// Relation fields produce a join table instead of a column.
    pub fn add_field(
        &self,
        class_name: &str,
        field_name: &str,
        descriptor: &FieldDescriptor,
    ) -> Result<String> {
        if descriptor.is_relation() {
            return Ok(self.create_join_table(&join_table_name(field_name, class_name)));
        }
        Ok(format!(
            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {}",
            quote_identifier(class_name),
            Self::format_column_definition(field_name, descriptor)?
        ))
    }

    /// Generate a single ALTER TABLE dropping every named column
    ///
    /// Returns `None` when there is nothing to drop. Columns that never
    /// existed are ignored.
    pub fn drop_columns(&self, class_name: &str, field_names: &[String]) -> Option<String> {
        if field_names.is_empty() {
            return None;
        }
        let drops: Vec<String> = field_names
            .iter()
            .map(|name| format!("DROP COLUMN IF EXISTS {}", quote_identifier(name)))
            .collect();
        Some(format!(
            "ALTER TABLE {} {}",
            quote_identifier(class_name),
            drops.join(", ")
        ))
    }

    /// Generate DROP TABLE statement
    pub fn drop_table(&self, table_name: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", quote_identifier(table_name))
    }

    /// Generate CREATE INDEX statement
    ///
    /// With `case_insensitive` every column is indexed as
    /// `lower(col) varchar_pattern_ops` for prefix matching on lowered values.
    pub fn create_index(
        &self,
        class_name: &str,
        index_name: &str,
        field_names: &[String],
        case_insensitive: bool,
    ) -> String {
        let columns: Vec<String> = field_names
            .iter()
            .map(|name| {
                if case_insensitive {
                    format!("lower({}) varchar_pattern_ops", quote_identifier(name))
                } else {
                    quote_identifier(name)
                }
            })
            .collect();

        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            quote_identifier(index_name),
            quote_identifier(class_name),
            columns.join(", ")
        )
    }

    /// Generate DROP INDEX statement
    pub fn drop_index(&self, index_name: &str) -> String {
        format!("DROP INDEX IF EXISTS {}", quote_identifier(index_name))
    }

    /// Generate a named unique constraint over `field_names`
    pub fn add_unique_constraint(&self, class_name: &str, field_names: &[String]) -> String {
        let columns: Vec<String> = field_names.iter().map(|f| quote_identifier(f)).collect();
        format!(
            "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({})",
            quote_identifier(class_name),
            quote_identifier(&unique_constraint_name(class_name, field_names)),
            columns.join(", ")
        )
    }

    /// Format a single column definition for CREATE TABLE or ADD COLUMN
    pub fn format_column_definition(name: &str, descriptor: &FieldDescriptor) -> Result<String> {
        let column_type = descriptor.to_column_type()?;
        let sql_type = if name == "objectId" && column_type == ColumnType::Text {
            "varChar(120)"
        } else {
            column_type.to_sql_type()
        };
        Ok(format!("{} {}", quote_identifier(name), sql_type))
    }
}

/// Name of the unique constraint over `field_names`, independent of field order
pub fn unique_constraint_name(class_name: &str, field_names: &[String]) -> String {
    let mut sorted: Vec<&str> = field_names.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    format!("{}_unique_{}", class_name, sorted.join("_"))
}

/// Name of an index created by `ensure_index` without an explicit name
pub fn default_index_name(class_name: &str, field_names: &[String]) -> String {
    let mut sorted: Vec<&str> = field_names.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    format!("{}_default_{}", class_name, sorted.join("_"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldType;

    fn config() -> AdapterConfig {
        AdapterConfig::builder("postgres://localhost/test").build()
    }

    fn names(fields: &[&str]) -> Vec<String> {
        fields.iter().map(|f| f.to_string()).collect()
    }

    // =========================================================================
    // CREATE TABLE Tests
    // =========================================================================

    #[test]
    fn test_metadata_table() {
        let config = AdapterConfig::builder("postgres://localhost/test")
            .metadata_table("_SCHEMA_test")
            .build();
        let ddl = DdlGenerator::new(&config);
        assert_eq!(
            ddl.create_metadata_table(),
            "CREATE TABLE IF NOT EXISTS \"_SCHEMA_test\" (\"className\" varChar(120), \"schema\" jsonb, \"isParseClass\" bool, PRIMARY KEY (\"className\"))"
        );
    }

    #[test]
    fn test_create_class_table() {
        let config = config();
        let ddl = DdlGenerator::new(&config);
        let schema = ClassSchema::with_default_fields("GameScore")
            .field("score", FieldDescriptor::new(FieldType::Number))
            .field("tags", FieldDescriptor::array_of(FieldType::String))
            .field("location", FieldDescriptor::new(FieldType::GeoPoint));

        let statements = ddl.create_class_table(&schema).unwrap();
        assert_eq!(statements.len(), 1);
        let sql = &statements[0];
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"GameScore\" ("));
        assert!(sql.contains("\"objectId\" varChar(120)"));
        assert!(sql.contains("\"createdAt\" timestamp with time zone"));
        assert!(sql.contains("\"score\" double precision"));
        assert!(sql.contains("\"tags\" text[]"));
        assert!(sql.contains("\"location\" point"));
        assert!(sql.contains("\"_rperm\" text[]"));
        assert!(sql.contains("\"_wperm\" text[]"));
        assert!(sql.ends_with("PRIMARY KEY (\"objectId\"))"));
    }

    #[test]
    fn test_relation_fields_become_join_tables() {
        let config = config();
        let ddl = DdlGenerator::new(&config);
        let schema = ClassSchema::with_default_fields("Team")
            .field("members", FieldDescriptor::relation("_User"));

        let statements = ddl.create_class_table(&schema).unwrap();
        assert_eq!(statements.len(), 2);
        assert!(!statements[0].contains("\"members\""));
        assert_eq!(
            statements[1],
            "CREATE TABLE IF NOT EXISTS \"_Join:members:Team\" (\"relatedId\" varChar(120), \"owningId\" varChar(120), PRIMARY KEY (\"relatedId\", \"owningId\"))"
        );
    }

    #[test]
    fn test_user_table_has_secret_columns() {
        let config = config();
        let ddl = DdlGenerator::new(&config);
        let statements = ddl
            .create_class_table(&ClassSchema::with_default_fields(USER_CLASS))
            .unwrap();
        assert!(statements[0].contains("\"_hashed_password\" text"));
        assert!(statements[0].contains("\"_email_verify_token_expires_at\" timestamp with time zone"));
        assert!(statements[0].contains("\"_failed_login_count\" double precision"));
    }

    #[test]
    fn test_unknown_field_type_fails() {
        let config = config();
        let ddl = DdlGenerator::new(&config);
        let schema = ClassSchema::with_default_fields("Odd")
            .field("x", FieldDescriptor::new(FieldType::Other("Money".to_string())));
        assert!(ddl.create_class_table(&schema).is_err());
    }

    // =========================================================================
    // ALTER TABLE Tests
    // =========================================================================

    #[test]
    fn test_add_field() {
        let config = config();
        let ddl = DdlGenerator::new(&config);
        assert_eq!(
            ddl.add_field("Post", "body", &FieldDescriptor::new(FieldType::String))
                .unwrap(),
            "ALTER TABLE \"Post\" ADD COLUMN IF NOT EXISTS \"body\" text"
        );
        assert_eq!(
            ddl.add_field("Post", "likes", &FieldDescriptor::relation("_User"))
                .unwrap(),
            ddl.create_join_table("_Join:likes:Post")
        );
    }

    #[test]
    fn test_drop_columns() {
        let config = config();
        let ddl = DdlGenerator::new(&config);
        assert_eq!(
            ddl.drop_columns("Post", &names(&["a", "b"])).unwrap(),
            "ALTER TABLE \"Post\" DROP COLUMN IF EXISTS \"a\", DROP COLUMN IF EXISTS \"b\""
        );
        assert!(ddl.drop_columns("Post", &[]).is_none());
    }

    #[test]
    fn test_drop_table() {
        let config = config();
        let ddl = DdlGenerator::new(&config);
        assert_eq!(ddl.drop_table("Post"), "DROP TABLE IF EXISTS \"Post\"");
    }

    // =========================================================================
    // Index Tests
    // =========================================================================

    #[test]
    fn test_create_index() {
        let config = config();
        let ddl = DdlGenerator::new(&config);
        assert_eq!(
            ddl.create_index("Post", "by_author", &names(&["author", "createdAt"]), false),
            "CREATE INDEX IF NOT EXISTS \"by_author\" ON \"Post\" (\"author\", \"createdAt\")"
        );
        assert_eq!(
            ddl.create_index("_User", "email_ci", &names(&["email"]), true),
            "CREATE INDEX IF NOT EXISTS \"email_ci\" ON \"_User\" (lower(\"email\") varchar_pattern_ops)"
        );
        assert_eq!(ddl.drop_index("by_author"), "DROP INDEX IF EXISTS \"by_author\"");
    }

    #[test]
    fn test_unique_constraint_is_order_independent() {
        let config = config();
        let ddl = DdlGenerator::new(&config);
        assert_eq!(
            unique_constraint_name("Post", &names(&["slug", "author"])),
            "Post_unique_author_slug"
        );
        assert_eq!(
            ddl.add_unique_constraint("Post", &names(&["slug", "author"])),
            "ALTER TABLE \"Post\" ADD CONSTRAINT \"Post_unique_author_slug\" UNIQUE (\"slug\", \"author\")"
        );
        assert_eq!(
            default_index_name("Post", &names(&["b", "a"])),
            "Post_default_a_b"
        );
    }

    #[test]
    fn test_helper_functions_cover_compiled_calls() {
        let config = config();
        let functions = DdlGenerator::new(&config).helper_functions().join("\n");
        for name in [
            "array_add(",
            "array_add_unique(",
            "array_remove(",
            "array_contains(",
            "array_contains_all(",
            "array_contains_all_regex(",
            "json_object_set_key(",
        ] {
            assert!(
                functions.contains(&format!("FUNCTION {}", name)),
                "missing {}",
                name
            );
        }
    }
}
