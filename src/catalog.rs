//! Schema catalog
//!
//! One row per class in the metadata table: `className`, the schema blob and
//! `isParseClass`. Schemas are normalized by [`from_storage_schema`] on every
//! read and stored in their [`to_storage_schema`] form.
//!
//! Every method takes the executor to run on so that catalog writes can join
//! the transaction of the DDL they describe.

use indexmap::IndexMap;
use serde_json::Value;
use sqlx::{PgExecutor, Row};

use crate::error::{AdapterError, Result};
use crate::schema::{
    ClassLevelPermissions, ClassSchema, IndexKey, from_storage_schema, to_storage_schema,
};
use crate::sql::codes::{PgErrorKind, classify};
use crate::sql::sanitize::quote_identifier;
use crate::types::FieldDescriptor;

/// Reads and writes of the metadata table
#[derive(Debug, Clone)]
pub struct SchemaCatalog {
    table: String,
}

impl SchemaCatalog {
    pub fn new(metadata_table: impl Into<String>) -> Self {
        Self {
            table: metadata_table.into(),
        }
    }

    fn quoted(&self) -> String {
        quote_identifier(&self.table)
    }

    fn decode(value: Value) -> Result<ClassSchema> {
        let stored: ClassSchema = serde_json::from_value(value)?;
        Ok(from_storage_schema(&stored))
    }

    /// Every class schema, normalized
    pub async fn get_all<'e, E: PgExecutor<'e>>(&self, executor: E) -> Result<Vec<ClassSchema>> {
        let sql = format!("SELECT \"schema\" FROM {}", self.quoted());
        let rows = sqlx::query(&sql).fetch_all(executor).await?;
        rows.into_iter()
            .map(|row| Self::decode(row.try_get("schema")?))
            .collect()
    }

    /// One class schema, or [`AdapterError::ClassNotFound`]
    pub async fn get<'e, E: PgExecutor<'e>>(
        &self,
        executor: E,
        class_name: &str,
    ) -> Result<ClassSchema> {
        let sql = format!(
            "SELECT \"schema\" FROM {} WHERE \"className\" = $1",
            self.quoted()
        );
        let row = sqlx::query(&sql)
            .bind(class_name)
            .fetch_optional(executor)
            .await?
            .ok_or_else(|| AdapterError::class_not_found(class_name))?;
        Self::decode(row.try_get("schema")?)
    }

    /// Insert a new class row
    ///
    /// Fails with [`AdapterError::DuplicateClass`] when the class is already
    /// registered. Returns the normalized schema.
    pub async fn create<'e, E: PgExecutor<'e>>(
        &self,
        executor: E,
        schema: &ClassSchema,
    ) -> Result<ClassSchema> {
        let stored = to_storage_schema(schema);
        let sql = format!(
            "INSERT INTO {} (\"className\", \"schema\", \"isParseClass\") VALUES ($1, $2, true)",
            self.quoted()
        );
        sqlx::query(&sql)
            .bind(&schema.class_name)
            .bind(serde_json::to_value(&stored)?)
            .execute(executor)
            .await
            .map_err(|err| match classify(&err) {
                Some(PgErrorKind::UniqueViolation) => {
                    AdapterError::DuplicateClass(schema.class_name.clone())
                }
                _ => AdapterError::Sql(err),
            })?;
        Ok(from_storage_schema(&stored))
    }

    /// Replace the stored schema of an existing class
    pub async fn update<'e, E: PgExecutor<'e>>(
        &self,
        executor: E,
        schema: &ClassSchema,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET \"schema\" = $2 WHERE \"className\" = $1",
            self.quoted()
        );
        sqlx::query(&sql)
            .bind(&schema.class_name)
            .bind(serde_json::to_value(to_storage_schema(schema))?)
            .execute(executor)
            .await?;
        Ok(())
    }

    async fn set_key<'e, E: PgExecutor<'e>>(
        &self,
        executor: E,
        class_name: &str,
        key: &str,
        value: Value,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET \"schema\" = json_object_set_key(\"schema\", $2::text, $3::jsonb) WHERE \"className\" = $1",
            self.quoted()
        );
        sqlx::query(&sql)
            .bind(class_name)
            .bind(key)
            .bind(value)
            .execute(executor)
            .await?;
        Ok(())
    }

    /// Overwrite the class-level permissions of a class
    pub async fn set_permissions<'e, E: PgExecutor<'e>>(
        &self,
        executor: E,
        class_name: &str,
        clp: &ClassLevelPermissions,
    ) -> Result<()> {
        self.set_key(
            executor,
            class_name,
            "classLevelPermissions",
            serde_json::to_value(clp)?,
        )
        .await
    }

    /// Overwrite the recorded indexes of a class
    pub async fn set_indexes<'e, E: PgExecutor<'e>>(
        &self,
        executor: E,
        class_name: &str,
        indexes: &IndexMap<String, IndexKey>,
    ) -> Result<()> {
        self.set_key(executor, class_name, "indexes", serde_json::to_value(indexes)?)
            .await
    }

    /// Whether `field_name` is already recorded for `class_name`
    pub async fn has_field<'e, E: PgExecutor<'e>>(
        &self,
        executor: E,
        class_name: &str,
        field_name: &str,
    ) -> Result<bool> {
        let sql = format!(
            "SELECT 1 FROM {} WHERE \"className\" = $1 AND (\"schema\"->'fields'->$2::text) IS NOT NULL",
            self.quoted()
        );
        let row = sqlx::query(&sql)
            .bind(class_name)
            .bind(field_name)
            .fetch_optional(executor)
            .await?;
        Ok(row.is_some())
    }

    /// Record one field in the stored schema
    pub async fn add_field<'e, E: PgExecutor<'e>>(
        &self,
        executor: E,
        class_name: &str,
        field_name: &str,
        descriptor: &FieldDescriptor,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET \"schema\" = jsonb_set(\"schema\", ARRAY['fields', $2::text], $3::jsonb) WHERE \"className\" = $1",
            self.quoted()
        );
        sqlx::query(&sql)
            .bind(class_name)
            .bind(field_name)
            .bind(serde_json::to_value(descriptor)?)
            .execute(executor)
            .await?;
        Ok(())
    }

    /// Remove a class row; returns whether a row existed
    pub async fn delete<'e, E: PgExecutor<'e>>(
        &self,
        executor: E,
        class_name: &str,
    ) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE \"className\" = $1", self.quoted());
        let result = sqlx::query(&sql).bind(class_name).execute(executor).await?;
        Ok(result.rows_affected() > 0)
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldType;
    use serde_json::json;

    #[test]
    fn test_decode_normalizes_stored_schema() {
        let stored = json!({
            "className": "Post",
            "fields": {
                "objectId": {"type": "String"},
                "_rperm": {"type": "Array", "contents": {"type": "String"}},
                "_wperm": {"type": "Array", "contents": {"type": "String"}},
                "title": {"type": "String"}
            }
        });
        let schema = SchemaCatalog::decode(stored).unwrap();
        assert_eq!(schema.class_name, "Post");
        assert!(!schema.fields.contains_key("_rperm"));
        assert!(!schema.fields.contains_key("_wperm"));
        assert_eq!(schema.field_type("title"), Some(&FieldType::String));
        assert_eq!(
            schema.class_level_permissions,
            Some(ClassLevelPermissions::permissive())
        );
    }

    #[test]
    fn test_decode_rejects_malformed_blob() {
        let err = SchemaCatalog::decode(json!({"fields": 3})).unwrap_err();
        assert!(matches!(err, AdapterError::Json(_)));
    }

    #[test]
    fn test_quoted_table_name() {
        assert_eq!(SchemaCatalog::new("_SCHEMA").quoted(), "\"_SCHEMA\"");
    }
}
