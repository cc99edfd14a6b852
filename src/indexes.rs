//! Index bookkeeping
//!
//! The catalog records indexes as `name -> {field: direction}`. Submitted index
//! maps are diffed against the recorded ones to decide what to create and drop.

use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::error::{AdapterError, Result};
use crate::schema::IndexKey;
use crate::types::FieldDescriptor;

/// Name of the primary key index every class has
pub const DEFAULT_INDEX: &str = "_id_";

/// Index as reported by `pg_indexes`
#[derive(Debug, Clone, PartialEq)]
pub struct IndexInfo {
    pub name: String,
    pub definition: String,
}

/// Outcome of diffing submitted indexes against recorded ones
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IndexChanges {
    /// Index name and its columns, in key order
    pub created: Vec<(String, Vec<String>)>,
    pub dropped: Vec<String>,
    /// Recorded indexes after the change
    pub indexes: IndexMap<String, IndexKey>,
}

fn default_indexes() -> IndexMap<String, IndexKey> {
    let mut key = Map::new();
    key.insert("_id".to_string(), Value::from(1));
    let mut indexes = IndexMap::new();
    indexes.insert(DEFAULT_INDEX.to_string(), key);
    indexes
}

fn is_delete(value: &Value) -> bool {
    value.get("__op").and_then(Value::as_str) == Some("Delete")
}

/// Diff `submitted` (`name -> key` or `name -> {"__op": "Delete"}`) against `existing`
///
/// Updating an existing index, deleting a missing one, or indexing a field
/// that is not in `fields` fails with [`AdapterError::InvalidIndex`].
pub fn diff_indexes(
    submitted: &Map<String, Value>,
    existing: &IndexMap<String, IndexKey>,
    fields: &IndexMap<String, FieldDescriptor>,
) -> Result<IndexChanges> {
    let mut indexes = if existing.is_empty() {
        default_indexes()
    } else {
        existing.clone()
    };
    let mut changes = IndexChanges::default();

    for (name, field) in submitted {
        let exists = indexes.contains_key(name);
        let delete = is_delete(field);
        if exists && !delete {
            return Err(AdapterError::invalid_index(format!(
                "Index {} exists, cannot update.",
                name
            )));
        }
        if !exists && delete {
            return Err(AdapterError::invalid_index(format!(
                "Index {} does not exist, cannot delete.",
                name
            )));
        }

        if delete {
            changes.dropped.push(name.clone());
            indexes.shift_remove(name);
            continue;
        }

        let key = field.as_object().ok_or_else(|| {
            AdapterError::invalid_index(format!("Index {} must map fields to directions", name))
        })?;
        for column in key.keys() {
            if !fields.contains_key(column) {
                return Err(AdapterError::invalid_index(format!(
                    "Field {} does not exist, cannot add index.",
                    column
                )));
            }
        }
        changes
            .created
            .push((name.clone(), key.keys().cloned().collect()));
        indexes.insert(name.clone(), key.clone());
    }

    changes.indexes = indexes;
    Ok(changes)
}

/// Recover an index key from a `pg_indexes.indexdef`
///
/// Only plain column indexes are understood; expression indexes such as
/// `lower(col)` return `None`.
pub fn index_key_from_definition(definition: &str) -> Option<IndexKey> {
    let open = definition.rfind('(')?;
    let close = definition[open..].find(')')? + open;
    let columns = &definition[open + 1..close];
    if definition[..open].trim_end().ends_with("lower") {
        return None;
    }

    let mut key = Map::new();
    for column in columns.split(',') {
        let mut parts = column.split_whitespace();
        let name = parts.next()?.trim_matches('"');
        if name.is_empty() {
            return None;
        }
        let direction = match parts.next() {
            Some(order) if order.eq_ignore_ascii_case("DESC") => -1,
            _ => 1,
        };
        key.insert(name.to_string(), Value::from(direction));
    }
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldType;
    use serde_json::json;

    fn fields() -> IndexMap<String, FieldDescriptor> {
        let mut fields = IndexMap::new();
        fields.insert("title".to_string(), FieldDescriptor::new(FieldType::String));
        fields.insert("score".to_string(), FieldDescriptor::new(FieldType::Number));
        fields
    }

    fn submitted(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    // =========================================================================
    // Diff Tests
    // =========================================================================

    #[test]
    fn test_create_on_empty_adds_default() {
        let changes = diff_indexes(
            &submitted(json!({"by_title": {"title": 1, "score": -1}})),
            &IndexMap::new(),
            &fields(),
        )
        .unwrap();
        assert_eq!(
            changes.created,
            vec![(
                "by_title".to_string(),
                vec!["title".to_string(), "score".to_string()]
            )]
        );
        assert!(changes.dropped.is_empty());
        assert!(changes.indexes.contains_key(DEFAULT_INDEX));
        assert!(changes.indexes.contains_key("by_title"));
    }

    #[test]
    fn test_delete_existing() {
        let mut existing = default_indexes();
        existing.insert("by_title".to_string(), submitted(json!({"title": 1})));
        let changes = diff_indexes(
            &submitted(json!({"by_title": {"__op": "Delete"}})),
            &existing,
            &fields(),
        )
        .unwrap();
        assert_eq!(changes.dropped, vec!["by_title".to_string()]);
        assert!(!changes.indexes.contains_key("by_title"));
    }

    #[test]
    fn test_rejected_changes() {
        let mut existing = default_indexes();
        existing.insert("by_title".to_string(), submitted(json!({"title": 1})));

        let update = diff_indexes(&submitted(json!({"by_title": {"score": 1}})), &existing, &fields());
        assert!(matches!(update, Err(AdapterError::InvalidIndex(_))));

        let delete = diff_indexes(&submitted(json!({"nope": {"__op": "Delete"}})), &existing, &fields());
        assert!(matches!(delete, Err(AdapterError::InvalidIndex(_))));

        let missing = diff_indexes(&submitted(json!({"by_x": {"x": 1}})), &existing, &fields());
        assert!(matches!(missing, Err(AdapterError::InvalidIndex(_))));
    }

    // =========================================================================
    // Definition Parsing Tests
    // =========================================================================

    #[test]
    fn test_index_key_from_definition() {
        assert_eq!(
            index_key_from_definition(
                "CREATE INDEX by_title ON public.\"Post\" USING btree (title, \"createdAt\" DESC)"
            ),
            Some(submitted(json!({"title": 1, "createdAt": -1})))
        );
        assert_eq!(
            index_key_from_definition(
                "CREATE UNIQUE INDEX \"Post_pkey\" ON public.\"Post\" USING btree (\"objectId\")"
            ),
            Some(submitted(json!({"objectId": 1})))
        );
    }

    #[test]
    fn test_expression_index_is_skipped() {
        assert_eq!(
            index_key_from_definition(
                "CREATE INDEX e ON public.\"_User\" USING btree (lower(email) varchar_pattern_ops)"
            ),
            None
        );
    }
}
