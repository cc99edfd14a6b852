//! INSERT and UPDATE compilation
//!
//! Values go through the same typed-literal conversion as the WHERE compiler,
//! so a document written here reads back the way it is queried.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::error::{AdapterError, Result};
use crate::schema::{ClassSchema, USER_CLASS, to_storage_schema, user_secret_field};
use crate::sql::builder::{SqlBuilder, SqlParam, SqlStatement};
use crate::sql::literal::{
    GeoPoint, convert_polygon_to_sql, date_param, object_id, to_param, type_tag,
};
use crate::sql::sanitize::quote_identifier;
use crate::types::{FieldDescriptor, FieldType};

const AUTH_DATA: &str = "authData";
const AUTH_DATA_PREFIX: &str = "_auth_data_";

/// Expand dotted keys into nested objects
///
/// `{"a.b.c": 1}` becomes `{"a": {"b": {"c": 1}}}`. A `Delete` operation at a
/// leaf removes that key instead of assigning it.
pub fn handle_dot_fields(object: &Map<String, Value>) -> Map<String, Value> {
    let mut result = Map::new();
    for (key, value) in object {
        let mut components = key.split('.');
        let first = components.next().unwrap_or_default();
        let rest: Vec<&str> = components.collect();
        if rest.is_empty() {
            result.insert(key.clone(), value.clone());
            continue;
        }
        let leaf = if is_op(value, "Delete") {
            None
        } else {
            Some(value.clone())
        };
        let target = result
            .entry(first.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        assign_path(target, &rest, leaf);
    }
    result
}

fn assign_path(target: &mut Value, path: &[&str], value: Option<Value>) {
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(map) = target else {
        return;
    };
    match path {
        [] => {}
        [last] => match value {
            Some(v) => {
                map.insert(last.to_string(), v);
            }
            None => {
                map.remove(*last);
            }
        },
        [head, rest @ ..] => {
            let child = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            assign_path(child, rest, value);
        }
    }
}

/// Reject nested keys containing `$` or `.`
pub fn validate_keys(value: &Value) -> Result<()> {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                validate_keys(nested)?;
                if key.contains('$') || key.contains('.') {
                    return Err(AdapterError::InvalidNestedKey);
                }
            }
            Ok(())
        }
        Value::Array(items) => items.iter().try_for_each(validate_keys),
        _ => Ok(()),
    }
}

fn is_op(value: &Value, op: &str) -> bool {
    value.get("__op").and_then(Value::as_str) == Some(op)
}

/// Provider name of an `_auth_data_<provider>` key
fn auth_data_provider(key: &str) -> Option<&str> {
    key.strip_prefix(AUTH_DATA_PREFIX)
        .filter(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
}

/// Fold `_auth_data_<provider>` keys into the `authData` object
fn fold_auth_data(object: &Map<String, Value>) -> Map<String, Value> {
    let mut result = Map::new();
    let mut providers = Map::new();
    for (key, value) in object {
        match auth_data_provider(key) {
            Some(provider) => {
                providers.insert(provider.to_string(), value.clone());
            }
            None => {
                result.insert(key.clone(), value.clone());
            }
        }
    }
    if !providers.is_empty() {
        let entry = result
            .entry(AUTH_DATA.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(auth) = entry {
            auth.extend(providers);
        }
    }
    result
}

fn polygon_param(value: &Value) -> Result<SqlParam> {
    let coordinates = value
        .get("coordinates")
        .and_then(Value::as_array)
        .ok_or_else(|| AdapterError::invalid_json(format!("bad Polygon value: {}", value)))?;
    Ok(SqlParam::Text(convert_polygon_to_sql(coordinates)?))
}

fn string_values(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

// ============================================================================
// INSERT
// ============================================================================

/// Compile an INSERT for one document
pub fn compile_insert(schema: &ClassSchema, object: &Map<String, Value>) -> Result<SqlStatement> {
    let schema = to_storage_schema(schema);
    let object = handle_dot_fields(object);
    validate_keys(&Value::Object(object.clone()))?;
    let object = fold_auth_data(&object);

    let mut builder = SqlBuilder::starting_at(1);
    let mut columns = Vec::new();
    let mut values = Vec::new();

    for (field, value) in &object {
        if value.is_null() {
            continue;
        }

        let descriptor = match schema.fields.get(field) {
            Some(descriptor) => descriptor.clone(),
            None if field == AUTH_DATA => FieldDescriptor::new(FieldType::Object),
            None if schema.class_name == USER_CLASS => match user_secret_field(field) {
                Some(descriptor) => descriptor,
                None => return Err(unknown_field(field)),
            },
            None => return Err(unknown_field(field)),
        };

        let expression = match &descriptor.field_type {
            FieldType::Date => builder.push(date_param(value)?),
            FieldType::Pointer => builder.push(object_id(value)?),
            FieldType::Array if descriptor.is_string_array() => format!(
                "{}::text[]",
                builder.push(SqlParam::TextArray(string_values(value)))
            ),
            FieldType::Array => format!("{}::jsonb", builder.push(SqlParam::Json(value.clone()))),
            FieldType::Object | FieldType::Bytes => {
                format!("{}::jsonb", builder.push(SqlParam::Json(value.clone())))
            }
            FieldType::String | FieldType::Number | FieldType::Boolean | FieldType::File => {
                builder.push(to_param(value)?)
            }
            FieldType::Polygon => format!("{}::polygon", builder.push(polygon_param(value)?)),
            FieldType::GeoPoint => {
                let point = GeoPoint::from_json(value)?;
                let lng = builder.push(point.longitude);
                let lat = builder.push(point.latitude);
                format!("POINT({}, {})", lng, lat)
            }
            other => {
                return Err(AdapterError::UnsupportedType(format!(
                    "Type {} not supported yet",
                    other.as_str()
                )));
            }
        };
        columns.push(quote_identifier(field));
        values.push(expression);
    }

    let table = quote_identifier(&schema.class_name);
    let sql = if columns.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES", table)
    } else {
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            values.join(", ")
        )
    };
    Ok(SqlStatement::new(sql, builder.into_params()))
}

fn unknown_field(field: &str) -> AdapterError {
    AdapterError::UnsupportedType(format!("Field {} is not declared in the schema", field))
}

// ============================================================================
// UPDATE
// ============================================================================

/// `SET` assignments of an UPDATE with their parameters
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateClause {
    pub assignments: Vec<String>,
    pub params: Vec<SqlParam>,
}

impl UpdateClause {
    /// Index of the first placeholder following this clause
    pub fn next_index(&self) -> usize {
        self.params.len() + 1
    }
}

/// Compile the `SET` list of an UPDATE, numbering placeholders from `$1`
pub fn compile_update(schema: &ClassSchema, update: &Map<String, Value>) -> Result<UpdateClause> {
    let schema = to_storage_schema(schema);

    // Whether each top-level field was addressed through a dotted path
    let mut dot_notation: HashMap<&str, bool> = HashMap::new();
    for key in update.keys() {
        match key.split_once('.') {
            Some((first, _)) => {
                dot_notation.insert(first, true);
            }
            None => {
                dot_notation.entry(key.as_str()).or_insert(false);
            }
        }
    }

    let folded = handle_dot_fields(&fold_auth_data(update));
    let mut builder = SqlBuilder::starting_at(1);
    let mut assignments = Vec::with_capacity(folded.len());

    for (field, value) in &folded {
        let column = quote_identifier(field);
        let descriptor = schema.fields.get(field);
        let field_type = descriptor.map(|d| &d.field_type);

        let assignment = if value.is_null() {
            format!("{} = NULL", column)
        } else if field == AUTH_DATA {
            format!("{} = {}", column, auth_data_update(&column, value, &mut builder))
        } else if let Some(op) = value.get("__op").and_then(Value::as_str) {
            operation_update(&column, descriptor, op, value, &mut builder)?
        } else if field == "updatedAt" || field_type == Some(&FieldType::Date) {
            format!("{} = {}", column, builder.push(date_param(value)?))
        } else {
            match value {
                Value::String(_) | Value::Bool(_) | Value::Number(_) => {
                    format!("{} = {}", column, builder.push(to_param(value)?))
                }
                Value::Object(_) => match type_tag(value) {
                    Some("Pointer") => {
                        format!("{} = {}", column, builder.push(object_id(value)?))
                    }
                    Some("Date" | "File") => {
                        format!("{} = {}", column, builder.push(to_param(value)?))
                    }
                    Some("GeoPoint") => {
                        let point = GeoPoint::from_json(value)?;
                        let lng = builder.push(point.longitude);
                        let lat = builder.push(point.latitude);
                        format!("{} = POINT({}, {})", column, lng, lat)
                    }
                    Some("Polygon") => format!(
                        "{} = {}::polygon",
                        column,
                        builder.push(polygon_param(value)?)
                    ),
                    Some("Relation") => continue,
                    _ if field_type == Some(&FieldType::Object) => object_merge_update(
                        field,
                        &column,
                        value,
                        update,
                        dot_notation.get(field.as_str()).copied().unwrap_or(false),
                        &mut builder,
                    ),
                    Some("Bytes") if field_type == Some(&FieldType::Bytes) => format!(
                        "{} = {}::jsonb",
                        column,
                        builder.push(SqlParam::Json(value.clone()))
                    ),
                    _ => return Err(unsupported_update(value)),
                },
                Value::Array(_) if descriptor.is_some_and(FieldDescriptor::is_string_array) => {
                    format!(
                        "{} = {}::text[]",
                        column,
                        builder.push(SqlParam::TextArray(string_values(value)))
                    )
                }
                Value::Array(_) if field_type == Some(&FieldType::Array) => format!(
                    "{} = {}::jsonb",
                    column,
                    builder.push(SqlParam::Json(value.clone()))
                ),
                _ => return Err(unsupported_update(value)),
            }
        };
        assignments.push(assignment);
    }

    Ok(UpdateClause {
        assignments,
        params: builder.into_params(),
    })
}

fn unsupported_update(value: &Value) -> AdapterError {
    AdapterError::unsupported_update(format!("Postgres doesn't support update {} yet", value))
}

/// Nested `json_object_set_key` calls setting each provider in turn
fn auth_data_update(column: &str, value: &Value, builder: &mut SqlBuilder) -> String {
    let mut expr = column.to_string();
    if let Value::Object(providers) = value {
        for (provider, data) in providers {
            let key = builder.push(provider.as_str());
            let data = if is_op(data, "Delete") {
                Value::Null
            } else {
                data.clone()
            };
            let data = builder.push(SqlParam::Json(data));
            expr = format!(
                "json_object_set_key(COALESCE({}, '{{}}'::jsonb), {}::text, {}::jsonb)",
                expr, key, data
            );
        }
    }
    expr
}

fn operation_update(
    column: &str,
    descriptor: Option<&FieldDescriptor>,
    op: &str,
    value: &Value,
    builder: &mut SqlBuilder,
) -> Result<String> {
    let string_array = descriptor.is_some_and(FieldDescriptor::is_string_array);
    let objects = || {
        value
            .get("objects")
            .filter(|o| o.is_array())
            .cloned()
            .ok_or_else(|| unsupported_update(value))
    };

    Ok(match op {
        "Increment" => {
            let amount = value
                .get("amount")
                .and_then(Value::as_f64)
                .ok_or_else(|| unsupported_update(value))?;
            format!(
                "{col} = COALESCE({col}, 0) + {amount}",
                col = column,
                amount = builder.push(amount)
            )
        }
        "Delete" => format!("{} = NULL", column),
        "Add" if string_array => format!(
            "{col} = array_cat(COALESCE({col}, '{{}}'::text[]), {p}::text[])",
            col = column,
            p = builder.push(SqlParam::TextArray(string_values(&objects()?)))
        ),
        "AddUnique" if string_array => format!(
            "{col} = array_cat(COALESCE({col}, '{{}}'::text[]), ARRAY(SELECT DISTINCT e FROM unnest({p}::text[]) AS e WHERE NOT e = ANY(COALESCE({col}, '{{}}'::text[]))))",
            col = column,
            p = builder.push(SqlParam::TextArray(string_values(&objects()?)))
        ),
        "Remove" if string_array => format!(
            "{col} = ARRAY(SELECT e FROM unnest(COALESCE({col}, '{{}}'::text[])) AS e WHERE NOT e = ANY({p}::text[]))",
            col = column,
            p = builder.push(SqlParam::TextArray(string_values(&objects()?)))
        ),
        "Add" | "AddUnique" | "Remove" => {
            let function = match op {
                "Add" => "array_add",
                "AddUnique" => "array_add_unique",
                _ => "array_remove",
            };
            format!(
                "{col} = {function}(COALESCE({col}, '[]'::jsonb), {p}::jsonb)",
                col = column,
                function = function,
                p = builder.push(SqlParam::Json(objects()?))
            )
        }
        _ => return Err(unsupported_update(value)),
    })
}

/// Merge into a jsonb Object column, applying sibling dotted deletes and increments
fn object_merge_update(
    field: &str,
    column: &str,
    value: &Value,
    original: &Map<String, Value>,
    merge: bool,
    builder: &mut SqlBuilder,
) -> String {
    let mut deletes = Vec::new();
    let mut increments = Vec::new();
    for (key, op) in original {
        let Some((first, sub_key)) = key.split_once('.') else {
            continue;
        };
        if first != field || sub_key.contains('.') {
            continue;
        }
        if is_op(op, "Delete") {
            deletes.push(sub_key.to_string());
        } else if is_op(op, "Increment") {
            let amount = op.get("amount").and_then(Value::as_f64).unwrap_or(0.0);
            increments.push((sub_key.to_string(), amount));
        }
    }

    let mut merged = value.as_object().cloned().unwrap_or_default();
    for (key, _) in &increments {
        merged.remove(key);
    }

    let mut expr = if merge {
        format!("COALESCE({}, '{{}}'::jsonb)", column)
    } else {
        "'{}'::jsonb".to_string()
    };
    for key in deletes {
        expr.push_str(&format!(" - {}::text", builder.push(key)));
    }
    for (key, amount) in increments {
        let key = builder.push(key);
        let amount = builder.push(amount);
        expr.push_str(&format!(
            " || jsonb_build_object({key}::text, COALESCE(({col}->>{key}::text)::double precision, 0) + {amount})",
            key = key,
            col = column,
            amount = amount
        ));
    }
    expr.push_str(&format!(
        " || {}::jsonb",
        builder.push(SqlParam::Json(Value::Object(merged)))
    ));
    format!("{} = ({})", column, expr)
}
