//! Row decoding
//!
//! Rows are fetched as `to_jsonb(row)`, so every column arrives as JSON:
//! timestamps as RFC 3339 strings, points as `"(x,y)"` and polygons as
//! `"((x,y),...)"`. [`postgres_object_to_document`] turns such a row back into
//! the typed document shape callers wrote.

use serde_json::{Map, Value, json};

use crate::error::{AdapterError, Result};
use crate::schema::ClassSchema;
use crate::sql::literal::{format_iso_date, parse_iso_date};
use crate::types::FieldType;

/// Internal date columns that are not declared in schemas
const INTERNAL_DATE_FIELDS: &[&str] = &[
    "expiresAt",
    "_email_verify_token_expires_at",
    "_account_lockout_expires_at",
    "_perishable_token_expires_at",
    "_password_changed_at",
];

/// Convert one fetched row into a document
///
/// Null columns are dropped. `createdAt`/`updatedAt` become plain ISO strings;
/// every other date becomes `{"__type": "Date", "iso": ..}`.
pub fn postgres_object_to_document(
    mut row: Map<String, Value>,
    schema: &ClassSchema,
) -> Result<Map<String, Value>> {
    for (name, descriptor) in &schema.fields {
        let target = descriptor.target_class.clone().unwrap_or_default();
        match descriptor.field_type {
            FieldType::Relation => {
                row.insert(
                    name.clone(),
                    json!({"__type": "Relation", "className": target}),
                );
            }
            FieldType::Pointer => {
                if let Some(Value::String(id)) = row.get(name) {
                    let pointer = json!({
                        "__type": "Pointer",
                        "className": target,
                        "objectId": id,
                    });
                    row.insert(name.clone(), pointer);
                }
            }
            FieldType::GeoPoint => {
                if let Some(Value::String(text)) = row.get(name) {
                    let point = parse_point(text)?;
                    row.insert(
                        name.clone(),
                        json!({"__type": "GeoPoint", "latitude": point.1, "longitude": point.0}),
                    );
                }
            }
            FieldType::Polygon => {
                if let Some(Value::String(text)) = row.get(name) {
                    let coordinates: Vec<Value> = parse_polygon(text)?
                        .into_iter()
                        .map(|(x, y)| json!([y, x]))
                        .collect();
                    row.insert(
                        name.clone(),
                        json!({"__type": "Polygon", "coordinates": coordinates}),
                    );
                }
            }
            FieldType::File => {
                if let Some(Value::String(file)) = row.get(name) {
                    let file = json!({"__type": "File", "name": file});
                    row.insert(name.clone(), file);
                }
            }
            FieldType::Date if name != "createdAt" && name != "updatedAt" => {
                if let Some(Value::String(iso)) = row.get(name) {
                    let date = date_object(iso)?;
                    row.insert(name.clone(), date);
                }
            }
            _ => {}
        }
    }

    for field in ["createdAt", "updatedAt"] {
        if let Some(Value::String(iso)) = row.get(field) {
            let iso = format_iso_date(&parse_iso_date(iso)?);
            row.insert(field.to_string(), Value::String(iso));
        }
    }

    for field in INTERNAL_DATE_FIELDS {
        if schema.fields.contains_key(*field) {
            continue;
        }
        if let Some(Value::String(iso)) = row.get(*field) {
            let date = date_object(iso)?;
            row.insert(field.to_string(), date);
        }
    }

    row.retain(|_, value| !value.is_null());
    Ok(row)
}

fn date_object(iso: &str) -> Result<Value> {
    Ok(json!({"__type": "Date", "iso": format_iso_date(&parse_iso_date(iso)?)}))
}

fn parse_coordinate(text: &str, raw: &str) -> Result<f64> {
    text.trim()
        .parse()
        .map_err(|_| AdapterError::invalid_json(format!("bad geometry value: {}", raw)))
}

/// Parse a Postgres point `"(x,y)"`
fn parse_point(text: &str) -> Result<(f64, f64)> {
    let inner = text
        .trim()
        .strip_prefix('(')
        .and_then(|t| t.strip_suffix(')'))
        .ok_or_else(|| AdapterError::invalid_json(format!("bad geometry value: {}", text)))?;
    let (x, y) = inner
        .split_once(',')
        .ok_or_else(|| AdapterError::invalid_json(format!("bad geometry value: {}", text)))?;
    Ok((parse_coordinate(x, text)?, parse_coordinate(y, text)?))
}

/// Parse a Postgres polygon `"((x1,y1),(x2,y2),...)"`
fn parse_polygon(text: &str) -> Result<Vec<(f64, f64)>> {
    let inner = text
        .trim()
        .strip_prefix('(')
        .and_then(|t| t.strip_suffix(')'))
        .ok_or_else(|| AdapterError::invalid_json(format!("bad geometry value: {}", text)))?;
    inner
        .split("),")
        .map(|point| {
            let point = point.trim();
            let point = if point.ends_with(')') {
                point.to_string()
            } else {
                format!("{})", point)
            };
            parse_point(&point)
        })
        .collect()
}
