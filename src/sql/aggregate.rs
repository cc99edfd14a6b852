//! Aggregation pipeline compilation
//!
//! Stages (`$match`, `$group`, `$project`, `$sort`, `$skip`, `$limit`) are
//! folded in order into a single SELECT. `$match` with `$or` is flattened into
//! one map whose predicates are OR-joined; nested `$or` keys collide and the
//! last one wins.

use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::error::{AdapterError, Result};
use crate::query::SortDirection;
use crate::schema::ClassSchema;
use crate::sql::builder::{SqlBuilder, SqlParam, SqlStatement};
use crate::sql::literal::{date_param, to_param};
use crate::sql::sanitize::quote_identifier;
use crate::types::FieldType;

/// A compiled pipeline plus what is needed to shape its rows
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateQuery {
    pub statement: SqlStatement,
    /// Alias of a `$sum` count column, coerced to an integer
    pub count_field: Option<String>,
    /// Aliases of a composite `_id`, re-nested into `objectId`
    pub group_keys: Option<Vec<String>>,
}

/// Date-part operators usable inside a composite `$group._id`
fn date_part(operator: &str) -> Option<&'static str> {
    Some(match operator {
        "$dayOfMonth" => "DAY",
        "$dayOfWeek" => "DOW",
        "$dayOfYear" => "DOY",
        "$isoDayOfWeek" => "ISODOW",
        "$isoWeekYear" => "ISOYEAR",
        "$hour" => "HOUR",
        "$minute" => "MINUTE",
        "$second" => "SECOND",
        "$millisecond" => "MILLISECONDS",
        "$month" => "MONTH",
        "$week" => "WEEK",
        "$year" => "YEAR",
        _ => return None,
    })
}

/// `$field` reference to a column name
fn field_reference(value: &str) -> &str {
    value.strip_prefix('$').unwrap_or(value)
}

/// Compile an aggregation pipeline for `schema`'s table
pub fn compile_pipeline(schema: &ClassSchema, pipeline: &[Value]) -> Result<AggregateQuery> {
    let mut builder = SqlBuilder::starting_at(1);
    let mut columns: Vec<String> = Vec::new();
    let mut count_field = None;
    let mut group_keys = None;

    let mut where_pattern = String::new();
    let mut group_pattern = String::new();
    let mut sort_pattern = String::new();
    let mut limit_pattern = String::new();
    let mut skip_pattern = String::new();

    for stage in pipeline {
        let stage = stage.as_object().ok_or_else(|| {
            AdapterError::invalid_query(format!("aggregation stage must be an object: {}", stage))
        })?;

        if let Some(group) = stage.get("$group") {
            let group = group
                .as_object()
                .ok_or_else(|| AdapterError::invalid_query("$group must be an object"))?;
            compile_group(
                group,
                &mut columns,
                &mut group_pattern,
                &mut count_field,
                &mut group_keys,
            )?;
        }

        if let Some(project) = stage.get("$project").and_then(Value::as_object) {
            for (field, value) in project {
                if value.as_i64() == Some(1) || value.as_bool() == Some(true) {
                    columns.push(quote_identifier(field));
                }
            }
        }

        if let Some(matcher) = stage.get("$match").and_then(Value::as_object) {
            where_pattern = compile_match(schema, matcher, &mut builder)?;
        }

        if let Some(limit) = stage.get("$limit").and_then(Value::as_i64) {
            limit_pattern = format!("LIMIT {}", builder.push(SqlParam::Int(limit)));
        }

        if let Some(skip) = stage.get("$skip").and_then(Value::as_i64) {
            skip_pattern = format!("OFFSET {}", builder.push(SqlParam::Int(skip)));
        }

        if let Some(sort) = stage.get("$sort").and_then(Value::as_object) {
            let keys: Vec<String> = sort
                .iter()
                .map(|(key, direction)| {
                    let column = if key == "_id" { "objectId" } else { key.as_str() };
                    format!(
                        "{} {}",
                        quote_identifier(column),
                        SortDirection::from_json(direction).as_sql()
                    )
                })
                .collect();
            sort_pattern = if keys.is_empty() {
                String::new()
            } else {
                format!("ORDER BY {}", keys.join(", "))
            };
        }
    }

    if columns.is_empty() {
        columns.push("*".to_string());
    }

    let clauses: Vec<&str> = [
        where_pattern.as_str(),
        group_pattern.as_str(),
        sort_pattern.as_str(),
        limit_pattern.as_str(),
        skip_pattern.as_str(),
    ]
    .into_iter()
    .filter(|c| !c.is_empty())
    .collect();

    let mut sql = format!(
        "SELECT {} FROM {}",
        columns.join(", "),
        quote_identifier(&schema.class_name)
    );
    for clause in clauses {
        sql.push(' ');
        sql.push_str(clause);
    }

    Ok(AggregateQuery {
        statement: SqlStatement::new(sql, builder.into_params()),
        count_field,
        group_keys,
    })
}

fn compile_group(
    group: &Map<String, Value>,
    columns: &mut Vec<String>,
    group_pattern: &mut String,
    count_field: &mut Option<String>,
    group_keys: &mut Option<Vec<String>>,
) -> Result<()> {
    for (field, value) in group {
        if value.is_null() {
            continue;
        }

        if field == "_id" {
            match value {
                Value::String(source) if !source.is_empty() => {
                    let column = quote_identifier(field_reference(source));
                    columns.push(format!("{} AS \"objectId\"", column));
                    *group_pattern = format!("GROUP BY {}", column);
                }
                Value::Object(keys) if !keys.is_empty() => {
                    let mut group_by: Vec<String> = Vec::new();
                    for (alias, source) in keys {
                        let expression = match source {
                            Value::String(source) if !source.is_empty() => {
                                quote_identifier(field_reference(source))
                            }
                            Value::Object(operation) => {
                                let Some((operator, source)) = operation.iter().next() else {
                                    continue;
                                };
                                let (Some(part), Some(source)) =
                                    (date_part(operator), source.as_str())
                                else {
                                    return Err(AdapterError::invalid_query(format!(
                                        "unsupported $group._id operator {}",
                                        operator
                                    )));
                                };
                                format!(
                                    "EXTRACT({} FROM {} AT TIME ZONE 'UTC')::integer",
                                    part,
                                    quote_identifier(field_reference(source))
                                )
                            }
                            _ => continue,
                        };
                        if !group_by.contains(&expression) {
                            group_by.push(expression.clone());
                        }
                        columns.push(format!("{} AS {}", expression, quote_identifier(alias)));
                    }
                    *group_keys = Some(keys.keys().cloned().collect());
                    *group_pattern = format!("GROUP BY {}", group_by.join(", "));
                }
                _ => {}
            }
            continue;
        }

        let Value::Object(accumulators) = value else {
            continue;
        };
        let alias = quote_identifier(field);
        for (operator, argument) in accumulators {
            let function = match operator.as_str() {
                "$sum" => match argument {
                    Value::String(source) => {
                        columns.push(format!(
                            "SUM({}) AS {}",
                            quote_identifier(field_reference(source)),
                            alias
                        ));
                        continue;
                    }
                    _ => {
                        *count_field = Some(field.clone());
                        columns.push(format!("COUNT(*) AS {}", alias));
                        continue;
                    }
                },
                "$max" => "MAX",
                "$min" => "MIN",
                "$avg" => "AVG",
                other => {
                    return Err(AdapterError::invalid_query(format!(
                        "unsupported accumulator {}",
                        other
                    )));
                }
            };
            let source = argument.as_str().ok_or_else(|| {
                AdapterError::invalid_query(format!("{} expects a field reference", operator))
            })?;
            columns.push(format!(
                "{}({}) AS {}",
                function,
                quote_identifier(field_reference(source)),
                alias
            ));
        }
    }
    Ok(())
}

fn compile_match(
    schema: &ClassSchema,
    matcher: &Map<String, Value>,
    builder: &mut SqlBuilder,
) -> Result<String> {
    let (matcher, joiner) = match matcher.get("$or").and_then(Value::as_array) {
        Some(branches) => {
            let mut collapsed: IndexMap<String, Value> = IndexMap::new();
            for branch in branches.iter().filter_map(Value::as_object) {
                for (key, value) in branch {
                    collapsed.insert(key.clone(), value.clone());
                }
            }
            (collapsed, " OR ")
        }
        None => (
            matcher.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            " AND ",
        ),
    };

    let mut patterns = Vec::new();
    for (field, value) in &matcher {
        let field = if field == "_id" { "objectId" } else { field.as_str() };
        let column = quote_identifier(field);
        let is_date = schema.field_type(field) == Some(&FieldType::Date);
        let param = |value: &Value| {
            if is_date {
                date_param(value)
            } else {
                to_param(value)
            }
        };

        let mut comparisons = Vec::new();
        if let Value::Object(operators) = value {
            for (operator, operand) in operators {
                let comparator = match operator.as_str() {
                    "$gt" => ">",
                    "$gte" => ">=",
                    "$lt" => "<",
                    "$lte" => "<=",
                    _ => continue,
                };
                if operand.is_null() {
                    continue;
                }
                comparisons.push(format!(
                    "{} {} {}",
                    column,
                    comparator,
                    builder.push(param(operand)?)
                ));
            }
        }

        if !comparisons.is_empty() {
            patterns.push(format!("({})", comparisons.join(" AND ")));
        } else if schema.fields.contains_key(field) {
            if value.as_object().is_some_and(|o| o.keys().any(|k| k.starts_with('$'))) {
                return Err(AdapterError::unsupported_query(format!(
                    "unsupported $match constraint {} on field {}",
                    value, field
                )));
            }
            patterns.push(format!("{} = {}", column, builder.push(param(value)?)));
        }
    }

    Ok(if patterns.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", patterns.join(joiner))
    })
}

/// Shape decoded aggregate rows
///
/// Every row gets an `objectId` (null when not grouped), composite group keys
/// are nested back under `objectId`, and the count column becomes an integer.
pub fn finish_aggregate_rows(
    rows: Vec<Map<String, Value>>,
    query: &AggregateQuery,
) -> Vec<Map<String, Value>> {
    rows.into_iter()
        .map(|mut row| {
            if !row.contains_key("objectId") {
                row.insert("objectId".to_string(), Value::Null);
            }
            if let Some(keys) = &query.group_keys {
                let mut id = Map::new();
                for key in keys {
                    id.insert(key.clone(), row.remove(key).unwrap_or(Value::Null));
                }
                row.insert("objectId".to_string(), Value::Object(id));
            }
            if let Some(field) = &query.count_field {
                if let Some(count) = row.get(field).and_then(to_integer) {
                    row.insert(field.clone(), Value::from(count));
                }
            }
            row
        })
        .collect()
}

fn to_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
