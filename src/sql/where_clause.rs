//! WHERE clause compilation
//!
//! Turns a decoded [`Query`] into a parameterized SQL predicate. Identifiers and
//! regex patterns are inlined (quoted); every other value is bound, so the
//! number of parameters always equals the number of distinct placeholders.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{AdapterError, Result};
use crate::query::{Comparator, Condition, Constraint, FieldFilter, Query, SortDirection};
use crate::schema::{ClassSchema, to_storage_schema};
use crate::sql::builder::{SqlBuilder, SqlParam};
use crate::sql::literal::{
    GeoPoint, cast_type_for, convert_polygon_to_sql, date_param, object_id, radians_to_meters,
    relative_time_to_date, to_param, type_tag,
};
use crate::sql::regex::{is_starts_with_regex, process_regex_pattern, remove_white_space};
use crate::sql::sanitize::{quote_identifier, transform_dot_field, transform_dot_field_to_json};
use crate::types::FieldType;

/// Compared against Number columns for boolean literals so they never match
const MAX_INT_PLUS_ONE: f64 = 9_223_372_036_854_775_808.0;

/// A compiled predicate with its parameters
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WhereClause {
    /// Predicate without the `WHERE` keyword; empty when nothing is filtered
    pub pattern: String,
    pub params: Vec<SqlParam>,
    /// Ordering fragments requested by `$nearSphere`, referencing `params`
    pub sorts: Vec<String>,
}

impl WhereClause {
    /// `WHERE <pattern>`, or an empty string
    pub fn to_sql(&self) -> String {
        if self.pattern.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", self.pattern)
        }
    }
}

/// Compile `query` against `schema`, numbering placeholders from `start_index`
///
/// The `_rperm`/`_wperm` ACL columns are always known as text arrays.
pub fn build_where_clause(
    schema: &ClassSchema,
    query: &Query,
    start_index: usize,
    case_insensitive: bool,
) -> Result<WhereClause> {
    let storage = to_storage_schema(schema);
    let compiler = WhereCompiler {
        schema: &storage,
        case_insensitive,
        now: Utc::now(),
    };
    let mut builder = SqlBuilder::starting_at(start_index);
    let mut sorts = Vec::new();
    let pattern = compiler.compile(query, &mut builder, &mut sorts)?;
    Ok(WhereClause {
        pattern,
        params: builder.into_params(),
        sorts,
    })
}

/// `ORDER BY` clause for explicit sort keys plus any geo ordering
pub fn build_order_by_clause(sort: &[(String, SortDirection)], geo_sorts: &[String]) -> String {
    let mut parts: Vec<String> = geo_sorts.to_vec();
    parts.extend(
        sort.iter()
            .map(|(key, direction)| format!("{} {}", sort_key(key), direction.as_sql())),
    );
    if parts.is_empty() {
        String::new()
    } else {
        format!("ORDER BY {}", parts.join(", "))
    }
}

fn sort_key(key: &str) -> String {
    transform_dot_field_to_json(key)
}

struct WhereCompiler<'a> {
    schema: &'a ClassSchema,
    case_insensitive: bool,
    now: DateTime<Utc>,
}

impl WhereCompiler<'_> {
    fn compile(
        &self,
        query: &Query,
        builder: &mut SqlBuilder,
        sorts: &mut Vec<String>,
    ) -> Result<String> {
        let mut patterns = Vec::new();
        for filter in &query.filters {
            match filter {
                FieldFilter::And(children) => {
                    patterns.push(self.logical(children, " AND ", false, builder, sorts)?);
                }
                FieldFilter::Or(children) => {
                    patterns.push(self.logical(children, " OR ", false, builder, sorts)?);
                }
                FieldFilter::Nor(children) => {
                    patterns.push(self.logical(children, " OR ", true, builder, sorts)?);
                }
                FieldFilter::Field { name, condition } => {
                    self.field(name, condition, builder, &mut patterns, sorts)?;
                }
            }
        }
        Ok(patterns.join(" AND "))
    }

    fn logical(
        &self,
        children: &[Query],
        joiner: &str,
        negate: bool,
        builder: &mut SqlBuilder,
        sorts: &mut Vec<String>,
    ) -> Result<String> {
        if children.is_empty() {
            return Err(AdapterError::invalid_query(
                "$and/$or/$nor must be a nonempty array",
            ));
        }
        let mut clauses = Vec::with_capacity(children.len());
        for child in children {
            let mut sub = builder.child();
            let pattern = self.compile(child, &mut sub, sorts)?;
            builder.absorb(sub);
            clauses.push(if pattern.is_empty() {
                "TRUE".to_string()
            } else {
                pattern
            });
        }
        let not = if negate { "NOT " } else { "" };
        Ok(format!("{}({})", not, clauses.join(joiner)))
    }

    fn field(
        &self,
        name: &str,
        condition: &Condition,
        builder: &mut SqlBuilder,
        patterns: &mut Vec<String>,
        sorts: &mut Vec<String>,
    ) -> Result<()> {
        // authData is stored as one column; provider keys are not queryable
        if name.starts_with("_auth_data_") {
            return Ok(());
        }

        let constraints = match condition {
            Condition::Literal(value) => {
                match self.literal(name, value, builder)? {
                    Some(pattern) => patterns.push(pattern),
                    None => return Err(unsupported(name, value)),
                }
                return Ok(());
            }
            Condition::Constraints(constraints) => constraints,
        };

        if !self.schema.fields.contains_key(name)
            && constraints.contains(&Constraint::Exists(false))
        {
            return Ok(());
        }

        let initial_patterns = patterns.len();
        let initial_sorts = sorts.len();
        for constraint in constraints {
            if let Some(pattern) = self.constraint(name, constraint, builder, sorts)? {
                patterns.push(pattern);
            }
        }

        if patterns.len() == initial_patterns && sorts.len() == initial_sorts {
            return Err(AdapterError::unsupported_query(format!(
                "Postgres doesn't support this query type yet {:?} on field {}",
                constraints, name
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Column helpers
    // ------------------------------------------------------------------------

    fn is_array(&self, name: &str) -> bool {
        self.schema.is_array_field(name)
    }

    fn is_string_array(&self, name: &str) -> bool {
        self.schema
            .fields
            .get(name)
            .is_some_and(|f| f.is_string_array())
    }

    /// Column as jsonb, for the array helper functions
    fn array_column(&self, name: &str) -> String {
        if self.is_string_array(name) {
            format!("to_jsonb({})", quote_identifier(name))
        } else {
            quote_identifier(name)
        }
    }

    /// Column, or the nested text path for dotted names
    fn expression(&self, name: &str) -> String {
        if name.contains('.') {
            transform_dot_field(name)
        } else {
            quote_identifier(name)
        }
    }

    fn is_login_field(&self, name: &str) -> bool {
        self.case_insensitive && (name == "username" || name == "email")
    }

    /// Bound value for a top-level column
    fn scalar_param(&self, name: &str, value: &Value) -> Result<SqlParam> {
        match (value, self.schema.field_type(name)) {
            (Value::Bool(_), Some(FieldType::Number)) => Ok(SqlParam::Float(MAX_INT_PLUS_ONE)),
            (Value::String(_), Some(FieldType::Date)) => date_param(value),
            _ => to_param(value),
        }
    }

    /// Expression and placeholder comparing a nested value
    fn nested_operand(
        &self,
        name: &str,
        value: &Value,
        builder: &mut SqlBuilder,
    ) -> Result<(String, String)> {
        let path = transform_dot_field(name);
        Ok(match cast_type_for(value) {
            Some(cast) => (
                format!("CAST(({}) AS {})", path, cast),
                builder.push(to_param(value)?),
            ),
            None => (path, builder.push(SqlParam::Text(json_text(value)))),
        })
    }

    fn array_contains(&self, name: &str, values: Vec<Value>, builder: &mut SqlBuilder) -> String {
        format!(
            "array_contains({}, {}::jsonb)",
            self.array_column(name),
            builder.push(SqlParam::Json(Value::Array(values)))
        )
    }

    // ------------------------------------------------------------------------
    // Equality
    // ------------------------------------------------------------------------

    fn literal(
        &self,
        name: &str,
        value: &Value,
        builder: &mut SqlBuilder,
    ) -> Result<Option<String>> {
        if name.contains('.') {
            let path = transform_dot_field(name);
            return Ok(Some(match value {
                Value::Null => format!("{} IS NULL", path),
                Value::Object(_) | Value::Array(_) => format!(
                    "{} = {}::jsonb",
                    transform_dot_field_to_json(name),
                    builder.push(SqlParam::Json(value.clone()))
                ),
                scalar => format!(
                    "{} = {}::text",
                    path,
                    builder.push(SqlParam::Text(json_text(scalar)))
                ),
            }));
        }

        let column = quote_identifier(name);
        let pattern = match value {
            Value::Null => format!("{} IS NULL", column),
            Value::String(_) | Value::Number(_) | Value::Bool(_) if self.is_array(name) => {
                self.array_contains(name, vec![value.clone()], builder)
            }
            Value::String(s) if self.is_login_field(name) => {
                format!("LOWER({}) = LOWER({})", column, builder.push(s.as_str()))
            }
            Value::String(_) | Value::Number(_) | Value::Bool(_) => {
                format!("{} = {}", column, builder.push(self.scalar_param(name, value)?))
            }
            Value::Object(_) => match type_tag(value) {
                Some("Pointer") if self.is_array(name) => {
                    self.array_contains(name, vec![value.clone()], builder)
                }
                Some("Pointer") => format!("{} = {}", column, builder.push(object_id(value)?)),
                Some("Date" | "File") => {
                    format!("{} = {}", column, builder.push(to_param(value)?))
                }
                Some("GeoPoint") => {
                    let point = GeoPoint::from_json(value)?;
                    let lng = builder.push(point.longitude);
                    let lat = builder.push(point.latitude);
                    format!("{} ~= POINT({}, {})", column, lng, lat)
                }
                Some("Polygon") => {
                    let coordinates = value
                        .get("coordinates")
                        .and_then(Value::as_array)
                        .ok_or_else(|| {
                            AdapterError::invalid_json(format!("bad Polygon value: {}", value))
                        })?;
                    let polygon = convert_polygon_to_sql(coordinates)?;
                    format!("{} ~= {}::polygon", column, builder.push(polygon))
                }
                _ => format!(
                    "{} = {}::jsonb",
                    column,
                    builder.push(SqlParam::Json(value.clone()))
                ),
            },
            Value::Array(items) if self.is_string_array(name) => format!(
                "{} = {}::text[]",
                column,
                builder.push(SqlParam::TextArray(items.iter().map(json_text).collect()))
            ),
            Value::Array(_) if self.is_array(name) => format!(
                "{} = {}::jsonb",
                column,
                builder.push(SqlParam::Json(value.clone()))
            ),
            Value::Array(_) => return Ok(None),
        };
        Ok(Some(pattern))
    }

    // ------------------------------------------------------------------------
    // Operators
    // ------------------------------------------------------------------------

    fn constraint(
        &self,
        name: &str,
        constraint: &Constraint,
        builder: &mut SqlBuilder,
        sorts: &mut Vec<String>,
    ) -> Result<Option<String>> {
        let column = quote_identifier(name);
        Ok(match constraint {
            Constraint::Eq(value) => {
                reject_relative_time(value)?;
                self.literal(name, value, builder)?
            }
            Constraint::Ne(value) => Some(self.not_equal(name, value, builder)?),
            Constraint::Compare(comparator, value) => {
                self.compare(name, *comparator, value, builder)?
            }
            Constraint::In(values) => Some(self.membership(name, values, false, builder)?),
            Constraint::Nin(values) => Some(self.membership(name, values, true, builder)?),
            Constraint::All(values) => self.all(name, values, builder)?,
            Constraint::Exists(exists) => Some(format!(
                "{} {}",
                self.expression(name),
                if *exists { "IS NOT NULL" } else { "IS NULL" }
            )),
            Constraint::ContainedBy(values) => Some(format!(
                "{} <@ {}::jsonb",
                self.array_column(name),
                builder.push(SqlParam::Json(Value::Array(values.clone())))
            )),
            Constraint::Regex { pattern, options } => {
                let operator = if options.contains('i') { "~*" } else { "~" };
                let pattern = if options.contains('x') {
                    remove_white_space(pattern)
                } else {
                    pattern.clone()
                };
                Some(format!(
                    "{} {} '{}'",
                    self.expression(name),
                    operator,
                    process_regex_pattern(&pattern)
                ))
            }
            Constraint::Text(search) => {
                let language = builder.push(search.language.as_str());
                let term = builder.push(search.term.as_str());
                Some(format!(
                    "to_tsvector({lang}::regconfig, {col}) @@ to_tsquery({lang}::regconfig, {term})",
                    lang = language,
                    col = column,
                    term = term
                ))
            }
            Constraint::NearSphere {
                point,
                max_distance,
            } => {
                let distance = self.distance_sphere(&column, point, builder);
                sorts.push(format!("{} ASC", distance));
                max_distance.map(|max| {
                    format!("{} <= {}", distance, builder.push(radians_to_meters(max)))
                })
            }
            Constraint::WithinBox {
                bottom_left,
                upper_right,
            } => {
                let sql_box = format!(
                    "({}, {})",
                    bottom_left.to_sql_literal(),
                    upper_right.to_sql_literal()
                );
                Some(format!("{}::point <@ {}::box", column, builder.push(sql_box)))
            }
            Constraint::CenterSphere { center, distance } => {
                let expr = self.distance_sphere(&column, center, builder);
                Some(format!(
                    "{} <= {}",
                    expr,
                    builder.push(radians_to_meters(*distance))
                ))
            }
            Constraint::WithinPolygon(points) => {
                let polygon = format!(
                    "({})",
                    points
                        .iter()
                        .map(GeoPoint::to_sql_literal)
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                Some(format!(
                    "{}::point <@ {}::polygon",
                    column,
                    builder.push(polygon)
                ))
            }
            Constraint::IntersectsPoint(point) => Some(format!(
                "{}::polygon @> {}::point",
                column,
                builder.push(point.to_sql_literal())
            )),
        })
    }

    fn distance_sphere(&self, column: &str, point: &GeoPoint, builder: &mut SqlBuilder) -> String {
        let lng = builder.push(point.longitude);
        let lat = builder.push(point.latitude);
        format!(
            "ST_DistanceSphere({}::geometry, POINT({}, {})::geometry)",
            column, lng, lat
        )
    }

    fn not_equal(&self, name: &str, value: &Value, builder: &mut SqlBuilder) -> Result<String> {
        reject_relative_time(value)?;
        if value.is_null() {
            return Ok(format!("{} IS NOT NULL", self.expression(name)));
        }
        if name.contains('.') {
            let (expr, placeholder) = self.nested_operand(name, value, builder)?;
            return Ok(format!("({expr} <> {placeholder} OR {expr} IS NULL)"));
        }

        let column = quote_identifier(name);
        if self.is_array(name) {
            let contains = self.array_contains(name, vec![value.clone()], builder);
            return Ok(format!("({} IS NULL OR NOT {})", column, contains));
        }
        if type_tag(value) == Some("GeoPoint") {
            let point = GeoPoint::from_json(value)?;
            let lng = builder.push(point.longitude);
            let lat = builder.push(point.latitude);
            return Ok(format!(
                "(NOT {col} ~= POINT({lng}, {lat}) OR {col} IS NULL)",
                col = column
            ));
        }
        let placeholder = builder.push(self.scalar_param(name, value)?);
        Ok(format!(
            "({col} <> {placeholder} OR {col} IS NULL)",
            col = column
        ))
    }

    fn compare(
        &self,
        name: &str,
        comparator: Comparator,
        value: &Value,
        builder: &mut SqlBuilder,
    ) -> Result<Option<String>> {
        if value.is_null() {
            return Ok(None);
        }
        let operator = comparator.as_sql();

        if name.contains('.') {
            reject_relative_time(value)?;
            let (expr, placeholder) = self.nested_operand(name, value, builder)?;
            return Ok(Some(format!("{} {} {}", expr, operator, placeholder)));
        }

        let param = match value.get("$relativeTime") {
            Some(relative) => {
                if self.schema.field_type(name) != Some(&FieldType::Date) {
                    return Err(AdapterError::invalid_json(
                        "$relativeTime can only be used with Date field",
                    ));
                }
                let text = relative.as_str().ok_or_else(|| {
                    AdapterError::invalid_json("$relativeTime should be a string")
                })?;
                SqlParam::Timestamp(relative_time_to_date(text, self.now)?)
            }
            None => self.scalar_param(name, value)?,
        };
        Ok(Some(format!(
            "{} {} {}",
            quote_identifier(name),
            operator,
            builder.push(param)
        )))
    }

    fn membership(
        &self,
        name: &str,
        values: &[Value],
        negate: bool,
        builder: &mut SqlBuilder,
    ) -> Result<String> {
        let values: Vec<Value> = values
            .iter()
            .flat_map(|v| match v {
                Value::Array(inner) => inner.clone(),
                other => vec![other.clone()],
            })
            .collect();

        if values.is_empty() {
            return Ok(if negate { "1 = 1" } else { "1 = 2" }.to_string());
        }

        if name.contains('.') {
            let path = transform_dot_field_to_json(name);
            let placeholder = builder.push(SqlParam::Json(Value::Array(values)));
            let contains = format!("{}::jsonb @> ({})::jsonb", placeholder, path);
            return Ok(if negate {
                format!("({} IS NULL OR NOT {})", path, contains)
            } else {
                contains
            });
        }

        let column = quote_identifier(name);
        let has_null = values.iter().any(Value::is_null);
        let non_null: Vec<&Value> = values.iter().filter(|v| !v.is_null()).collect();

        if self.is_string_array(name) {
            if non_null.is_empty() {
                return Ok(format!(
                    "{} {}",
                    column,
                    if negate { "IS NOT NULL" } else { "IS NULL" }
                ));
            }
            let placeholders: Vec<String> = non_null
                .iter()
                .map(|v| builder.push(SqlParam::Text(json_text(v))))
                .collect();
            let overlap = format!("{} && ARRAY[{}]::text[]", column, placeholders.join(", "));
            return Ok(match (negate, has_null) {
                (false, false) => overlap,
                (false, true) => format!("({} IS NULL OR {})", column, overlap),
                (true, false) => format!("({} IS NULL OR NOT ({}))", column, overlap),
                (true, true) => format!("({} IS NOT NULL AND NOT ({}))", column, overlap),
            });
        }

        if self.is_array(name) {
            let contains = self.array_contains(name, values, builder);
            return Ok(if negate {
                format!("({} IS NULL OR NOT {})", column, contains)
            } else {
                contains
            });
        }

        if non_null.is_empty() {
            return Ok(format!(
                "{} {}",
                column,
                if negate { "IS NOT NULL" } else { "IS NULL" }
            ));
        }
        let placeholders = non_null
            .iter()
            .map(|v| Ok(builder.push(self.scalar_param(name, v)?)))
            .collect::<Result<Vec<_>>>()?;
        let list = placeholders.join(", ");
        Ok(match (negate, has_null) {
            (false, false) => format!("{} IN ({})", column, list),
            (false, true) => format!("({col} IS NULL OR {col} IN ({list}))", col = column),
            (true, false) => format!("({col} IS NULL OR {col} NOT IN ({list}))", col = column),
            (true, true) => format!("({col} IS NOT NULL AND {col} NOT IN ({list}))", col = column),
        })
    }

    fn all(&self, name: &str, values: &[Value], builder: &mut SqlBuilder) -> Result<Option<String>> {
        if !self.is_array(name) {
            // Single-element $all on a pointer column compares the objectId
            return Ok(match values {
                [single] => Some(format!(
                    "{} = {}",
                    quote_identifier(name),
                    builder.push(self.scalar_param(name, single)?)
                )),
                _ => None,
            });
        }

        let column = self.array_column(name);
        if values.iter().any(is_starts_with_regex_value) {
            if !values.iter().all(is_starts_with_regex_value) {
                return Err(AdapterError::invalid_query(format!(
                    "All $all values must be of regex type or none: {}",
                    Value::Array(values.to_vec())
                )));
            }
            let prefixes: Vec<Value> = values
                .iter()
                .filter_map(|v| v.get("$regex").and_then(Value::as_str))
                .map(|regex| {
                    let processed = process_regex_pattern(regex).replace("''", "'");
                    let prefix = processed.strip_prefix('^').unwrap_or(&processed);
                    Value::String(format!("{}%", prefix))
                })
                .collect();
            return Ok(Some(format!(
                "array_contains_all_regex({}, {}::jsonb)",
                column,
                builder.push(SqlParam::Json(Value::Array(prefixes)))
            )));
        }

        Ok(Some(format!(
            "array_contains_all({}, {}::jsonb)",
            column,
            builder.push(SqlParam::Json(Value::Array(values.to_vec())))
        )))
    }
}

fn is_starts_with_regex_value(value: &Value) -> bool {
    value
        .get("$regex")
        .and_then(Value::as_str)
        .is_some_and(is_starts_with_regex)
}

fn reject_relative_time(value: &Value) -> Result<()> {
    if value.get("$relativeTime").is_some() {
        return Err(AdapterError::invalid_json(
            "$relativeTime can only be used with the $lt, $lte, $gt, and $gte operators",
        ));
    }
    Ok(())
}

/// Text form of a value as `->>` renders it
fn json_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn unsupported(name: &str, value: &Value) -> AdapterError {
    AdapterError::unsupported_query(format!(
        "Postgres doesn't support this query type yet {} on field {}",
        value, name
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::decode_query;
    use crate::sql::builder::placeholders;
    use crate::types::FieldDescriptor;
    use serde_json::json;

    fn schema() -> ClassSchema {
        ClassSchema::with_default_fields("GameScore")
            .field("score", FieldDescriptor::new(FieldType::Number))
            .field("name", FieldDescriptor::new(FieldType::String))
            .field("username", FieldDescriptor::new(FieldType::String))
            .field("tags", FieldDescriptor::array_of(FieldType::String))
            .field("items", FieldDescriptor::new(FieldType::Array))
            .field("owner", FieldDescriptor::pointer("_User"))
            .field("location", FieldDescriptor::new(FieldType::GeoPoint))
            .field("area", FieldDescriptor::new(FieldType::Polygon))
            .field("meta", FieldDescriptor::new(FieldType::Object))
            .field("body", FieldDescriptor::new(FieldType::String))
    }

    fn compile(query: Value) -> Result<WhereClause> {
        build_where_clause(&schema(), &decode_query(&query)?, 1, false)
    }

    fn assert_placeholders_match(clause: &WhereClause, start: usize) {
        let mut sql = clause.pattern.clone();
        for sort in &clause.sorts {
            sql.push(' ');
            sql.push_str(sort);
        }
        let expected: Vec<usize> = (start..start + clause.params.len()).collect();
        assert_eq!(
            placeholders(&sql).into_iter().collect::<Vec<_>>(),
            expected,
            "placeholders of {}",
            sql
        );
    }

    // =========================================================================
    // Comparison Tests
    // =========================================================================

    #[test]
    fn test_range_on_number() {
        let clause = compile(json!({"score": {"$gt": 5, "$lte": 10}})).unwrap();
        assert_eq!(clause.pattern, "\"score\" > $1 AND \"score\" <= $2");
        assert_eq!(clause.params, vec![SqlParam::Float(5.0), SqlParam::Float(10.0)]);
    }

    #[test]
    fn test_equality_literals() {
        let clause = compile(json!({"name": "x", "score": 3, "meta": null})).unwrap();
        assert_eq!(
            clause.pattern,
            "\"name\" = $1 AND \"score\" = $2 AND \"meta\" IS NULL"
        );
        assert_params(&clause, 2);
    }

    fn assert_params(clause: &WhereClause, len: usize) {
        assert_eq!(clause.params.len(), len);
        assert_placeholders_match(clause, 1);
    }

    #[test]
    fn test_start_index_offsets_placeholders() {
        let clause = build_where_clause(
            &schema(),
            &decode_query(&json!({"name": "x", "score": {"$ne": 1}})).unwrap(),
            4,
            false,
        )
        .unwrap();
        assert_eq!(
            clause.pattern,
            "\"name\" = $4 AND (\"score\" <> $5 OR \"score\" IS NULL)"
        );
        assert_placeholders_match(&clause, 4);
    }

    #[test]
    fn test_boolean_against_number_never_matches() {
        let clause = compile(json!({"score": true})).unwrap();
        assert_eq!(clause.params, vec![SqlParam::Float(MAX_INT_PLUS_ONE)]);
    }

    #[test]
    fn test_ne_tolerates_null_rows() {
        let clause = compile(json!({"name": {"$ne": "x"}})).unwrap();
        assert_eq!(clause.pattern, "(\"name\" <> $1 OR \"name\" IS NULL)");

        let clause = compile(json!({"name": {"$ne": null}})).unwrap();
        assert_eq!(clause.pattern, "\"name\" IS NOT NULL");
        assert!(clause.params.is_empty());
    }

    #[test]
    fn test_exists() {
        let clause = compile(json!({"name": {"$exists": false}})).unwrap();
        assert_eq!(clause.pattern, "\"name\" IS NULL");
        let clause = compile(json!({"name": {"$exists": true}})).unwrap();
        assert_eq!(clause.pattern, "\"name\" IS NOT NULL");
    }

    #[test]
    fn test_missing_field_exists_false_is_skipped() {
        let clause = compile(json!({"nothere": {"$exists": false}, "name": "a"})).unwrap();
        assert_eq!(clause.pattern, "\"name\" = $1");
    }

    #[test]
    fn test_relative_time_on_date() {
        let clause = compile(json!({"createdAt": {"$gt": {"$relativeTime": "3 days ago"}}})).unwrap();
        assert_eq!(clause.pattern, "\"createdAt\" > $1");
        assert!(matches!(clause.params[0], SqlParam::Timestamp(_)));
    }

    #[test]
    fn test_relative_time_rejected_outside_dates_and_ranges() {
        let err = compile(json!({"name": {"$gt": {"$relativeTime": "in 1 day"}}})).unwrap_err();
        assert!(matches!(err, AdapterError::InvalidJson(_)));

        let err = compile(json!({"createdAt": {"$ne": {"$relativeTime": "now"}}})).unwrap_err();
        assert!(err.to_string().contains("$lt, $lte, $gt, and $gte"));
    }

    #[test]
    fn test_relative_time_out_of_range_is_rejected() {
        let err = compile(json!({"createdAt": {"$gt": {"$relativeTime": "in 300000000 years"}}}))
            .unwrap_err();
        assert!(matches!(err, AdapterError::InvalidJson(_)));
    }

    #[test]
    fn test_date_literal_is_timestamp() {
        let clause =
            compile(json!({"updatedAt": {"$lt": {"__type": "Date", "iso": "2020-01-01T00:00:00Z"}}}))
                .unwrap();
        assert!(matches!(clause.params[0], SqlParam::Timestamp(_)));
    }

    // =========================================================================
    // Dotted Field Tests
    // =========================================================================

    #[test]
    fn test_dotted_equality() {
        let clause = compile(json!({"meta.color": "red"})).unwrap();
        assert_eq!(clause.pattern, "\"meta\"->>'color' = $1::text");
        assert_eq!(clause.params, vec![SqlParam::Text("red".to_string())]);
    }

    #[test]
    fn test_dotted_numeric_comparison_casts() {
        let clause = compile(json!({"meta.size": {"$gte": 2}})).unwrap();
        assert_eq!(
            clause.pattern,
            "CAST((\"meta\"->>'size') AS double precision) >= $1"
        );
    }

    #[test]
    fn test_dotted_null() {
        let clause = compile(json!({"meta.color": null})).unwrap();
        assert_eq!(clause.pattern, "\"meta\"->>'color' IS NULL");
    }

    // =========================================================================
    // Membership Tests
    // =========================================================================

    #[test]
    fn test_empty_in_and_nin() {
        assert_eq!(compile(json!({"name": {"$in": []}})).unwrap().pattern, "1 = 2");
        assert_eq!(compile(json!({"name": {"$nin": []}})).unwrap().pattern, "1 = 1");
        assert_eq!(compile(json!({"tags": {"$in": []}})).unwrap().pattern, "1 = 2");
        assert_eq!(compile(json!({"items": {"$nin": []}})).unwrap().pattern, "1 = 1");
    }

    #[test]
    fn test_scalar_in() {
        let clause = compile(json!({"name": {"$in": ["a", null, "b"]}})).unwrap();
        assert_eq!(
            clause.pattern,
            "(\"name\" IS NULL OR \"name\" IN ($1, $2))"
        );
        assert_params(&clause, 2);
    }

    #[test]
    fn test_scalar_nin_keeps_null_rows() {
        let clause = compile(json!({"name": {"$nin": ["a"]}})).unwrap();
        assert_eq!(
            clause.pattern,
            "(\"name\" IS NULL OR \"name\" NOT IN ($1))"
        );
    }

    #[test]
    fn test_string_array_in_uses_overlap() {
        let clause = compile(json!({"tags": {"$in": ["a", "b"]}})).unwrap();
        assert_eq!(clause.pattern, "\"tags\" && ARRAY[$1, $2]::text[]");
    }

    #[test]
    fn test_acl_columns_are_text_arrays() {
        let clause = compile(json!({"_rperm": {"$in": [null, "*"]}})).unwrap();
        assert_eq!(
            clause.pattern,
            "(\"_rperm\" IS NULL OR \"_rperm\" && ARRAY[$1]::text[])"
        );
        assert_eq!(clause.params, vec![SqlParam::Text("*".to_string())]);

        let clause = compile(json!({"_wperm": "role:admin"})).unwrap();
        assert_eq!(
            clause.pattern,
            "array_contains(to_jsonb(\"_wperm\"), $1::jsonb)"
        );
        assert_eq!(clause.params, vec![SqlParam::Json(json!(["role:admin"]))]);
    }

    #[test]
    fn test_pointer_in_compares_object_ids() {
        let clause = compile(json!({"owner": {"$in": [
            {"__type": "Pointer", "className": "_User", "objectId": "u1"}
        ]}}))
        .unwrap();
        assert_eq!(clause.params, vec![SqlParam::Text("u1".to_string())]);
    }

    #[test]
    fn test_json_array_in_uses_contains() {
        let clause = compile(json!({"items": {"$in": [1, 2]}})).unwrap();
        assert_eq!(clause.pattern, "array_contains(\"items\", $1::jsonb)");
        assert_eq!(clause.params, vec![SqlParam::Json(json!([1, 2]))]);
    }

    // =========================================================================
    // $all Tests
    // =========================================================================

    #[test]
    fn test_all_values() {
        let clause = compile(json!({"items": {"$all": [1, 2]}})).unwrap();
        assert_eq!(clause.pattern, "array_contains_all(\"items\", $1::jsonb)");
    }

    #[test]
    fn test_all_regex_prefixes() {
        let clause = compile(json!({"tags": {"$all": [
            {"$regex": "^\\Qab\\E"},
            {"$regex": "^\\Qc.d\\E"}
        ]}}))
        .unwrap();
        assert_eq!(
            clause.pattern,
            "array_contains_all_regex(to_jsonb(\"tags\"), $1::jsonb)"
        );
        assert_eq!(clause.params, vec![SqlParam::Json(json!(["ab%", "c\\.d%"]))]);
    }

    #[test]
    fn test_all_rejects_mixed_regex() {
        let err = compile(json!({"tags": {"$all": [{"$regex": "^\\Qab\\E"}, "x"]}})).unwrap_err();
        assert!(matches!(err, AdapterError::InvalidQuery(_)));
    }

    // =========================================================================
    // Logical Operator Tests
    // =========================================================================

    #[test]
    fn test_or_numbering_continues() {
        let clause = compile(json!({"$or": [{"name": "a"}, {"score": 2}], "body": "c"})).unwrap();
        assert_eq!(
            clause.pattern,
            "(\"name\" = $1 OR \"score\" = $2) AND \"body\" = $3"
        );
        assert_params(&clause, 3);
    }

    #[test]
    fn test_nor_negates() {
        let clause = compile(json!({"$nor": [{"name": "a"}, {"name": "b"}]})).unwrap();
        assert_eq!(clause.pattern, "NOT (\"name\" = $1 OR \"name\" = $2)");
    }

    #[test]
    fn test_nested_logical() {
        let clause = compile(json!({"$and": [
            {"$or": [{"name": "a"}, {"score": {"$in": [1, 2]}}]},
            {"tags": {"$nin": ["x"]}}
        ]}))
        .unwrap();
        assert_params(&clause, 4);
    }

    // =========================================================================
    // Regex and Text Tests
    // =========================================================================

    #[test]
    fn test_regex_is_inlined() {
        let clause = compile(json!({"name": {"$regex": "^\\Qa.b\\E", "$options": "i"}})).unwrap();
        assert_eq!(clause.pattern, "\"name\" ~* '^a\\.b'");
        assert!(clause.params.is_empty());
    }

    #[test]
    fn test_text_search() {
        let clause = compile(json!({"body": {"$text": {"$search": {"$term": "coffee"}}}})).unwrap();
        assert_eq!(
            clause.pattern,
            "to_tsvector($1::regconfig, \"body\") @@ to_tsquery($1::regconfig, $2)"
        );
        assert_params(&clause, 2);
    }

    #[test]
    fn test_case_insensitive_login_fields() {
        let clause = build_where_clause(
            &schema(),
            &decode_query(&json!({"username": "Bob"})).unwrap(),
            1,
            true,
        )
        .unwrap();
        assert_eq!(clause.pattern, "LOWER(\"username\") = LOWER($1)");
    }

    // =========================================================================
    // Typed Literal and Geo Tests
    // =========================================================================

    #[test]
    fn test_pointer_equality() {
        let clause =
            compile(json!({"owner": {"__type": "Pointer", "className": "_User", "objectId": "u1"}}))
                .unwrap();
        assert_eq!(clause.pattern, "\"owner\" = $1");
        assert_eq!(clause.params, vec![SqlParam::Text("u1".to_string())]);
    }

    #[test]
    fn test_pointer_in_array_field() {
        let pointer = json!({"__type": "Pointer", "className": "_User", "objectId": "u1"});
        let clause = compile(json!({"items": pointer.clone()})).unwrap();
        assert_eq!(clause.pattern, "array_contains(\"items\", $1::jsonb)");
        assert_eq!(clause.params, vec![SqlParam::Json(json!([pointer]))]);
    }

    #[test]
    fn test_near_sphere_adds_sort() {
        let clause = compile(json!({"location": {
            "$nearSphere": {"__type": "GeoPoint", "latitude": 10, "longitude": 20},
            "$maxDistance": 1
        }}))
        .unwrap();
        assert_eq!(
            clause.pattern,
            "ST_DistanceSphere(\"location\"::geometry, POINT($1, $2)::geometry) <= $3"
        );
        assert_eq!(clause.sorts.len(), 1);
        assert!(clause.sorts[0].ends_with("ASC"));
        assert_eq!(clause.params[2], SqlParam::Float(6_371_000.0));
        assert_placeholders_match(&clause, 1);
    }

    #[test]
    fn test_within_box() {
        let clause = compile(json!({"location": {"$within": {"$box": [
            {"__type": "GeoPoint", "latitude": 1, "longitude": 2},
            {"__type": "GeoPoint", "latitude": 3, "longitude": 4}
        ]}}}))
        .unwrap();
        assert_eq!(clause.pattern, "\"location\"::point <@ $1::box");
        assert_eq!(
            clause.params,
            vec![SqlParam::Text("((2, 1), (4, 3))".to_string())]
        );
    }

    #[test]
    fn test_geo_intersects() {
        let clause = compile(json!({"area": {"$geoIntersects": {
            "$point": {"__type": "GeoPoint", "latitude": 1, "longitude": 2}
        }}}))
        .unwrap();
        assert_eq!(clause.pattern, "\"area\"::polygon @> $1::point");
    }

    #[test]
    fn test_polygon_literal() {
        let clause = compile(json!({"area": {"__type": "Polygon", "coordinates": [[0, 0], [0, 1], [1, 1]]}}))
            .unwrap();
        assert_eq!(clause.pattern, "\"area\" ~= $1::polygon");
        assert_eq!(
            clause.params,
            vec![SqlParam::Text("((0, 0), (1, 0), (1, 1), (0, 0))".to_string())]
        );
    }

    #[test]
    fn test_geo_point_literal_validates() {
        let err =
            compile(json!({"location": {"__type": "GeoPoint", "latitude": 100, "longitude": 0}}))
                .unwrap_err();
        assert!(matches!(err, AdapterError::InvalidJson(_)));
    }

    // =========================================================================
    // Unsupported Tests
    // =========================================================================

    #[test]
    fn test_array_literal_on_scalar_is_unsupported() {
        let err = compile(json!({"name": ["a"]})).unwrap_err();
        assert!(matches!(err, AdapterError::UnsupportedQuery(_)));
    }

    #[test]
    fn test_all_with_many_values_on_scalar_is_unsupported() {
        let err = compile(json!({"name": {"$all": ["a", "b"]}})).unwrap_err();
        assert!(matches!(err, AdapterError::UnsupportedQuery(_)));
    }

    #[test]
    fn test_auth_data_keys_are_skipped() {
        let clause = compile(json!({"_auth_data_facebook": {"id": "1"}})).unwrap();
        assert!(clause.pattern.is_empty());
        assert_eq!(clause.to_sql(), "");
    }

    // =========================================================================
    // ORDER BY Tests
    // =========================================================================

    #[test]
    fn test_order_by() {
        let sort = vec![
            ("score".to_string(), SortDirection::Descending),
            ("meta.rank".to_string(), SortDirection::Ascending),
        ];
        assert_eq!(
            build_order_by_clause(&sort, &[]),
            "ORDER BY \"score\" DESC, \"meta\"->'rank' ASC"
        );
        assert_eq!(build_order_by_clause(&[], &[]), "");
    }
}
