//! Query model
//!
//! Filters arrive as JSON objects mapping field names (or `$and`/`$or`/`$nor`)
//! to a literal or a constraint object. They are decoded once into [`Query`],
//! so the compiler matches on variants instead of probing keys.

use std::time::Duration;

use serde_json::{Map, Value};

use crate::error::{AdapterError, Result};
use crate::sql::literal::{GeoPoint, type_tag};

/// Decoded filter: an ordered list of field filters joined with AND
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    pub filters: Vec<FieldFilter>,
}

impl Query {
    /// Query matching every row
    pub fn all() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

/// One top-level entry of a query object
#[derive(Debug, Clone, PartialEq)]
pub enum FieldFilter {
    And(Vec<Query>),
    Or(Vec<Query>),
    Nor(Vec<Query>),
    Field { name: String, condition: Condition },
}

/// What a field is matched against
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Plain or typed (`__type`) value compared for equality
    Literal(Value),
    /// Operator object; every constraint must hold
    Constraints(Vec<Constraint>),
}

/// Range comparator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparator {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Comparator::Gt => ">",
            Comparator::Gte => ">=",
            Comparator::Lt => "<",
            Comparator::Lte => "<=",
        }
    }

    fn from_key(key: &str) -> Option<Self> {
        match key {
            "$gt" => Some(Comparator::Gt),
            "$gte" => Some(Comparator::Gte),
            "$lt" => Some(Comparator::Lt),
            "$lte" => Some(Comparator::Lte),
            _ => None,
        }
    }
}

/// Full-text search request
#[derive(Debug, Clone, PartialEq)]
pub struct TextSearch {
    pub term: String,
    pub language: String,
}

/// Single operator of a constraint object
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    Compare(Comparator, Value),
    Eq(Value),
    Ne(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    All(Vec<Value>),
    Exists(bool),
    ContainedBy(Vec<Value>),
    Regex { pattern: String, options: String },
    Text(TextSearch),
    /// Distance in radians; without one the constraint only orders results
    NearSphere {
        point: GeoPoint,
        max_distance: Option<f64>,
    },
    WithinBox {
        bottom_left: GeoPoint,
        upper_right: GeoPoint,
    },
    CenterSphere {
        center: GeoPoint,
        distance: f64,
    },
    WithinPolygon(Vec<GeoPoint>),
    IntersectsPoint(GeoPoint),
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Ascending => "ASC",
            SortDirection::Descending => "DESC",
        }
    }

    /// `1` sorts ascending, anything else descending
    pub fn from_json(value: &Value) -> Self {
        if value.as_i64() == Some(1) {
            SortDirection::Ascending
        } else {
            SortDirection::Descending
        }
    }
}

/// Read options for `find`, `count` and `distinct`
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub skip: Option<i64>,
    pub limit: Option<i64>,
    /// Ordered sort keys
    pub sort: Vec<(String, SortDirection)>,
    /// Projection; `None` selects every column
    pub keys: Option<Vec<String>>,
    /// Compare `username`/`email` case-insensitively
    pub case_insensitive: bool,
    /// Return the query plan instead of rows
    pub explain: bool,
    /// Per-query execution time limit
    pub max_time: Option<Duration>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_skip(mut self, skip: i64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Append a sort key
    pub fn sort_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push((field.into(), direction));
        self
    }

    /// Sort keys from a `{field: 1 | -1}` object
    pub fn with_sort_json(mut self, sort: &Map<String, Value>) -> Self {
        self.sort = sort
            .iter()
            .map(|(field, dir)| (field.clone(), SortDirection::from_json(dir)))
            .collect();
        self
    }

    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn case_insensitive(mut self, enabled: bool) -> Self {
        self.case_insensitive = enabled;
        self
    }

    pub fn explain(mut self, enabled: bool) -> Self {
        self.explain = enabled;
        self
    }

    pub fn with_max_time(mut self, limit: Duration) -> Self {
        self.max_time = Some(limit);
        self
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode a JSON query object
pub fn decode_query(value: &Value) -> Result<Query> {
    match value {
        Value::Object(map) => decode_query_map(map),
        Value::Null => Ok(Query::all()),
        other => Err(AdapterError::invalid_query(format!(
            "query must be an object, got {}",
            other
        ))),
    }
}

/// Decode a query already held as a JSON map
pub fn decode_query_map(map: &Map<String, Value>) -> Result<Query> {
    let mut filters = Vec::with_capacity(map.len());
    for (key, value) in map {
        let filter = match key.as_str() {
            "$and" => FieldFilter::And(decode_subqueries(key, value)?),
            "$or" => FieldFilter::Or(decode_subqueries(key, value)?),
            "$nor" => FieldFilter::Nor(decode_subqueries(key, value)?),
            name => FieldFilter::Field {
                name: name.to_string(),
                condition: decode_condition(name, value)?,
            },
        };
        filters.push(filter);
    }
    Ok(Query { filters })
}

fn decode_subqueries(key: &str, value: &Value) -> Result<Vec<Query>> {
    let items = value.as_array().ok_or_else(|| {
        AdapterError::invalid_query(format!("bad {} format - use an array value", key))
    })?;
    items.iter().map(decode_query).collect()
}

fn is_constraint_object(map: &Map<String, Value>) -> bool {
    !map.is_empty() && map.keys().all(|k| k.starts_with('$'))
}

fn decode_condition(field: &str, value: &Value) -> Result<Condition> {
    let map = match value {
        Value::Object(map) if type_tag(value).is_none() && is_constraint_object(map) => map,
        _ => return Ok(Condition::Literal(value.clone())),
    };

    let mut constraints = Vec::new();
    for (key, operand) in map {
        if let Some(comparator) = Comparator::from_key(key) {
            constraints.push(Constraint::Compare(comparator, operand.clone()));
            continue;
        }
        let constraint = match key.as_str() {
            "$eq" => Constraint::Eq(operand.clone()),
            "$ne" => Constraint::Ne(operand.clone()),
            "$in" => Constraint::In(array_operand(key, operand)?),
            "$nin" => Constraint::Nin(array_operand(key, operand)?),
            "$all" => Constraint::All(array_operand(key, operand)?),
            "$containedBy" => Constraint::ContainedBy(array_operand(key, operand)?),
            "$exists" => Constraint::Exists(operand.as_bool().ok_or_else(|| {
                AdapterError::invalid_json(format!("bad $exists value: {}", operand))
            })?),
            "$regex" => {
                let pattern = operand.as_str().ok_or_else(|| {
                    AdapterError::invalid_query(format!("bad $regex value: {}", operand))
                })?;
                let options = map.get("$options").and_then(Value::as_str).unwrap_or("");
                Constraint::Regex {
                    pattern: pattern.to_string(),
                    options: options.to_string(),
                }
            }
            "$text" => Constraint::Text(decode_text(operand)?),
            "$nearSphere" => Constraint::NearSphere {
                point: GeoPoint::from_json(operand)?,
                max_distance: map.get("$maxDistance").and_then(Value::as_f64),
            },
            "$within" => decode_within(operand)?,
            "$geoWithin" => decode_geo_within(operand)?,
            "$geoIntersects" => decode_geo_intersects(operand)?,
            // $options and $maxDistance are read alongside their operator
            _ => continue,
        };
        constraints.push(constraint);
    }

    if constraints.is_empty() {
        return Err(AdapterError::unsupported_query(format!(
            "Postgres doesn't support this query type yet {} on field {}",
            value, field
        )));
    }
    Ok(Condition::Constraints(constraints))
}

fn array_operand(key: &str, operand: &Value) -> Result<Vec<Value>> {
    operand
        .as_array()
        .cloned()
        .ok_or_else(|| AdapterError::invalid_json(format!("bad {} value", key)))
}

fn decode_text(operand: &Value) -> Result<TextSearch> {
    let search = operand
        .get("$search")
        .and_then(Value::as_object)
        .ok_or_else(|| AdapterError::invalid_json("bad $text: $search, should be object"))?;

    let term = search
        .get("$term")
        .and_then(Value::as_str)
        .ok_or_else(|| AdapterError::invalid_json("bad $text: $term, should be string"))?;

    let language = match search.get("$language") {
        None => "english".to_string(),
        Some(Value::String(language)) => language.clone(),
        Some(_) => {
            return Err(AdapterError::invalid_json(
                "bad $text: $language, should be string",
            ));
        }
    };

    match search.get("$caseSensitive") {
        None | Some(Value::Bool(false)) => {}
        Some(Value::Bool(true)) => {
            return Err(AdapterError::invalid_query(
                "bad $text: $caseSensitive not supported, please use $regex or create a separate lower case column.",
            ));
        }
        Some(_) => {
            return Err(AdapterError::invalid_json(
                "bad $text: $caseSensitive, should be boolean",
            ));
        }
    }

    match search.get("$diacriticSensitive") {
        None | Some(Value::Bool(true)) => {}
        Some(Value::Bool(false)) => {
            return Err(AdapterError::invalid_query(
                "bad $text: $diacriticSensitive - false not supported, install Postgres Unaccent Extension",
            ));
        }
        Some(_) => {
            return Err(AdapterError::invalid_json(
                "bad $text: $diacriticSensitive, should be boolean",
            ));
        }
    }

    Ok(TextSearch {
        term: term.to_string(),
        language,
    })
}

fn decode_within(operand: &Value) -> Result<Constraint> {
    let corners = operand
        .get("$box")
        .and_then(Value::as_array)
        .filter(|b| b.len() == 2)
        .ok_or_else(|| AdapterError::invalid_json("bad $within $box, should be two GeoPoints"))?;
    Ok(Constraint::WithinBox {
        bottom_left: GeoPoint::from_json(&corners[0])?,
        upper_right: GeoPoint::from_json(&corners[1])?,
    })
}

fn decode_geo_within(operand: &Value) -> Result<Constraint> {
    if let Some(center_sphere) = operand.get("$centerSphere") {
        let parts = center_sphere.as_array().filter(|p| p.len() >= 2).ok_or_else(|| {
            AdapterError::invalid_json(
                "bad $geoWithin value; $centerSphere should be an array of GeoPoint and distance",
            )
        })?;
        let center = GeoPoint::from_json_or_pair(&parts[0]).map_err(|_| {
            AdapterError::invalid_json(
                "bad $geoWithin value; $centerSphere geo point invalid",
            )
        })?;
        let distance = parts[1]
            .as_f64()
            .filter(|d| *d >= 0.0)
            .ok_or_else(|| {
                AdapterError::invalid_json(
                    "bad $geoWithin value; $centerSphere distance invalid",
                )
            })?;
        return Ok(Constraint::CenterSphere { center, distance });
    }

    if let Some(polygon) = operand.get("$polygon") {
        let points = match polygon {
            Value::Object(_) if type_tag(polygon) == Some("Polygon") => {
                let coordinates = polygon
                    .get("coordinates")
                    .and_then(Value::as_array)
                    .filter(|c| c.len() >= 3)
                    .ok_or_else(|| {
                        AdapterError::invalid_json(
                            "bad $geoWithin value; Polygon.coordinates should contain at least 3 lon/lat pairs",
                        )
                    })?;
                coordinates
                    .iter()
                    .map(|pair| match pair.as_array().map(Vec::as_slice) {
                        Some([lat, lng]) => match (lat.as_f64(), lng.as_f64()) {
                            (Some(lat), Some(lng)) => GeoPoint::new(lat, lng),
                            _ => Err(AdapterError::invalid_json("bad $geoWithin value")),
                        },
                        _ => Err(AdapterError::invalid_json("bad $geoWithin value")),
                    })
                    .collect::<Result<Vec<_>>>()?
            }
            Value::Array(items) => {
                if items.len() < 3 {
                    return Err(AdapterError::invalid_json(
                        "bad $geoWithin value; $polygon should contain at least 3 GeoPoints",
                    ));
                }
                items
                    .iter()
                    .map(GeoPoint::from_json_or_pair)
                    .collect::<Result<Vec<_>>>()?
            }
            _ => {
                return Err(AdapterError::invalid_json(
                    "bad $geoWithin value; $polygon should be Polygon object or Array of GeoPoints",
                ));
            }
        };
        return Ok(Constraint::WithinPolygon(points));
    }

    Err(AdapterError::invalid_json(
        "bad $geoWithin value; expected $centerSphere or $polygon",
    ))
}

fn decode_geo_intersects(operand: &Value) -> Result<Constraint> {
    let point = operand
        .get("$point")
        .filter(|p| type_tag(p) == Some("GeoPoint"))
        .ok_or_else(|| {
            AdapterError::invalid_json("bad $geoIntersect value; $point should be GeoPoint")
        })?;
    Ok(Constraint::IntersectsPoint(GeoPoint::from_json(point)?))
}
