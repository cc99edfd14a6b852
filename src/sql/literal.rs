//! Typed literal formatting
//!
//! Shared by the query and mutation compilers so that values are written and
//! read back in the same shape: Pointers as their objectId, Dates as
//! timestamps, GeoPoints as `(lon, lat)` and Polygons as closed rings.

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};

use crate::error::{AdapterError, Result};
use crate::sql::builder::SqlParam;

/// Mean Earth radius in kilometers
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Convert a distance in radians to meters
pub fn radians_to_meters(radians: f64) -> f64 {
    radians * EARTH_RADIUS_KM * 1000.0
}

/// The `__type` tag of a typed value, if any
pub fn type_tag(value: &Value) -> Option<&str> {
    value.get("__type").and_then(Value::as_str)
}

/// Latitude/longitude pair
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    /// Validated point
    pub fn new(latitude: f64, longitude: f64) -> Result<Self> {
        validate_coordinates(latitude, longitude)?;
        Ok(Self {
            latitude,
            longitude,
        })
    }

    /// Parse `{"__type": "GeoPoint", "latitude": .., "longitude": ..}`
    pub fn from_json(value: &Value) -> Result<Self> {
        if type_tag(value) != Some("GeoPoint") {
            return Err(AdapterError::invalid_json(format!(
                "bad GeoPoint value: {}",
                value
            )));
        }
        let latitude = value.get("latitude").and_then(Value::as_f64);
        let longitude = value.get("longitude").and_then(Value::as_f64);
        match (latitude, longitude) {
            (Some(lat), Some(lng)) => Self::new(lat, lng),
            _ => Err(AdapterError::invalid_json(format!(
                "bad GeoPoint value: {}",
                value
            ))),
        }
    }

    /// Parse either a GeoPoint object or a `[lon, lat]` pair
    pub fn from_json_or_pair(value: &Value) -> Result<Self> {
        if let Some(pair) = value.as_array() {
            if let [lng, lat] = pair.as_slice() {
                if let (Some(lng), Some(lat)) = (lng.as_f64(), lat.as_f64()) {
                    return Self::new(lat, lng);
                }
            }
        }
        Self::from_json(value)
    }

    /// `(lon, lat)` literal
    pub fn to_sql_literal(&self) -> String {
        format!("({}, {})", self.longitude, self.latitude)
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("__type".to_string(), Value::from("GeoPoint"));
        map.insert("latitude".to_string(), Value::from(self.latitude));
        map.insert("longitude".to_string(), Value::from(self.longitude));
        Value::Object(map)
    }
}

/// Reject latitudes outside [-90, 90] and longitudes outside [-180, 180]
pub fn validate_coordinates(latitude: f64, longitude: f64) -> Result<()> {
    if !latitude.is_finite() || !longitude.is_finite() {
        return Err(AdapterError::invalid_json(
            "GeoPoint coordinates must be finite numbers",
        ));
    }
    if latitude < -90.0 {
        return Err(AdapterError::invalid_json(format!(
            "GeoPoint latitude out of bounds: {} < -90.0.",
            latitude
        )));
    }
    if latitude > 90.0 {
        return Err(AdapterError::invalid_json(format!(
            "GeoPoint latitude out of bounds: {} > 90.0.",
            latitude
        )));
    }
    if longitude < -180.0 {
        return Err(AdapterError::invalid_json(format!(
            "GeoPoint longitude out of bounds: {} < -180.0.",
            longitude
        )));
    }
    if longitude > 180.0 {
        return Err(AdapterError::invalid_json(format!(
            "GeoPoint longitude out of bounds: {} > 180.0.",
            longitude
        )));
    }
    Ok(())
}

fn coordinate_pair(point: &Value) -> Result<(f64, f64)> {
    match point.as_array().map(Vec::as_slice) {
        Some([lat, lng]) => match (lat.as_f64(), lng.as_f64()) {
            (Some(lat), Some(lng)) => Ok((lat, lng)),
            _ => Err(AdapterError::invalid_json(format!(
                "bad Polygon coordinate: {}",
                point
            ))),
        },
        _ => Err(AdapterError::invalid_json(format!(
            "bad Polygon coordinate: {}",
            point
        ))),
    }
}

/// Polygon coordinates (`[[lat, lon], ...]`) as a closed polygon literal
///
/// The ring is closed if its last vertex differs from the first, and must have
/// at least three distinct vertices.
pub fn convert_polygon_to_sql(coordinates: &[Value]) -> Result<String> {
    if coordinates.len() < 3 {
        return Err(AdapterError::invalid_json(
            "Polygon must have at least 3 values",
        ));
    }
    let mut ring = coordinates
        .iter()
        .map(coordinate_pair)
        .collect::<Result<Vec<_>>>()?;

    if ring.first() != ring.last() {
        ring.push(ring[0]);
    }

    let mut distinct: Vec<(f64, f64)> = Vec::with_capacity(ring.len());
    for vertex in &ring {
        if !distinct.contains(vertex) {
            distinct.push(*vertex);
        }
    }
    if distinct.len() < 3 {
        return Err(AdapterError::invalid_json(
            "GeoJSON: Loop must have at least 3 different vertices",
        ));
    }

    let points = ring
        .iter()
        .map(|(lat, lng)| {
            validate_coordinates(*lat, *lng)?;
            Ok(format!("({}, {})", lng, lat))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(format!("({})", points.join(", ")))
}

/// Parse an ISO-8601 date string
pub fn parse_iso_date(iso: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(iso)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| AdapterError::invalid_json(format!("invalid date '{}': {}", iso, e)))
}

/// Format a timestamp the way documents carry it (millisecond precision, `Z`)
pub fn format_iso_date(date: &DateTime<Utc>) -> String {
    date.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Convert a document value into a bound parameter
///
/// Typed values are reduced to their column representation; plain arrays and
/// objects are bound as jsonb.
pub fn to_param(value: &Value) -> Result<SqlParam> {
    Ok(match value {
        Value::Null => SqlParam::Null,
        Value::Bool(b) => SqlParam::Bool(*b),
        Value::Number(n) => SqlParam::Float(n.as_f64().unwrap_or_default()),
        Value::String(s) => SqlParam::Text(s.clone()),
        Value::Object(map) => match type_tag(value) {
            Some("Date") => {
                let iso = map.get("iso").and_then(Value::as_str).ok_or_else(|| {
                    AdapterError::invalid_json(format!("bad Date value: {}", value))
                })?;
                SqlParam::Timestamp(parse_iso_date(iso)?)
            }
            Some("Pointer") => SqlParam::Text(object_id(value)?),
            Some("File") => SqlParam::Text(
                map.get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            ),
            _ => SqlParam::Json(value.clone()),
        },
        Value::Array(_) => SqlParam::Json(value.clone()),
    })
}

/// Bound timestamp for a Date value or a bare ISO string
pub fn date_param(value: &Value) -> Result<SqlParam> {
    match value {
        Value::String(iso) => Ok(SqlParam::Timestamp(parse_iso_date(iso)?)),
        _ => to_param(value),
    }
}

/// objectId of a Pointer value
pub fn object_id(value: &Value) -> Result<String> {
    value
        .get("objectId")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AdapterError::invalid_json(format!("bad Pointer value: {}", value)))
}

/// Cast type for comparing a nested JSON text value against `value`
pub fn cast_type_for(value: &Value) -> Option<&'static str> {
    match value {
        Value::Number(_) => Some("double precision"),
        Value::Bool(_) => Some("boolean"),
        _ => None,
    }
}

/// Resolve a relative time such as `"in 2 days"`, `"3 hours ago"` or `"now"`
pub fn relative_time_to_date(text: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let text = text.to_lowercase();
    let mut parts: Vec<&str> = text.split(' ').filter(|p| !p.is_empty()).collect();

    let future = parts.first() == Some(&"in");
    let past = parts.last() == Some(&"ago");

    if !future && !past && text != "now" {
        return Err(AdapterError::invalid_json(
            "Time should either start with 'in' or end with 'ago'",
        ));
    }
    if future && past {
        return Err(AdapterError::invalid_json(
            "Time cannot have both 'in' and 'ago'",
        ));
    }

    if future {
        parts.remove(0);
    } else if past {
        parts.pop();
    }

    if parts.len() % 2 != 0 {
        return Err(AdapterError::invalid_json(
            "Invalid time string. Dangling unit or number.",
        ));
    }

    let mut seconds: i64 = 0;
    for pair in parts.chunks(2) {
        let (number, interval) = (pair[0], pair[1]);
        let amount: i64 = number
            .parse()
            .map_err(|_| AdapterError::invalid_json(format!("'{}' is not an integer.", number)))?;
        let unit = match interval {
            "yr" | "yrs" | "year" | "years" => 31_536_000,
            "wk" | "wks" | "week" | "weeks" => 604_800,
            "d" | "day" | "days" => 86_400,
            "hr" | "hrs" | "hour" | "hours" => 3_600,
            "min" | "mins" | "minute" | "minutes" => 60,
            "sec" | "secs" | "second" | "seconds" => 1,
            other => {
                return Err(AdapterError::invalid_json(format!(
                    "Invalid interval: '{}'",
                    other
                )));
            }
        };
        seconds = amount
            .checked_mul(unit)
            .and_then(|delta| seconds.checked_add(delta))
            .ok_or_else(out_of_range)?;
    }

    let offset = Duration::try_seconds(seconds).ok_or_else(out_of_range)?;
    if future {
        now.checked_add_signed(offset).ok_or_else(out_of_range)
    } else if past {
        now.checked_sub_signed(offset).ok_or_else(out_of_range)
    } else {
        Ok(now)
    }
}

fn out_of_range() -> AdapterError {
    AdapterError::invalid_json("Relative time is out of range")
}
