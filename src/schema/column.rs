use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

use super::value::{Backing, Castable, CustomValue, EnumCase, Json, Value};
use super::{CastError, Schema};

/// Placeholder strings some databases store for "no date". They cast to null so
/// a non-nullable datetime column can still represent "unset".
pub const DATETIME_SENTINELS: &[&str] = &[
    "",
    "0000-00-00",
    "0000-00-00 00:00:00",
    "0000-00-00 00:00:00.000000",
    "0000-00-00T00:00:00Z",
];

pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Erased cast function of a [`Castable`] type
#[derive(Debug, Clone, Copy)]
pub struct CastableCodec {
    pub type_name: &'static str,
    cast: fn(&Json) -> Result<CustomValue, String>,
}

impl CastableCodec {
    pub fn of<T: Castable>() -> Self {
        Self {
            type_name: T::TYPE_NAME,
            cast: |raw| T::cast(raw).map(CustomValue::new),
        }
    }

    pub fn cast(&self, raw: &Json) -> Result<CustomValue, String> {
        (self.cast)(raw)
    }
}

#[derive(Debug, Clone)]
pub enum ColumnKind {
    String,
    Integer,
    Float,
    Bool,
    Array,
    Object,
    DateTime,
    Entity(Arc<Schema>),
    BackedEnum {
        type_name: &'static str,
        cases: &'static [EnumCase],
    },
    UnitEnum {
        type_name: &'static str,
        cases: &'static [EnumCase],
    },
    Castable(CastableCodec),
}

impl ColumnKind {
    /// Convert a non-null storage value into its entity representation
    pub fn cast(&self, raw: &Json) -> Result<Value, String> {
        match self {
            ColumnKind::String => match raw {
                Json::String(s) => Ok(Value::String(s.clone())),
                Json::Number(n) => Ok(Value::String(n.to_string())),
                Json::Bool(b) => Ok(Value::String(b.to_string())),
                other => Err(format!("cannot cast {other} to string")),
            },
            ColumnKind::Integer => cast_integer(raw).map(Value::Integer),
            ColumnKind::Float => cast_float(raw).map(Value::Float),
            ColumnKind::Bool => Ok(Value::Bool(cast_bool(raw))),
            ColumnKind::Array => match decode_json(raw)? {
                Json::Array(items) => Ok(Value::Array(items)),
                other => Err(format!("expected a JSON array, got {other}")),
            },
            ColumnKind::Object => match decode_json(raw)? {
                Json::Object(map) => Ok(Value::Object(map)),
                other => Err(format!("expected a JSON object, got {other}")),
            },
            ColumnKind::DateTime => cast_datetime(raw),
            ColumnKind::Entity(schema) => match decode_json(raw)? {
                Json::Object(row) => schema
                    .cast_row(&row)
                    .map(Value::Entity)
                    .map_err(|e| e.to_string()),
                other => Err(format!(
                    "expected a JSON object for {}, got {other}",
                    schema.entity
                )),
            },
            ColumnKind::BackedEnum { type_name, cases } => cast_backed_enum(raw, type_name, cases),
            ColumnKind::UnitEnum { type_name, cases } => {
                let name = raw.as_str().unwrap_or_default();
                cases
                    .iter()
                    .find(|case| case.name == name)
                    .map(|case| Value::Enum(case.name))
                    .ok_or_else(|| format!("{raw} is not a case of {type_name}"))
            }
            ColumnKind::Castable(codec) => codec.cast(raw).map(Value::Custom),
        }
    }

    /// Convert an entity value into its storage representation
    pub fn uncast(&self, value: &Value) -> Json {
        match (self, value) {
            (_, Value::Null) => Json::Null,
            (ColumnKind::Array, Value::Array(items)) => {
                Json::String(Json::Array(items.clone()).to_string())
            }
            (ColumnKind::Object, Value::Object(map)) => {
                Json::String(Json::Object(map.clone()).to_string())
            }
            (ColumnKind::Entity(schema), Value::Entity(values)) => {
                Json::String(Json::Object(schema.uncast_values(values)).to_string())
            }
            (ColumnKind::BackedEnum { cases, .. }, Value::Enum(name)) => cases
                .iter()
                .find(|case| case.name == *name)
                .and_then(|case| case.backing)
                .map_or_else(|| Json::from(*name), Backing::to_json),
            (_, other) => plain_json(other),
        }
    }
}

fn plain_json(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::String(s) => Json::from(s.as_str()),
        Value::Integer(i) => Json::from(*i),
        // NaN and infinities have no JSON form
        Value::Float(f) => serde_json::Number::from_f64(*f).map_or(Json::Null, Json::Number),
        Value::Bool(b) => Json::Bool(*b),
        Value::Array(items) => Json::Array(items.clone()),
        Value::Object(map) => Json::Object(map.clone()),
        Value::DateTime(dt) => Json::from(dt.format(DATETIME_FORMAT).to_string()),
        Value::Entity(values) => Json::Object(
            values
                .iter()
                .map(|(name, value)| (name.clone(), plain_json(value)))
                .collect(),
        ),
        Value::Enum(name) => Json::from(*name),
        Value::Custom(custom) => custom.uncast(),
    }
}

fn decode_json(raw: &Json) -> Result<Json, String> {
    match raw {
        Json::String(s) => serde_json::from_str(s).map_err(|e| format!("invalid JSON: {e}")),
        other => Ok(other.clone()),
    }
}

fn cast_integer(raw: &Json) -> Result<i64, String> {
    match raw {
        Json::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| format!("{n} out of integer range")),
        Json::String(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<i64>()
                .or_else(|_| trimmed.parse::<f64>().map(|f| f as i64))
                .map_err(|_| format!("{s:?} is not numeric"))
        }
        Json::Bool(b) => Ok(i64::from(*b)),
        other => Err(format!("cannot cast {other} to integer")),
    }
}

fn cast_float(raw: &Json) -> Result<f64, String> {
    match raw {
        Json::Number(n) => n.as_f64().ok_or_else(|| format!("{n} is not a float")),
        Json::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("{s:?} is not numeric")),
        Json::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        other => Err(format!("cannot cast {other} to float")),
    }
}

fn cast_bool(raw: &Json) -> bool {
    match raw {
        Json::Bool(b) => *b,
        Json::String(s) if s.eq_ignore_ascii_case("false") => false,
        Json::String(s) if s.eq_ignore_ascii_case("true") => true,
        Json::String(s) => !s.is_empty() && s != "0",
        Json::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Json::Array(items) => !items.is_empty(),
        Json::Object(map) => !map.is_empty(),
        Json::Null => false,
    }
}

fn cast_datetime(raw: &Json) -> Result<Value, String> {
    match raw {
        Json::String(s) if DATETIME_SENTINELS.contains(&s.trim()) => Ok(Value::Null),
        Json::String(s) => parse_datetime(s.trim())
            .map(Value::DateTime)
            .ok_or_else(|| format!("{s:?} is not a recognised datetime")),
        Json::Number(n) => {
            let timestamp = if let Some(secs) = n.as_i64() {
                Utc.timestamp_opt(secs, 0).single()
            } else {
                n.as_f64().and_then(|f| {
                    let secs = f.trunc() as i64;
                    let nanos = ((f - f.trunc()) * 1e9).round() as u32;
                    Utc.timestamp_opt(secs, nanos).single()
                })
            };
            timestamp
                .map(Value::DateTime)
                .ok_or_else(|| format!("{n} is not a valid unix timestamp"))
        }
        other => Err(format!("cannot cast {other} to datetime")),
    }
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, DATETIME_FORMAT) {
        return Some(naive.and_utc());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn cast_backed_enum(
    raw: &Json,
    type_name: &str,
    cases: &'static [EnumCase],
) -> Result<Value, String> {
    let exact = cases.iter().find(|case| match (case.backing, raw) {
        (Some(Backing::Str(backing)), Json::String(s)) => backing == s,
        (Some(Backing::Int(backing)), Json::Number(n)) => n.as_i64() == Some(backing),
        _ => false,
    });
    if let Some(case) = exact {
        return Ok(Value::Enum(case.name));
    }

    // Numeric backings also accept numeric strings and integral floats
    let numeric = match raw {
        Json::String(s) => s.trim().parse::<i64>().ok(),
        Json::Number(n) => n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64),
        _ => None,
    };
    numeric
        .and_then(|wanted| {
            cases
                .iter()
                .find(|case| case.backing == Some(Backing::Int(wanted)))
        })
        .map(|case| Value::Enum(case.name))
        .ok_or_else(|| format!("{raw} is not a backing value of {type_name}"))
}

/// One field's cast/uncast behaviour and constraints
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
    pub nullable: bool,
    pub default: Option<Value>,
    pub read_only: bool,
    pub constructor: bool,
    pub strict: bool,
    pub primary_key: bool,
    pub auto_increment: bool,
}

impl Column {
    /// Cast a raw storage value, applying the column's strictness policy on failure:
    /// strict columns propagate the error, others fall back to the default value,
    /// then to null when nullable.
    pub fn cast(&self, raw: &Json) -> Result<Value, CastError> {
        let attempt = match raw {
            Json::Null if self.nullable => return Ok(Value::Null),
            Json::Null => Err("null in a non-nullable column".to_string()),
            raw => self.kind.cast(raw),
        };

        match attempt {
            Ok(value) => Ok(value),
            Err(reason) if self.strict => Err(CastError::new(&self.name, reason)),
            Err(reason) => {
                if let Some(default) = &self.default {
                    Ok(default.clone())
                } else if self.nullable {
                    Ok(Value::Null)
                } else {
                    Err(CastError::new(&self.name, reason))
                }
            }
        }
    }

    pub fn uncast(&self, value: &Value) -> Json {
        self.kind.uncast(value)
    }
}
