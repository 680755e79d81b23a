//! Entity-side values.
//!
//! A row coming from (or going to) the database is a JSON map ([`Row`]) holding
//! the storage representation of each column. Columns cast those raw values into
//! [`Value`]s, which is what entity constructors and assignments receive.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::entity::HydrationError;

pub type Json = serde_json::Value;

/// Storage representation of a row: column name -> raw value
pub type Row = serde_json::Map<String, Json>;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    String(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Array(Vec<Json>),
    Object(Row),
    DateTime(DateTime<Utc>),
    /// Cast values of a nested entity
    Entity(Values),
    /// Case name of a backed or unit enum
    Enum(&'static str),
    Custom(CustomValue),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn from_enum<T: EnumColumn>(value: &T) -> Self {
        Value::Enum(value.case_name())
    }

    pub fn custom<T: Castable>(value: T) -> Self {
        Value::Custom(CustomValue::new(value))
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::String(_) => "string",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::DateTime(_) => "datetime",
            Value::Entity(_) => "entity",
            Value::Enum(_) => "enum",
            Value::Custom(_) => "custom",
        }
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<Vec<Json>> for Value {
    fn from(value: Vec<Json>) -> Self {
        Value::Array(value)
    }
}

impl From<Row> for Value {
    fn from(value: Row) -> Self {
        Value::Object(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::DateTime(value)
    }
}

impl From<Values> for Value {
    fn from(value: Values) -> Self {
        Value::Entity(value)
    }
}

impl From<CustomValue> for Value {
    fn from(value: CustomValue) -> Self {
        Value::Custom(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// Conversion from a cast [`Value`] into a typed entity field.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self, String>;
}

fn unexpected<T>(expected: &str, value: &Value) -> Result<T, String> {
    Err(format!("expected {expected}, got {}", value.kind()))
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self, String> {
        Ok(value)
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::String(s) => Ok(s),
            other => unexpected("string", &other),
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::Integer(i) => Ok(i),
            other => unexpected("integer", &other),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: Value) -> Result<Self, String> {
        let wide = i64::from_value(value)?;
        i32::try_from(wide).map_err(|e| e.to_string())
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::Float(f) => Ok(f),
            Value::Integer(i) => Ok(i as f64),
            other => unexpected("float", &other),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::Bool(b) => Ok(b),
            other => unexpected("bool", &other),
        }
    }
}

impl FromValue for Vec<Json> {
    fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::Array(items) => Ok(items),
            other => unexpected("array", &other),
        }
    }
}

impl FromValue for Row {
    fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::Object(map) => Ok(map),
            other => unexpected("object", &other),
        }
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::DateTime(dt) => Ok(dt),
            other => unexpected("datetime", &other),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

/// Backing value of an enum case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    Int(i64),
    Str(&'static str),
}

impl Backing {
    pub fn to_json(self) -> Json {
        match self {
            Backing::Int(i) => Json::from(i),
            Backing::Str(s) => Json::from(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnumCase {
    pub name: &'static str,
    pub backing: Option<Backing>,
}

impl EnumCase {
    pub const fn unit(name: &'static str) -> Self {
        Self {
            name,
            backing: None,
        }
    }

    pub const fn int(name: &'static str, value: i64) -> Self {
        Self {
            name,
            backing: Some(Backing::Int(value)),
        }
    }

    pub const fn str(name: &'static str, value: &'static str) -> Self {
        Self {
            name,
            backing: Some(Backing::Str(value)),
        }
    }
}

/// A Rust enum stored in a column. When every case declares a backing value the
/// column stores the backing value, otherwise it stores the case name.
pub trait EnumColumn: Sized + Send + Sync + 'static {
    const TYPE_NAME: &'static str;
    const CASES: &'static [EnumCase];

    fn case_name(&self) -> &'static str;

    fn from_case_name(name: &str) -> Option<Self>;

    fn is_backed() -> bool {
        !Self::CASES.is_empty() && Self::CASES.iter().all(|case| case.backing.is_some())
    }
}

/// Extension point for arbitrary value objects: the type itself knows how to turn
/// a raw column value into an instance and back.
pub trait Castable: Debug + Send + Sync + 'static {
    const TYPE_NAME: &'static str;

    fn cast(raw: &Json) -> Result<Self, String>
    where
        Self: Sized;

    fn uncast(&self) -> Json;
}

trait ErasedCastable: Debug + Send + Sync {
    fn type_name(&self) -> &'static str;
    fn uncast(&self) -> Json;
    fn as_any(&self) -> &dyn Any;
}

impl<T: Castable> ErasedCastable for T {
    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn uncast(&self) -> Json {
        Castable::uncast(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Type-erased instance of a [`Castable`]
#[derive(Debug, Clone)]
pub struct CustomValue(Arc<dyn ErasedCastable>);

impl CustomValue {
    pub fn new<T: Castable>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn type_name(&self) -> &'static str {
        self.0.type_name()
    }

    pub fn uncast(&self) -> Json {
        self.0.uncast()
    }

    pub fn downcast_ref<T: Castable>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }
}

impl PartialEq for CustomValue {
    fn eq(&self, other: &Self) -> bool {
        self.type_name() == other.type_name() && self.uncast() == other.uncast()
    }
}

/// Cast values keyed by column name, as handed to entity constructors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Values(BTreeMap<String, Value>);

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.0.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Remove a column and convert it into a typed field. An absent column reads
    /// as null, so `Option<T>` fields may be omitted entirely.
    pub fn take<T: FromValue>(&mut self, name: &str) -> Result<T, HydrationError> {
        match self.0.remove(name) {
            Some(value) => T::from_value(value).map_err(|reason| {
                HydrationError::InvalidValue {
                    column: name.to_string(),
                    reason,
                }
            }),
            None => T::from_value(Value::Null).map_err(|_| HydrationError::MissingValue {
                column: name.to_string(),
            }),
        }
    }

    pub fn take_enum<T: EnumColumn>(&mut self, name: &str) -> Result<T, HydrationError> {
        self.take_optional_enum(name)?
            .ok_or_else(|| HydrationError::MissingValue {
                column: name.to_string(),
            })
    }

    pub fn take_optional_enum<T: EnumColumn>(
        &mut self,
        name: &str,
    ) -> Result<Option<T>, HydrationError> {
        match self.0.remove(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Enum(case)) => T::from_case_name(case).map(Some).ok_or_else(|| {
                HydrationError::InvalidValue {
                    column: name.to_string(),
                    reason: format!("{case:?} is not a case of {}", T::TYPE_NAME),
                }
            }),
            Some(other) => Err(HydrationError::InvalidValue {
                column: name.to_string(),
                reason: format!("expected enum, got {}", other.kind()),
            }),
        }
    }

    pub fn take_custom<T: Castable + Clone>(&mut self, name: &str) -> Result<T, HydrationError> {
        self.take_optional_custom(name)?
            .ok_or_else(|| HydrationError::MissingValue {
                column: name.to_string(),
            })
    }

    pub fn take_optional_custom<T: Castable + Clone>(
        &mut self,
        name: &str,
    ) -> Result<Option<T>, HydrationError> {
        match self.0.remove(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Custom(custom)) => custom.downcast_ref::<T>().cloned().map(Some).ok_or_else(
                || HydrationError::InvalidValue {
                    column: name.to_string(),
                    reason: format!("expected {}, got {}", T::TYPE_NAME, custom.type_name()),
                },
            ),
            Some(other) => Err(HydrationError::InvalidValue {
                column: name.to_string(),
                reason: format!("expected {}, got {}", T::TYPE_NAME, other.kind()),
            }),
        }
    }
}

impl IntoIterator for Values {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<(String, Value)> for Values {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
