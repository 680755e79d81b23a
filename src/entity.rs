//! Entity lifecycle: hydration from storage rows and snapshot-based change tracking.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::schema::{
    CastError, Column, EntityDef, FieldDef, Json, Row, Schema, Value, Values, DELETED_AT, VERSION,
};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum HydrationError {
    #[error(transparent)]
    Cast(#[from] CastError),

    #[error("No value for constructor column {column:?}")]
    MissingValue { column: String },

    #[error("Invalid value for column {column:?}: {reason}")]
    InvalidValue { column: String, reason: String },

    #[error("Entity has no assignable column {column:?}")]
    UnknownColumn { column: String },

    #[error("Malformed entity data: {reason}")]
    Malformed { reason: String },
}

/// A typed record mapped to one table row.
///
/// Implementations describe themselves once through [`Entity::definition`]; the
/// remaining methods move cast [`Values`] in and out of the struct.
pub trait Entity: Clone + std::fmt::Debug + Send + Sync + 'static {
    fn definition() -> EntityDef;

    /// Build an instance from the constructor columns. Every other field starts
    /// at its Rust default and is filled in through [`Entity::assign`].
    fn construct(values: &mut Values) -> Result<Self, HydrationError>;

    /// Set a non-constructor column. Also used for read-only columns, so this is
    /// the privileged write path and not meant for application code.
    fn assign(&mut self, column: &str, _value: Value) -> Result<(), HydrationError> {
        Err(HydrationError::UnknownColumn {
            column: column.to_string(),
        })
    }

    /// Current value of every column
    fn values(&self) -> Values;
}

struct Slot<'a> {
    name: &'a str,
    constructor: bool,
    nullable: bool,
    default: Option<&'a Value>,
}

impl<'a> From<&'a Column> for Slot<'a> {
    fn from(column: &'a Column) -> Self {
        Self {
            name: &column.name,
            constructor: column.constructor,
            nullable: column.nullable,
            default: column.default.as_ref(),
        }
    }
}

impl<'a> From<&'a FieldDef> for Slot<'a> {
    fn from(field: &'a FieldDef) -> Self {
        Self {
            name: &field.name,
            constructor: field.constructor,
            nullable: field.nullable,
            default: field.default.as_ref(),
        }
    }
}

fn hydrate_slots<'a, E: Entity>(
    mut values: Values,
    slots: impl IntoIterator<Item = Slot<'a>>,
) -> Result<E, HydrationError> {
    let mut constructor = Values::new();
    let mut assignments = vec![];

    for slot in slots {
        let value = match (values.remove(slot.name), slot.default) {
            (Some(value), _) => Some(value),
            (None, Some(default)) => Some(default.clone()),
            (None, None) if slot.constructor && slot.nullable => Some(Value::Null),
            (None, None) if slot.constructor => {
                return Err(HydrationError::MissingValue {
                    column: slot.name.to_string(),
                })
            }
            (None, None) => None,
        };

        match (value, slot.constructor) {
            (Some(value), true) => constructor.insert(slot.name, value),
            (Some(value), false) => assignments.push((slot.name, value)),
            (None, _) => {}
        }
    }

    let mut entity = E::construct(&mut constructor)?;
    for (name, value) in assignments {
        entity.assign(name, value)?;
    }
    Ok(entity)
}

/// Build an entity from already cast values
pub fn hydrate<E: Entity>(schema: &Schema, values: Values) -> Result<E, HydrationError> {
    hydrate_slots(values, schema.columns().iter().map(Slot::from))
}

impl Values {
    /// Remove a nested entity column and hydrate it
    pub fn take_entity<E: Entity>(&mut self, name: &str) -> Result<E, HydrationError> {
        self.take_optional_entity(name)?
            .ok_or_else(|| HydrationError::MissingValue {
                column: name.to_string(),
            })
    }

    pub fn take_optional_entity<E: Entity>(
        &mut self,
        name: &str,
    ) -> Result<Option<E>, HydrationError> {
        match self.remove(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Entity(values)) => {
                let def = E::definition();
                hydrate_slots(values, def.fields.iter().map(Slot::from)).map(Some)
            }
            Some(other) => Err(HydrationError::InvalidValue {
                column: name.to_string(),
                reason: format!("expected a nested {}, got {other:?}", E::definition().name),
            }),
        }
    }
}

/// An entity together with its change-tracking snapshot.
///
/// No snapshot means the entity is new (never persisted). Field access goes
/// through `Deref`/`DerefMut` to the wrapped entity.
#[derive(Debug, Clone)]
pub struct Tracked<E: Entity> {
    entity: E,
    schema: Arc<Schema>,
    snapshot: Option<Row>,
}

impl<E: Entity> Tracked<E> {
    pub fn new(schema: Arc<Schema>, entity: E) -> Self {
        Self {
            entity,
            schema,
            snapshot: None,
        }
    }

    /// Cast a storage row, construct the entity and snapshot it as persisted
    pub fn from_row(schema: Arc<Schema>, row: &Row) -> Result<Self, HydrationError> {
        let values = schema.cast_row(row)?;
        let entity = hydrate(&schema, values)?;
        let mut tracked = Self::new(schema, entity);
        tracked.reset_changed_columns();
        Ok(tracked)
    }

    pub fn from_json(schema: Arc<Schema>, data: &Json) -> Result<Self, HydrationError> {
        match data {
            Json::Object(row) => Self::from_row(schema, row),
            other => Err(HydrationError::Malformed {
                reason: format!("expected an object, got {other}"),
            }),
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn is_new(&self) -> bool {
        self.snapshot.is_none()
    }

    /// Storage representation of every column. The auto-increment column is left
    /// out while the entity is new.
    pub fn to_row(&self) -> Row {
        let mut row = self.schema.uncast_values(&self.entity.values());
        if self.is_new() {
            if let Some(column) = self.schema.auto_increment() {
                row.shift_remove(&column.name);
            }
        }
        row
    }

    /// Columns whose storage value differs from the snapshot; everything for a new entity
    pub fn changed_columns(&self) -> Row {
        let row = self.to_row();
        match &self.snapshot {
            None => row,
            Some(snapshot) => row
                .into_iter()
                .filter(|(name, value)| snapshot.get(name) != Some(value))
                .collect(),
        }
    }

    /// Snapshot every column, the auto-increment one included, and mark the
    /// entity as persisted
    pub fn reset_changed_columns(&mut self) {
        self.snapshot = Some(self.schema.uncast_values(&self.entity.values()));
    }

    /// Persisted value of a column, null while new
    pub fn old_value(&self, column: &str) -> Json {
        self.snapshot
            .as_ref()
            .and_then(|snapshot| snapshot.get(column))
            .cloned()
            .unwrap_or(Json::Null)
    }

    pub(crate) fn snapshot(&self) -> Option<&Row> {
        self.snapshot.as_ref()
    }

    pub fn is_deleted(&self) -> bool {
        self.schema.soft_delete
            && self
                .entity
                .values()
                .get(DELETED_AT)
                .map_or(false, |value| !value.is_null())
    }

    pub fn version(&self) -> Option<i64> {
        if !self.schema.optimistic_lock {
            return None;
        }
        match self.entity.values().get(VERSION) {
            Some(Value::Integer(version)) => Some(*version),
            _ => None,
        }
    }

    /// Privileged assignment used by the persistence engine (generated ids,
    /// version counters, deletion markers)
    pub(crate) fn assign(&mut self, column: &str, value: Value) -> Result<(), HydrationError> {
        self.entity.assign(column, value)
    }

    pub fn entity(&self) -> &E {
        &self.entity
    }

    pub fn into_inner(self) -> E {
        self.entity
    }
}

impl<E: Entity> Deref for Tracked<E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.entity
    }
}

impl<E: Entity> DerefMut for Tracked<E> {
    fn deref_mut(&mut self) -> &mut E {
        &mut self.entity
    }
}
