//! Column descriptors and the immutable per-entity [`Schema`].
//!
//! A schema is built exactly once per entity type (see [`SchemaRegistry`]) from the
//! explicit [`EntityDef`] metadata the type provides, and is the single source of
//! truth for converting between storage rows and entity values.

pub mod column;
pub mod definition;
pub mod registry;
pub mod value;

use std::collections::HashMap;

use itertools::Itertools;

pub use column::{Column, ColumnKind};
pub use definition::{EntityDef, FieldDef, FieldType, DELETED_AT, VERSION};
pub use registry::SchemaRegistry;
pub use value::{
    Backing, Castable, CustomValue, EnumCase, EnumColumn, FromValue, Json, Row, Value, Values,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("Entity {entity:?} declares a column with an empty name")]
    EmptyColumnName { entity: String },

    #[error("Entity {entity:?} declares column {column:?} more than once")]
    DuplicateColumn { entity: String, column: String },

    #[error("Entity {entity:?} declares more than one auto-increment column: {columns}")]
    MultipleAutoIncrement { entity: String, columns: String },

    #[error("Column {column:?} of entity {entity:?} has unsupported type {class:?}")]
    UnsupportedType {
        entity: String,
        column: String,
        class: String,
    },

    #[error("Entity {entity:?} nests itself")]
    RecursiveEntity { entity: String },

    #[error("Entity {entity:?} is not stored in a table")]
    NotATable { entity: String },

    #[error("Entity {entity:?} has no primary key")]
    MissingPrimaryKey { entity: String },

    #[error("Entity {entity:?} needs column {column:?}: {reason}")]
    CapabilityColumn {
        entity: String,
        column: String,
        reason: String,
    },
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("Cannot cast column {column:?}: {reason}")]
pub struct CastError {
    pub column: String,
    pub reason: String,
}

impl CastError {
    pub fn new(column: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug)]
pub struct Schema {
    pub entity: String,
    pub database: Option<String>,
    pub table: Option<String>,
    pub soft_delete: bool,
    pub optimistic_lock: bool,
    columns: Vec<Column>,
    index: HashMap<String, usize>,
}

impl Schema {
    /// Build the column descriptors of an entity. `resolve` maps a class type name
    /// to its column kind, returning `None` for unknown classes.
    pub fn build<F>(def: EntityDef, mut resolve: F) -> Result<Self, SchemaError>
    where
        F: FnMut(&'static str) -> Result<Option<ColumnKind>, SchemaError>,
    {
        let entity = def.name;
        let mut columns = Vec::with_capacity(def.fields.len());
        let mut index = HashMap::with_capacity(def.fields.len());

        for field in def.fields {
            if field.name.is_empty() {
                return Err(SchemaError::EmptyColumnName { entity });
            }
            if index.contains_key(&field.name) {
                return Err(SchemaError::DuplicateColumn {
                    entity,
                    column: field.name,
                });
            }

            let kind = match field.ty {
                FieldType::String => ColumnKind::String,
                FieldType::Integer => ColumnKind::Integer,
                FieldType::Float => ColumnKind::Float,
                FieldType::Bool => ColumnKind::Bool,
                FieldType::Array => ColumnKind::Array,
                FieldType::Object => ColumnKind::Object,
                FieldType::DateTime => ColumnKind::DateTime,
                FieldType::Class(class) => match resolve(class)? {
                    Some(kind) => kind,
                    None => {
                        return Err(SchemaError::UnsupportedType {
                            entity,
                            column: field.name,
                            class: class.to_string(),
                        })
                    }
                },
            };

            index.insert(field.name.clone(), columns.len());
            columns.push(Column {
                name: field.name,
                kind,
                nullable: field.nullable,
                default: field.default,
                read_only: field.read_only,
                constructor: field.constructor,
                strict: field.strict,
                primary_key: field.primary_key,
                auto_increment: field.auto_increment,
            });
        }

        let auto_increment: Vec<&str> = columns
            .iter()
            .filter(|c| c.auto_increment)
            .map(|c| c.name.as_str())
            .collect();
        if auto_increment.len() > 1 {
            return Err(SchemaError::MultipleAutoIncrement {
                columns: auto_increment.iter().join(", "),
                entity,
            });
        }

        let schema = Self {
            entity,
            database: def.database,
            table: def.table,
            soft_delete: def.soft_delete,
            optimistic_lock: def.optimistic_lock,
            columns,
            index,
        };

        if schema.soft_delete {
            schema.require_capability_column(DELETED_AT, |c| {
                matches!(c.kind, ColumnKind::DateTime) && c.nullable
            })?;
        }
        if schema.optimistic_lock {
            schema.require_capability_column(VERSION, |c| {
                matches!(c.kind, ColumnKind::Integer) && !c.nullable
            })?;
        }

        Ok(schema)
    }

    fn require_capability_column(
        &self,
        name: &str,
        valid: impl Fn(&Column) -> bool,
    ) -> Result<(), SchemaError> {
        let reason = match self.column(name) {
            None => "column is missing",
            Some(column) if !valid(column) => match name {
                DELETED_AT => "must be a nullable datetime",
                _ => "must be a non-nullable integer",
            },
            Some(_) => return Ok(()),
        };
        Err(SchemaError::CapabilityColumn {
            entity: self.entity.clone(),
            column: name.to_string(),
            reason: reason.to_string(),
        })
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.index.get(name).map(|i| &self.columns[*i])
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn primary_keys(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    pub fn auto_increment(&self) -> Option<&Column> {
        self.columns.iter().find(|c| c.auto_increment)
    }

    /// Cast every key of a storage row that names a column. Unknown keys (computed
    /// columns, joins) are ignored.
    pub fn cast_row(&self, row: &Row) -> Result<Values, CastError> {
        let mut values = Values::new();
        for (name, raw) in row {
            if let Some(column) = self.column(name) {
                values.insert(name.clone(), column.cast(raw)?);
            }
        }
        Ok(values)
    }

    /// Serialize entity values in column order; columns without a value are null.
    pub fn uncast_values(&self, values: &Values) -> Row {
        self.columns
            .iter()
            .map(|column| {
                let raw = values
                    .get(&column.name)
                    .map_or(Json::Null, |value| column.uncast(value));
                (column.name.clone(), raw)
            })
            .collect()
    }
}
