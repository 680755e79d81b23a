//! Explicit per-entity metadata, consumed once by [`Schema::build`](super::Schema::build).

use super::value::Value;

pub const DELETED_AT: &str = "deleted_at";
pub const VERSION: &str = "version";

/// Declared semantic type of a field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Float,
    Bool,
    Array,
    Object,
    DateTime,
    /// A named class type, resolved through the schema registry's capability
    /// table (nested entity, backed/unit enum or castable)
    Class(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub ty: FieldType,
    pub nullable: bool,
    pub default: Option<Value>,
    pub read_only: bool,
    pub constructor: bool,
    pub strict: bool,
    pub primary_key: bool,
    pub auto_increment: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: false,
            default: None,
            read_only: false,
            constructor: false,
            strict: false,
            primary_key: false,
            auto_increment: false,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::String)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Integer)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Float)
    }

    pub fn bool(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Bool)
    }

    pub fn array(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Array)
    }

    pub fn object(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Object)
    }

    pub fn datetime(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::DateTime)
    }

    pub fn class(name: impl Into<String>, class: &'static str) -> Self {
        Self::new(name, FieldType::Class(class))
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Value is passed to the entity constructor rather than assigned afterwards
    pub fn constructor(mut self) -> Self {
        self.constructor = true;
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Primary key generated by the database. Implies `primary_key`.
    pub fn auto_increment(mut self) -> Self {
        self.primary_key = true;
        self.auto_increment = true;
        self
    }
}

/// Metadata describing one entity type: its storage location, its fields in
/// declaration order and its optional capabilities.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDef {
    pub name: String,
    pub database: Option<String>,
    pub table: Option<String>,
    pub fields: Vec<FieldDef>,
    pub soft_delete: bool,
    pub optimistic_lock: bool,
}

impl EntityDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            database: None,
            table: None,
            fields: vec![],
            soft_delete: false,
            optimistic_lock: false,
        }
    }

    /// Entities without a storage location can only be nested inside others.
    pub fn stored_in(mut self, database: impl Into<String>, table: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self.table = Some(table.into());
        self
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Rows carry a nullable `deleted_at` timestamp instead of being removed
    pub fn soft_delete(mut self) -> Self {
        self.soft_delete = true;
        self
    }

    /// Rows carry an integer `version` counter checked on every update
    pub fn optimistic_lock(mut self) -> Self {
        self.optimistic_lock = true;
        self
    }
}
