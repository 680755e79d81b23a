use crate::schema::{Schema, SchemaError};

/// Storage identity and write behaviour of one table, derived once from its schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableConfig {
    pub connection_name: String,
    pub table_name: String,
    pub entity: String,
    pub primary_keys: Vec<String>,
    pub auto_increment: Option<String>,
    pub soft_delete: bool,
    pub optimistic_lock: bool,
}

impl TableConfig {
    pub fn from_schema(schema: &Schema) -> Result<Self, SchemaError> {
        let (Some(connection_name), Some(table_name)) = (&schema.database, &schema.table) else {
            return Err(SchemaError::NotATable {
                entity: schema.entity.clone(),
            });
        };

        let primary_keys: Vec<String> = schema
            .primary_keys()
            .into_iter()
            .map(str::to_string)
            .collect();
        if primary_keys.is_empty() {
            return Err(SchemaError::MissingPrimaryKey {
                entity: schema.entity.clone(),
            });
        }

        Ok(Self {
            connection_name: connection_name.clone(),
            table_name: table_name.clone(),
            entity: schema.entity.clone(),
            primary_keys,
            auto_increment: schema.auto_increment().map(|c| c.name.clone()),
            soft_delete: schema.soft_delete,
            optimistic_lock: schema.optimistic_lock,
        })
    }
}
