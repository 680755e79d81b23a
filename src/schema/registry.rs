use std::any::TypeId;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::entity::Entity;

use super::column::{CastableCodec, ColumnKind};
use super::definition::EntityDef;
use super::value::{Castable, EnumCase, EnumColumn};
use super::{Schema, SchemaError};

#[derive(Debug, Clone)]
enum ClassCapability {
    Entity {
        type_id: TypeId,
        definition: fn() -> EntityDef,
    },
    Enum {
        type_name: &'static str,
        cases: &'static [EnumCase],
        backed: bool,
    },
    Castable(CastableCodec),
}

/// Memoized schemas keyed by entity type, plus the capability table that
/// resolves class-typed fields (nested entities, enums, castables).
///
/// Schemas are built on first use and never rebuilt; the registry is owned by
/// the composition root ([`PersistenceContext`](crate::context::PersistenceContext)).
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: DashMap<TypeId, Arc<Schema>>,
    classes: DashMap<String, ClassCapability>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `E` resolvable as a nested entity under its definition name
    pub fn register_entity<E: Entity>(&self) -> &Self {
        let name = E::definition().name;
        self.classes.insert(
            name,
            ClassCapability::Entity {
                type_id: TypeId::of::<E>(),
                definition: E::definition,
            },
        );
        self
    }

    pub fn register_enum<T: EnumColumn>(&self) -> &Self {
        self.classes.insert(
            T::TYPE_NAME.to_string(),
            ClassCapability::Enum {
                type_name: T::TYPE_NAME,
                cases: T::CASES,
                backed: T::is_backed(),
            },
        );
        self
    }

    pub fn register_castable<T: Castable>(&self) -> &Self {
        self.classes.insert(
            T::TYPE_NAME.to_string(),
            ClassCapability::Castable(CastableCodec::of::<T>()),
        );
        self
    }

    /// Schema of `E`, built on first request
    pub fn schema<E: Entity>(&self) -> Result<Arc<Schema>, SchemaError> {
        self.schema_by_id(TypeId::of::<E>(), E::definition, &mut vec![])
    }

    fn schema_by_id(
        &self,
        type_id: TypeId,
        definition: fn() -> EntityDef,
        building: &mut Vec<TypeId>,
    ) -> Result<Arc<Schema>, SchemaError> {
        if let Some(schema) = self.schemas.get(&type_id) {
            return Ok(schema.value().clone());
        }

        let def = definition();
        if building.contains(&type_id) {
            return Err(SchemaError::RecursiveEntity { entity: def.name });
        }

        debug!("Building schema for entity {:?}", def.name);
        building.push(type_id);
        let schema = Schema::build(def, |class| self.resolve(class, building));
        building.pop();

        // A concurrent build of the same type may have won; keep whichever landed first
        let schema = Arc::new(schema?);
        Ok(self.schemas.entry(type_id).or_insert(schema).value().clone())
    }

    fn resolve(
        &self,
        class: &str,
        building: &mut Vec<TypeId>,
    ) -> Result<Option<ColumnKind>, SchemaError> {
        // Clone out of the map so no shard lock is held across a nested build
        let capability = match self.classes.get(class) {
            Some(capability) => capability.clone(),
            None => return Ok(None),
        };

        let kind = match capability {
            ClassCapability::Entity {
                type_id,
                definition,
            } => ColumnKind::Entity(self.schema_by_id(type_id, definition, building)?),
            ClassCapability::Enum {
                type_name,
                cases,
                backed: true,
            } => ColumnKind::BackedEnum { type_name, cases },
            ClassCapability::Enum {
                type_name, cases, ..
            } => ColumnKind::UnitEnum { type_name, cases },
            ClassCapability::Castable(codec) => ColumnKind::Castable(codec),
        };
        Ok(Some(kind))
    }
}
