//! Entity definition -> EntityDescriptor. Publication into the registry is all-or-nothing.

use crate::definition::EntityDefinition;
use crate::error::{DefinitionError, EngineError};
use crate::registry::RuntimeRegistry;
use crate::schema::descriptor::{ColumnSpec, EntityDescriptor};
use crate::schema::resolver::{FieldTypeResolver, ResolveContext};
use std::collections::HashSet;
use std::sync::Arc;

pub struct EntitySynthesizer;

impl EntitySynthesizer {
    /// Build the descriptor: implicit primary key first, then one column/relation per field in
    /// declared order. The first failing field aborts the whole entity.
    pub fn synthesize(def: &EntityDefinition, ctx: &ResolveContext<'_>) -> Result<EntityDescriptor, EngineError> {
        let mut fields: Vec<_> = def.fields.iter().collect();
        fields.sort_by_key(|f| (f.position, f.id));

        let mut columns = vec![ColumnSpec::primary_key()];
        let mut relations = Vec::new();
        let mut seen: HashSet<String> = columns.iter().map(|c| c.name.clone()).collect();

        for field in fields {
            let resolved = FieldTypeResolver::resolve(&def.storage_name, field, ctx)?;
            if let Some(column) = resolved.column {
                if !seen.insert(column.name.clone()) {
                    return Err(DefinitionError::field(
                        &field.name,
                        format!("column '{}' is already produced by another field", column.name),
                    )
                    .into());
                }
                columns.push(column);
            }
            if let Some(relation) = resolved.relation {
                relations.push(relation);
            }
        }

        Ok(EntityDescriptor {
            name: def.name.clone(),
            storage_name: def.storage_name.clone(),
            columns,
            relations,
        })
    }

    /// Synthesize and publish, replacing any prior descriptor and its cached accessor.
    pub fn install(
        def: &EntityDefinition,
        ctx: &ResolveContext<'_>,
        registry: &RuntimeRegistry,
    ) -> Result<Arc<EntityDescriptor>, EngineError> {
        let descriptor = Self::synthesize(def, ctx)?;
        Ok(registry.register(descriptor))
    }
}
