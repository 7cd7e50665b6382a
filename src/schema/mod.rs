//! Schema synthesis: field resolution, descriptors, live introspection and diffing.

pub mod descriptor;
pub mod diff;
pub mod introspect;
pub mod resolver;
pub mod synthesizer;

pub use descriptor::{
    ColumnSpec, DefaultValue, EntityDescriptor, ExternalEntity, ForeignKey, JoinTableSpec, PhysicalType, RelationSpec,
    Resolution, ResolvedTarget, PK_COLUMN,
};
pub use diff::{SchemaDiff, SchemaDiffEngine};
pub use introspect::{LiveColumn, SchemaIntrospector, TableState};
pub use resolver::{ExternalCatalog, FieldTypeResolver, ResolveContext, ResolvedField};
pub use synthesizer::EntitySynthesizer;
