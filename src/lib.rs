//! Dynamic entities: metadata-defined entity schemas materialized as live SQLite tables at runtime,
//! with additive migrations, whole-file backups and generic record access.

pub mod admin;
pub mod backup;
pub mod case;
pub mod definition;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod migration;
pub mod registry;
pub mod response;
pub mod routes;
pub mod schema;
pub mod service;
pub mod settings;
pub mod sql;
pub mod state;
pub mod storage;

pub use admin::{AdminOutcome, AdminService};
pub use backup::{BackupManager, BackupPolicy, BackupRecord};
pub use definition::{
    DefinitionEvent, DefinitionObserver, DefinitionStore, EntityChanges, EntityDefinition, EventKind, FieldDefinition,
    FieldType, NewEntity, NewField, OnDeleteAction, SnapshotBeforeDelete,
};
pub use engine::Engine;
pub use error::{AppError, DefinitionError, EngineError};
pub use migration::{MigrationApplier, MigrationOperation, MigrationReport, RegistryEviction};
pub use registry::{EntityAccessor, RuntimeRegistry};
pub use response::{success_many, success_one};
pub use routes::{admin_routes, app, common_routes_with_ready, entity_routes};
pub use schema::{EntityDescriptor, ExternalCatalog, ExternalEntity, Resolution};
pub use service::{CrudService, RecordValidator};
pub use settings::EngineSettings;
pub use state::AppState;
pub use storage::{SqliteStorage, StorageEngine};
