//! Persisted entity/field definitions: types, validation, storage and change events.

pub mod events;
pub mod store;
pub mod types;
pub mod validator;

pub use events::{DefinitionEvent, DefinitionObserver, EventKind, SnapshotBeforeDelete};
pub use store::{ensure_sys_tables, DefinitionStore, EntityChanges};
pub use types::*;
