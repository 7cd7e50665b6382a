//! Typed definition-store events and explicit subscribers.

use crate::backup::BackupManager;
use crate::definition::EntityDefinition;
use crate::error::EngineError;
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    AfterSave,
    BeforeDelete,
}

/// One change to persisted metadata. `field` is set for field-scoped changes.
#[derive(Clone, Debug)]
pub struct DefinitionEvent {
    pub kind: EventKind,
    pub entity: EntityDefinition,
    pub field: Option<String>,
}

impl DefinitionEvent {
    pub fn after_save(entity: EntityDefinition, field: Option<String>) -> Self {
        DefinitionEvent {
            kind: EventKind::AfterSave,
            entity,
            field,
        }
    }

    pub fn before_delete(entity: EntityDefinition, field: Option<String>) -> Self {
        DefinitionEvent {
            kind: EventKind::BeforeDelete,
            entity,
            field,
        }
    }
}

/// Subscriber registered on the definition store. An error from a `BeforeDelete` handler aborts
/// the delete; `AfterSave` errors are logged.
#[async_trait]
pub trait DefinitionObserver: Send + Sync {
    async fn on_event(&self, event: &DefinitionEvent) -> Result<(), EngineError>;
}

/// Takes a snapshot before entity or field metadata is removed.
pub struct SnapshotBeforeDelete {
    backups: Arc<BackupManager>,
}

impl SnapshotBeforeDelete {
    pub fn new(backups: Arc<BackupManager>) -> Self {
        SnapshotBeforeDelete { backups }
    }
}

#[async_trait]
impl DefinitionObserver for SnapshotBeforeDelete {
    async fn on_event(&self, event: &DefinitionEvent) -> Result<(), EngineError> {
        if event.kind != EventKind::BeforeDelete {
            return Ok(());
        }
        let label = if event.field.is_some() { "field_delete" } else { "entity_delete" };
        self.backups
            .snapshot_before(label, Some(&event.entity.name))
            .await?;
        Ok(())
    }
}
