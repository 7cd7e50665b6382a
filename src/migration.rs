//! Materialize entity definitions: create, update (additive only) and drop tables, keeping the
//! registry in step. Each operation holds the entity's lock from snapshot to registry swap.

use crate::backup::BackupManager;
use crate::definition::{DefinitionEvent, DefinitionObserver, DefinitionStore, EntityDefinition, EventKind};
use crate::error::EngineError;
use crate::registry::{EntityLocks, RuntimeRegistry};
use crate::schema::{
    EntityDescriptor, EntitySynthesizer, ExternalCatalog, JoinTableSpec, ResolveContext, SchemaDiff, SchemaDiffEngine,
    SchemaIntrospector, TableState,
};
use crate::storage::StorageEngine;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationOperation {
    Create,
    Update,
    Drop,
}

/// Outcome of one structural operation.
#[derive(Clone, Debug, Serialize)]
pub struct MigrationReport {
    pub entity: String,
    pub operation: MigrationOperation,
    /// Snapshot taken before the change, if any.
    pub backup: Option<PathBuf>,
    /// True when the table was created (including `update` on an absent table).
    pub created: bool,
    pub added: Vec<String>,
    pub join_tables_created: Vec<String>,
    /// Live columns no longer described; left in place.
    pub skipped_drops: Vec<String>,
}

impl MigrationReport {
    fn new(entity: &str, operation: MigrationOperation, backup: Option<PathBuf>) -> Self {
        MigrationReport {
            entity: entity.to_string(),
            operation,
            backup,
            created: false,
            added: Vec::new(),
            join_tables_created: Vec::new(),
            skipped_drops: Vec::new(),
        }
    }

    /// True when the operation issued no DDL.
    pub fn is_noop(&self) -> bool {
        !self.created && self.added.is_empty() && self.join_tables_created.is_empty() && self.operation != MigrationOperation::Drop
    }
}

pub struct MigrationApplier {
    storage: Arc<dyn StorageEngine>,
    registry: Arc<RuntimeRegistry>,
    backups: Arc<BackupManager>,
    definitions: Arc<DefinitionStore>,
    externals: Arc<ExternalCatalog>,
    locks: EntityLocks,
}

impl MigrationApplier {
    pub fn new(
        storage: Arc<dyn StorageEngine>,
        registry: Arc<RuntimeRegistry>,
        backups: Arc<BackupManager>,
        definitions: Arc<DefinitionStore>,
        externals: Arc<ExternalCatalog>,
    ) -> Self {
        MigrationApplier {
            storage,
            registry,
            backups,
            definitions,
            externals,
            locks: EntityLocks::new(),
        }
    }

    pub fn registry(&self) -> &Arc<RuntimeRegistry> {
        &self.registry
    }

    /// Snapshot "create", synthesize, CREATE TABLE, publish. Fails if the table exists.
    pub async fn create(&self, def: &EntityDefinition) -> Result<MigrationReport, EngineError> {
        ensure_active(def)?;
        let _guard = self.locks.lock(&def.name).await;
        let backup = self.backups.snapshot_before("create", Some(&def.name)).await?.map(|r| r.backup_path);
        self.create_locked(def, MigrationOperation::Create, backup.clone())
            .await
            .map_err(|e| e.with_backup(backup.as_deref()))
    }

    /// Snapshot "update"; create when absent, otherwise add missing columns and join tables in one
    /// transaction. Columns no longer described are reported as skipped, never dropped.
    pub async fn update(&self, def: &EntityDefinition) -> Result<MigrationReport, EngineError> {
        ensure_active(def)?;
        let _guard = self.locks.lock(&def.name).await;
        let backup = self.backups.snapshot_before("update", Some(&def.name)).await?.map(|r| r.backup_path);
        self.update_locked(def, backup.clone())
            .await
            .map_err(|e| e.with_backup(backup.as_deref()))
    }

    /// DROP TABLE and its join tables, then unregister. Takes no snapshot; callers wanting one take it first.
    pub async fn drop_entity(&self, def: &EntityDefinition) -> Result<MigrationReport, EngineError> {
        let _guard = self.locks.lock(&def.name).await;
        if !self.storage.table_exists(&def.storage_name).await? {
            return Err(EngineError::MigrationApply(format!(
                "table '{}' for entity '{}' does not exist",
                def.storage_name, def.name
            )));
        }
        let join_tables = self.join_tables_for(def).await;
        self.storage
            .drop_table(&def.storage_name, &join_tables)
            .await
            .map_err(|e| EngineError::MigrationApply(format!("drop table '{}': {}", def.storage_name, e)))?;
        self.registry.unregister(&def.name);
        tracing::info!(entity = %def.name, table = %def.storage_name, "table dropped");
        self.refresh_dependents(&def.name).await;
        Ok(MigrationReport::new(&def.name, MigrationOperation::Drop, None))
    }

    /// Desired-vs-live diff without applying anything. Absent tables diff against nothing.
    pub async fn plan(&self, def: &EntityDefinition) -> Result<SchemaDiff, EngineError> {
        let desired = self.synthesize(def).await?;
        let live = SchemaIntrospector::inspect(self.storage.as_ref(), &def.storage_name).await?;
        let tables = self.storage.table_names().await?;
        Ok(SchemaDiffEngine::diff(live.columns(), &desired, &tables))
    }

    async fn create_locked(
        &self,
        def: &EntityDefinition,
        operation: MigrationOperation,
        backup: Option<PathBuf>,
    ) -> Result<MigrationReport, EngineError> {
        if self.storage.table_exists(&def.storage_name).await? {
            return Err(EngineError::MigrationApply(format!(
                "table '{}' for entity '{}' already exists",
                def.storage_name, def.name
            )));
        }
        let descriptor = self.synthesize(def).await?;
        self.storage
            .create_table(&descriptor)
            .await
            .map_err(|e| EngineError::MigrationApply(format!("create table '{}': {}", def.storage_name, e)))?;
        let join_tables_created = descriptor.join_tables().map(|j| j.name.clone()).collect();
        let added = descriptor.columns.iter().map(|c| c.name.clone()).collect();
        self.registry.register(descriptor);
        tracing::info!(entity = %def.name, table = %def.storage_name, "table created");
        self.refresh_dependents(&def.name).await;

        let mut report = MigrationReport::new(&def.name, operation, backup);
        report.created = true;
        report.added = added;
        report.join_tables_created = join_tables_created;
        Ok(report)
    }

    async fn update_locked(&self, def: &EntityDefinition, backup: Option<PathBuf>) -> Result<MigrationReport, EngineError> {
        let live = SchemaIntrospector::inspect(self.storage.as_ref(), &def.storage_name).await?;
        let TableState::Present(live_columns) = live else {
            tracing::info!(entity = %def.name, "table absent, creating instead of updating");
            return self.create_locked(def, MigrationOperation::Update, backup).await;
        };

        let desired = self.synthesize(def).await?;
        let tables = self.storage.table_names().await?;
        let diff = SchemaDiffEngine::diff(&live_columns, &desired, &tables);
        check_addable(&def.storage_name, &diff)?;

        let mut report = MigrationReport::new(&def.name, MigrationOperation::Update, backup);
        if diff.has_changes_to_apply() {
            self.storage
                .add_columns(&def.storage_name, &diff.to_add, &diff.missing_join_tables)
                .await
                .map_err(|e| EngineError::MigrationApply(format!("alter table '{}': {}", def.storage_name, e)))?;
            tracing::info!(
                entity = %def.name,
                added = ?diff.added_names(),
                join_tables = diff.missing_join_tables.len(),
                "table updated"
            );
        }
        if !diff.to_drop.is_empty() {
            tracing::warn!(entity = %def.name, columns = ?diff.to_drop, "column drops skipped");
        }
        report.added = diff.added_names();
        report.join_tables_created = diff.missing_join_tables.iter().map(|j| j.name.clone()).collect();
        report.skipped_drops = diff.to_drop;
        self.registry.register(desired);
        Ok(report)
    }

    async fn synthesize(&self, def: &EntityDefinition) -> Result<EntityDescriptor, EngineError> {
        let mut targets = self.definitions.active_targets().await?;
        targets.insert(def.name.clone(), def.storage_name.clone());
        let materialized = self.registry.snapshot();
        let ctx = ResolveContext {
            externals: &self.externals,
            materialized: &materialized,
            definitions: &targets,
        };
        EntitySynthesizer::synthesize(def, &ctx)
    }

    async fn join_tables_for(&self, def: &EntityDefinition) -> Vec<JoinTableSpec> {
        if let Some(d) = self.registry.get(&def.name) {
            return d.join_tables().cloned().collect();
        }
        match self.synthesize(def).await {
            Ok(d) => d.join_tables().cloned().collect(),
            Err(e) => {
                tracing::warn!(entity = %def.name, error = %e, "join tables unknown, dropping main table only");
                Vec::new()
            }
        }
    }

    /// Take an entity out of generic access after its definition is deactivated or deleted. The
    /// table is left alone; dependents are re-resolved against what remains.
    pub async fn evict(&self, name: &str) {
        let _guard = self.locks.lock(name).await;
        if self.registry.unregister(name).is_some() {
            tracing::info!(entity = %name, "entity removed from registry");
            self.refresh_dependents(name).await;
        }
    }

    /// Re-synthesize registered entities that point at `target` so their resolution follows its
    /// materialization. Descriptors stay limited to the live columns. Failures keep the previous
    /// descriptor.
    async fn refresh_dependents(&self, target: &str) {
        let dependents = self.registry.dependents_of(target);
        if dependents.is_empty() {
            return;
        }
        let targets: HashMap<String, String> = match self.definitions.active_targets().await {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(error = %e, "cannot refresh dependents");
                return;
            }
        };
        let tables = match self.storage.table_names().await {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(error = %e, "cannot refresh dependents");
                return;
            }
        };
        for name in dependents {
            let def = match self.definitions.get_entity_by_name(&name).await {
                Ok(Some(d)) if d.active => d,
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(entity = %name, error = %e, "cannot load dependent definition");
                    continue;
                }
            };
            let live = match SchemaIntrospector::inspect(self.storage.as_ref(), &def.storage_name).await {
                Ok(live) => live,
                Err(e) => {
                    tracing::warn!(entity = %name, error = %e, "dependent re-resolution failed");
                    continue;
                }
            };
            let materialized = self.registry.snapshot();
            let ctx = ResolveContext {
                externals: &self.externals,
                materialized: &materialized,
                definitions: &targets,
            };
            match EntitySynthesizer::synthesize(&def, &ctx) {
                Ok(d) => {
                    let (d, pending) = d.restrict_to_live(live.columns(), &tables);
                    if !pending.is_empty() {
                        tracing::debug!(entity = %name, fields = ?pending, "fields not yet applied");
                    }
                    self.registry.register(d);
                    tracing::debug!(entity = %name, target, "dependent re-resolved");
                }
                Err(e) => tracing::warn!(entity = %name, error = %e, "dependent re-resolution failed"),
            }
        }
    }
}

/// Keeps the registry limited to active definitions: an entity is evicted when its definition is
/// deactivated or about to be deleted. Subscribed by `Engine`.
pub struct RegistryEviction {
    migrations: Weak<MigrationApplier>,
}

impl RegistryEviction {
    pub fn new(migrations: &Arc<MigrationApplier>) -> Self {
        RegistryEviction {
            migrations: Arc::downgrade(migrations),
        }
    }
}

#[async_trait]
impl DefinitionObserver for RegistryEviction {
    async fn on_event(&self, event: &DefinitionEvent) -> Result<(), EngineError> {
        if event.field.is_some() {
            return Ok(());
        }
        let evict = match event.kind {
            EventKind::AfterSave => !event.entity.active,
            EventKind::BeforeDelete => true,
        };
        if !evict {
            return Ok(());
        }
        if let Some(migrations) = self.migrations.upgrade() {
            migrations.evict(&event.entity.name).await;
        }
        Ok(())
    }
}

fn ensure_active(def: &EntityDefinition) -> Result<(), EngineError> {
    if def.active {
        Ok(())
    } else {
        Err(EngineError::MigrationApply(format!("entity '{}' is inactive", def.name)))
    }
}

/// SQLite cannot add a NOT NULL column without a default to an existing table.
fn check_addable(table: &str, diff: &SchemaDiff) -> Result<(), EngineError> {
    for c in &diff.to_add {
        if c.primary_key {
            return Err(EngineError::MigrationApply(format!(
                "table '{}' has no primary key column '{}'",
                table, c.name
            )));
        }
        if !c.nullable && c.default.is_none() {
            return Err(EngineError::MigrationApply(format!(
                "cannot add required column '{}' without a default to existing table '{}'",
                c.name, table
            )));
        }
    }
    Ok(())
}
