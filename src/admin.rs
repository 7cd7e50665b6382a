//! Administrative operations over definitions, tables and backups. Every call reports an
//! `AdminOutcome`; errors are turned into failed outcomes and logged.

use crate::backup::{BackupManager, SnapshotOutcome};
use crate::definition::{DefinitionStore, EntityDefinition};
use crate::error::EngineError;
use crate::migration::{MigrationApplier, MigrationReport};
use crate::registry::{LoadReport, RuntimeRegistry};
use crate::schema::{ExternalCatalog, Resolution};
use crate::storage::StorageEngine;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Clone, Debug, Serialize)]
pub struct AdminOutcome {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<PathBuf>,
    /// Listing payload for read-only operations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl AdminOutcome {
    fn ok(message: impl Into<String>) -> Self {
        AdminOutcome {
            success: true,
            message: message.into(),
            backup: None,
            details: None,
        }
    }

    fn failed(message: impl Into<String>, backup: Option<PathBuf>) -> Self {
        let message = message.into();
        tracing::warn!(message = %message, backup = ?backup, "admin operation failed");
        AdminOutcome {
            success: false,
            message,
            backup,
            details: None,
        }
    }

    fn from_error(e: EngineError) -> Self {
        let backup = e.backup_path().map(Path::to_path_buf);
        Self::failed(e.to_string(), backup)
    }

    fn with_backup(mut self, backup: Option<PathBuf>) -> Self {
        self.backup = backup;
        self
    }

    fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

pub struct AdminService {
    storage: Arc<dyn StorageEngine>,
    definitions: Arc<DefinitionStore>,
    registry: Arc<RuntimeRegistry>,
    backups: Arc<BackupManager>,
    migrations: Arc<MigrationApplier>,
    externals: Arc<ExternalCatalog>,
}

impl AdminService {
    pub fn new(
        storage: Arc<dyn StorageEngine>,
        definitions: Arc<DefinitionStore>,
        registry: Arc<RuntimeRegistry>,
        backups: Arc<BackupManager>,
        migrations: Arc<MigrationApplier>,
        externals: Arc<ExternalCatalog>,
    ) -> Self {
        AdminService {
            storage,
            definitions,
            registry,
            backups,
            migrations,
            externals,
        }
    }

    async fn definition(&self, id: i64) -> Result<EntityDefinition, AdminOutcome> {
        match self.definitions.get_entity(id).await {
            Ok(Some(def)) => Ok(def),
            Ok(None) => Err(AdminOutcome::failed(format!("entity definition {} not found", id), None)),
            Err(e) => Err(AdminOutcome::from_error(e)),
        }
    }

    pub async fn create_entity_table(&self, definition_id: i64) -> AdminOutcome {
        let def = match self.definition(definition_id).await {
            Ok(d) => d,
            Err(outcome) => return outcome,
        };
        match self.migrations.create(&def).await {
            Ok(report) => AdminOutcome::ok(format!(
                "table '{}' created for entity '{}'",
                def.storage_name, def.name
            ))
            .with_backup(report.backup.clone())
            .with_details(report_details(&report)),
            Err(e) => AdminOutcome::from_error(e),
        }
    }

    pub async fn update_entity_table(&self, definition_id: i64) -> AdminOutcome {
        let def = match self.definition(definition_id).await {
            Ok(d) => d,
            Err(outcome) => return outcome,
        };
        match self.migrations.update(&def).await {
            Ok(report) => AdminOutcome::ok(update_message(&def, &report))
                .with_backup(report.backup.clone())
                .with_details(report_details(&report)),
            Err(e) => AdminOutcome::from_error(e),
        }
    }

    /// Snapshot labelled `drop`, then drop the table and its join tables.
    pub async fn drop_entity_table(&self, definition_id: i64) -> AdminOutcome {
        let def = match self.definition(definition_id).await {
            Ok(d) => d,
            Err(outcome) => return outcome,
        };
        let backup = match self.backups.snapshot_before("drop", Some(&def.name)).await {
            Ok(record) => record.map(|r| r.backup_path),
            Err(e) => return AdminOutcome::from_error(e),
        };
        match self.migrations.drop_entity(&def).await {
            Ok(_) => AdminOutcome::ok(format!("table '{}' dropped for entity '{}'", def.storage_name, def.name))
                .with_backup(backup),
            Err(e) => AdminOutcome::from_error(e.with_backup(backup.as_deref())),
        }
    }

    pub async fn list_backups(&self) -> AdminOutcome {
        match self.backups.list().await {
            Ok(records) => AdminOutcome::ok(format!("{} backups", records.len())).with_details(json!(records)),
            Err(e) => AdminOutcome::from_error(e),
        }
    }

    pub async fn create_backup(&self, label: &str, entity: Option<&str>) -> AdminOutcome {
        match self.backups.snapshot(label, entity).await {
            Ok(SnapshotOutcome::Created(record)) => {
                AdminOutcome::ok(format!("backup created: {}", record.backup_path.display()))
                    .with_backup(Some(record.backup_path.clone()))
                    .with_details(json!(record))
            }
            Ok(SnapshotOutcome::Unsupported) => {
                AdminOutcome::failed("storage engine is not file-based; backups unsupported", None)
            }
            Err(e) => AdminOutcome::from_error(e),
        }
    }

    /// Restore `path`, then rebuild the registry from the restored definitions.
    pub async fn restore_backup(&self, path: &Path) -> AdminOutcome {
        let report = match self.backups.restore(path).await {
            Ok(r) => r,
            Err(e) => return AdminOutcome::from_error(e),
        };
        match self.reload().await {
            Ok(load) => AdminOutcome::ok(format!(
                "restored from {}; {} entities loaded",
                report.restored_from.display(),
                load.loaded.len()
            ))
            .with_backup(report.safety_backup.clone())
            .with_details(json!({ "restore": report, "registry": load })),
            Err(e) => AdminOutcome::failed(
                format!("restored from {} but registry reload failed: {}", path.display(), e),
                report.safety_backup,
            ),
        }
    }

    pub async fn cleanup_backups(&self, retention_days: u32) -> AdminOutcome {
        match self.backups.cleanup(retention_days).await {
            Ok(removed) => AdminOutcome::ok(format!(
                "{} backups older than {} days removed",
                removed, retention_days
            ))
            .with_details(json!({ "removed": removed })),
            Err(e) => AdminOutcome::from_error(e),
        }
    }

    pub async fn backup_status(&self) -> AdminOutcome {
        match self.backups.status().await {
            Ok(status) => AdminOutcome::ok(format!("{} backups, {} bytes", status.count, status.total_bytes))
                .with_details(json!(status)),
            Err(e) => AdminOutcome::from_error(e),
        }
    }

    /// Registered entities with their columns and relation states.
    pub async fn schema_overview(&self) -> AdminOutcome {
        let snapshot = self.registry.snapshot();
        let mut names: Vec<&String> = snapshot.keys().collect();
        names.sort();
        let entities: Vec<Value> = names
            .into_iter()
            .map(|name| {
                let d = &snapshot[name];
                let relations: Vec<Value> = d
                    .relations
                    .iter()
                    .map(|r| {
                        json!({
                            "field": r.field_name,
                            "kind": r.kind,
                            "target": r.resolution.target_name(),
                            "state": match r.resolution {
                                Resolution::Resolved(_) => "resolved",
                                Resolution::Forward(_) => "forward",
                            },
                            "join_table": r.join_table.as_ref().map(|j| j.name.clone()),
                        })
                    })
                    .collect();
                json!({
                    "name": d.name,
                    "storage_name": d.storage_name,
                    "columns": d.columns,
                    "relations": relations,
                })
            })
            .collect();
        AdminOutcome::ok(format!("{} entities registered", entities.len()))
            .with_details(json!({ "version": self.registry.version(), "entities": entities }))
    }

    /// Rebuild the registry from persisted definitions.
    pub async fn reload(&self) -> Result<LoadReport, EngineError> {
        let defs = self.definitions.list_entities().await?;
        self.registry
            .load_all(&defs, self.storage.as_ref(), &self.externals)
            .await
    }
}

fn update_message(def: &EntityDefinition, report: &MigrationReport) -> String {
    let mut message = if report.created {
        format!("table '{}' did not exist and was created", def.storage_name)
    } else if report.is_noop() {
        format!("table '{}' is up to date", def.storage_name)
    } else {
        let mut parts = Vec::new();
        if !report.added.is_empty() {
            parts.push(format!("added columns: {}", report.added.join(", ")));
        }
        if !report.join_tables_created.is_empty() {
            parts.push(format!("created join tables: {}", report.join_tables_created.join(", ")));
        }
        format!("table '{}' updated; {}", def.storage_name, parts.join("; "))
    };
    if !report.skipped_drops.is_empty() {
        message.push_str(&format!("; columns left in place: {}", report.skipped_drops.join(", ")));
    }
    message
}

fn report_details(report: &MigrationReport) -> Value {
    json!(report)
}
