//! Bootstrap: open storage, ensure metadata tables, wire the services and load the registry.

use crate::admin::AdminService;
use crate::backup::BackupManager;
use crate::definition::DefinitionStore;
use crate::error::EngineError;
use crate::migration::{MigrationApplier, RegistryEviction};
use crate::registry::{LoadReport, RuntimeRegistry};
use crate::schema::ExternalCatalog;
use crate::settings::EngineSettings;
use crate::storage::{SqliteStorage, StorageEngine};
use std::sync::Arc;

#[derive(Clone)]
pub struct Engine {
    pub storage: Arc<dyn StorageEngine>,
    pub definitions: Arc<DefinitionStore>,
    pub registry: Arc<RuntimeRegistry>,
    pub backups: Arc<BackupManager>,
    pub migrations: Arc<MigrationApplier>,
    pub admin: Arc<AdminService>,
    pub externals: Arc<ExternalCatalog>,
}

impl Engine {
    /// Open the database named in `settings` with the default external allow-list.
    pub async fn open(settings: &EngineSettings) -> Result<Self, EngineError> {
        let storage = SqliteStorage::open(&settings.database).await?;
        Self::with_storage(Arc::new(storage), settings, ExternalCatalog::default()).await
    }

    pub async fn with_storage(
        storage: Arc<dyn StorageEngine>,
        settings: &EngineSettings,
        externals: ExternalCatalog,
    ) -> Result<Self, EngineError> {
        let externals = Arc::new(externals);
        let definitions = Arc::new(DefinitionStore::open(Arc::clone(&storage)).await?);
        let registry = Arc::new(RuntimeRegistry::new());
        let backups = Arc::new(BackupManager::new(
            Arc::clone(&storage),
            settings.backup_dir.clone(),
            settings.backup_retention_days,
            settings.backup_policy,
        ));
        let migrations = Arc::new(MigrationApplier::new(
            Arc::clone(&storage),
            Arc::clone(&registry),
            Arc::clone(&backups),
            Arc::clone(&definitions),
            Arc::clone(&externals),
        ));
        definitions.subscribe(Arc::new(RegistryEviction::new(&migrations)));
        let admin = Arc::new(AdminService::new(
            Arc::clone(&storage),
            Arc::clone(&definitions),
            Arc::clone(&registry),
            Arc::clone(&backups),
            Arc::clone(&migrations),
            Arc::clone(&externals),
        ));
        let engine = Engine {
            storage,
            definitions,
            registry,
            backups,
            migrations,
            admin,
            externals,
        };
        let report = engine.admin.reload().await?;
        if !report.failed.is_empty() {
            tracing::warn!(failed = ?report.failed, "some entities could not be loaded");
        }
        Ok(engine)
    }

    pub async fn reload(&self) -> Result<LoadReport, EngineError> {
        self.admin.reload().await
    }
}
