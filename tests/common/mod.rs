#![allow(dead_code)]

use dynamic_entities::{Engine, EngineSettings, EntityDefinition, NewEntity, StorageEngine};
use std::path::PathBuf;
use tempfile::TempDir;

/// Engine over a fresh SQLite file; the directory lives as long as the value.
pub struct TestEngine {
    pub engine: Engine,
    pub dir: TempDir,
}

impl TestEngine {
    pub fn database_path(&self) -> PathBuf {
        self.dir.path().join("app.sqlite3")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.dir.path().join("backups")
    }

    pub async fn define(&self, entity: NewEntity) -> EntityDefinition {
        self.engine.definitions.create_entity(entity).await.unwrap()
    }

    pub async fn column_names(&self, table: &str) -> Vec<String> {
        self.engine
            .storage
            .introspect_columns(table)
            .await
            .unwrap()
            .unwrap_or_default()
            .into_iter()
            .map(|c| c.name)
            .collect()
    }
}

pub fn settings_in(dir: &TempDir) -> EngineSettings {
    EngineSettings {
        database: dir.path().join("app.sqlite3").to_string_lossy().into_owned(),
        backup_dir: dir.path().join("backups"),
        ..EngineSettings::default()
    }
}

pub async fn file_engine() -> TestEngine {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(&settings_in(&dir)).await.unwrap();
    TestEngine { engine, dir }
}
