//! Whole-file snapshots of the storage database, with JSON sidecars and age-based retention.

use crate::error::EngineError;
use crate::storage::StorageEngine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SNAPSHOT_EXT: &str = "sqlite3";
const SIDECAR_EXT: &str = "json";

/// What happens when the engine cannot be snapshotted (no backing file).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupPolicy {
    /// Structural operations fail with a backup error.
    #[default]
    Required,
    /// Structural operations proceed with a warning.
    BestEffort,
}

impl std::str::FromStr for BackupPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "required" => Ok(BackupPolicy::Required),
            "best_effort" => Ok(BackupPolicy::BestEffort),
            other => Err(format!("unknown backup policy: {}", other)),
        }
    }
}

/// Sidecar metadata written next to every snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    #[serde(default)]
    pub entity_name: Option<String>,
    pub source_path: PathBuf,
    pub backup_path: PathBuf,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SnapshotOutcome {
    Created(BackupRecord),
    /// The storage engine has no backing file.
    Unsupported,
}

#[derive(Clone, Debug, Serialize)]
pub struct RestoreReport {
    pub restored_from: PathBuf,
    pub safety_backup: Option<PathBuf>,
}

#[derive(Clone, Debug, Serialize)]
pub struct BackupStatus {
    pub directory: PathBuf,
    pub count: usize,
    pub total_bytes: u64,
    pub retention_days: u32,
    pub latest: Vec<BackupRecord>,
}

pub struct BackupManager {
    storage: Arc<dyn StorageEngine>,
    dir: PathBuf,
    retention_days: u32,
    policy: BackupPolicy,
}

impl BackupManager {
    pub fn new(storage: Arc<dyn StorageEngine>, dir: impl Into<PathBuf>, retention_days: u32, policy: BackupPolicy) -> Self {
        BackupManager {
            storage,
            dir: dir.into(),
            retention_days,
            policy,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub fn policy(&self) -> BackupPolicy {
        self.policy
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    /// Copy the whole storage file to `{label}[_{entity}]_{timestamp}.sqlite3` plus a `.json` sidecar.
    /// Expired snapshots are cleaned up first; cleanup failures are logged only.
    pub async fn snapshot(&self, label: &str, entity: Option<&str>) -> Result<SnapshotOutcome, EngineError> {
        if self.storage.database_path().is_some() {
            if let Err(e) = self.cleanup(self.retention_days).await {
                tracing::warn!(error = %e, "backup cleanup failed");
            }
        }
        self.write_snapshot(label, entity).await
    }

    async fn write_snapshot(&self, label: &str, entity: Option<&str>) -> Result<SnapshotOutcome, EngineError> {
        let Some(source) = self.storage.database_path() else {
            tracing::warn!(operation = label, "storage is not file-based, snapshot unsupported");
            return Ok(SnapshotOutcome::Unsupported);
        };
        tokio::fs::create_dir_all(&self.dir).await?;

        let timestamp = Utc::now();
        let stem = snapshot_stem(label, entity, timestamp);
        let backup_path = self.dir.join(format!("{}.{}", stem, SNAPSHOT_EXT));
        let bytes = self
            .storage
            .copy_storage_file(&source, &backup_path)
            .await
            .map_err(|e| EngineError::Backup(format!("copy {} -> {}: {}", source.display(), backup_path.display(), e)))?;

        let record = BackupRecord {
            timestamp,
            operation: label.to_string(),
            entity_name: entity.map(str::to_string),
            source_path: source,
            backup_path: backup_path.clone(),
        };
        let sidecar = serde_json::to_vec_pretty(&record).map_err(|e| EngineError::Backup(e.to_string()))?;
        tokio::fs::write(sidecar_path(&backup_path), sidecar).await?;
        tracing::info!(operation = label, entity = ?entity, path = %backup_path.display(), bytes, "snapshot written");
        Ok(SnapshotOutcome::Created(record))
    }

    /// Snapshot ahead of a structural change, applying the backup policy to unsupported engines.
    pub async fn snapshot_before(&self, label: &str, entity: Option<&str>) -> Result<Option<BackupRecord>, EngineError> {
        match self.snapshot(label, entity).await? {
            SnapshotOutcome::Created(record) => Ok(Some(record)),
            SnapshotOutcome::Unsupported => match self.policy {
                BackupPolicy::Required => Err(EngineError::Backup(
                    "storage engine is not file-based; snapshot unsupported".into(),
                )),
                BackupPolicy::BestEffort => {
                    tracing::warn!(operation = label, entity = ?entity, "proceeding without snapshot");
                    Ok(None)
                }
            },
        }
    }

    /// All readable sidecar records, newest first.
    pub async fn list(&self) -> Result<Vec<BackupRecord>, EngineError> {
        let mut records = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SIDECAR_EXT) {
                continue;
            }
            match read_sidecar(&path).await {
                Ok(r) => records.push(r),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "unreadable backup sidecar"),
            }
        }
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(records)
    }

    /// Replace the live database with `path`. A safety snapshot of the current state is taken first;
    /// a missing target fails before anything is touched. No retention cleanup runs here, so an
    /// expired target is still restorable.
    pub async fn restore(&self, path: &Path) -> Result<RestoreReport, EngineError> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(EngineError::Restore(format!("backup not found: {}", path.display())));
        }
        let Some(live) = self.storage.database_path() else {
            return Err(EngineError::Restore("storage engine is not file-based".into()));
        };
        let safety = match self.write_snapshot("pre_restore", None).await {
            Ok(SnapshotOutcome::Created(r)) => Some(r.backup_path),
            Ok(SnapshotOutcome::Unsupported) => None,
            Err(e) => return Err(EngineError::Restore(format!("safety snapshot failed: {}", e))),
        };

        self.storage.close_all_connections().await;
        let copied = self.storage.copy_storage_file(path, &live).await;
        for suffix in ["-wal", "-shm", "-journal"] {
            let mut stale = live.clone().into_os_string();
            stale.push(suffix);
            let _ = tokio::fs::remove_file(PathBuf::from(stale)).await;
        }
        let reconnected = self.storage.reconnect().await;
        copied.map_err(|e| EngineError::Restore(format!("copy {}: {}", path.display(), e)))?;
        reconnected.map_err(|e| EngineError::Restore(format!("reconnect: {}", e)))?;

        tracing::info!(from = %path.display(), safety = ?safety, "database restored");
        Ok(RestoreReport {
            restored_from: path.to_path_buf(),
            safety_backup: safety,
        })
    }

    /// Delete snapshots and sidecars older than `retention_days`. Snapshot files without a readable
    /// sidecar are aged by modification time. Returns the number of snapshots removed.
    pub async fn cleanup(&self, retention_days: u32) -> Result<usize, EngineError> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(SIDECAR_EXT) => {
                    let Ok(record) = read_sidecar(&path).await else { continue };
                    if record.timestamp < cutoff {
                        let snapshot = path.with_extension(SNAPSHOT_EXT);
                        let _ = tokio::fs::remove_file(&snapshot).await;
                        if record.backup_path != snapshot {
                            let _ = tokio::fs::remove_file(&record.backup_path).await;
                        }
                        tokio::fs::remove_file(&path).await?;
                        removed += 1;
                    }
                }
                Some(SNAPSHOT_EXT) => {
                    if tokio::fs::try_exists(sidecar_path(&path)).await.unwrap_or(false) {
                        continue;
                    }
                    // Gone already when its sidecar was processed earlier in this pass.
                    let Ok(meta) = entry.metadata().await else { continue };
                    let modified = meta.modified()?;
                    if DateTime::<Utc>::from(modified) < cutoff && tokio::fs::remove_file(&path).await.is_ok() {
                        removed += 1;
                    }
                }
                _ => {}
            }
        }
        if removed > 0 {
            tracing::info!(removed, retention_days, "expired backups removed");
        }
        Ok(removed)
    }

    pub async fn status(&self) -> Result<BackupStatus, EngineError> {
        let records = self.list().await?;
        let mut total_bytes = 0;
        for r in &records {
            if let Ok(meta) = tokio::fs::metadata(&r.backup_path).await {
                total_bytes += meta.len();
            }
        }
        Ok(BackupStatus {
            directory: self.dir.clone(),
            count: records.len(),
            total_bytes,
            retention_days: self.retention_days,
            latest: records.into_iter().take(5).collect(),
        })
    }
}

fn snapshot_stem(label: &str, entity: Option<&str>, at: DateTime<Utc>) -> String {
    let ts = at.format("%Y%m%d_%H%M%S_%6f");
    match entity {
        Some(e) => format!("{}_{}_{}", sanitize(label), sanitize(e), ts),
        None => format!("{}_{}", sanitize(label), ts),
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

fn sidecar_path(snapshot: &Path) -> PathBuf {
    snapshot.with_extension(SIDECAR_EXT)
}

async fn read_sidecar(path: &Path) -> Result<BackupRecord, EngineError> {
    let bytes = tokio::fs::read(path).await?;
    serde_json::from_slice(&bytes).map_err(|e| EngineError::Backup(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn stem_carries_label_entity_and_timestamp() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(snapshot_stem("update", Some("Invoice"), at), "update_Invoice_20240309_140507_000000");
        assert_eq!(snapshot_stem("pre restore", None, at), "pre_restore_20240309_140507_000000");
    }

    #[test]
    fn policy_parses() {
        assert_eq!("best-effort".parse::<BackupPolicy>().unwrap(), BackupPolicy::BestEffort);
        assert_eq!("REQUIRED".parse::<BackupPolicy>().unwrap(), BackupPolicy::Required);
        assert!("sometimes".parse::<BackupPolicy>().is_err());
    }
}
