//! Runtime settings from the environment (`DYNAMIC_ENTITIES_*`).

use crate::backup::BackupPolicy;
use std::path::PathBuf;

pub const DEFAULT_RETENTION_DAYS: u32 = 7;
pub const DEFAULT_BIND: &str = "0.0.0.0:3000";

#[derive(Clone, Debug, PartialEq)]
pub struct EngineSettings {
    /// SQLite file path, or `:memory:`.
    pub database: String,
    pub backup_dir: PathBuf,
    pub backup_retention_days: u32,
    pub backup_policy: BackupPolicy,
    pub bind: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            database: "dynamic_entities.sqlite3".into(),
            backup_dir: PathBuf::from("backups"),
            backup_retention_days: DEFAULT_RETENTION_DAYS,
            backup_policy: BackupPolicy::Required,
            bind: DEFAULT_BIND.into(),
        }
    }
}

impl EngineSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unparseable values fall back to the default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut s = EngineSettings::default();
        if let Some(v) = lookup("DYNAMIC_ENTITIES_DATABASE").filter(|v| !v.trim().is_empty()) {
            s.database = v;
        }
        if let Some(v) = lookup("DYNAMIC_ENTITIES_BACKUP_DIR").filter(|v| !v.trim().is_empty()) {
            s.backup_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("DYNAMIC_ENTITIES_BACKUP_RETENTION_DAYS") {
            match v.trim().parse() {
                Ok(days) => s.backup_retention_days = days,
                Err(_) => tracing::warn!(value = %v, "invalid backup retention, using default"),
            }
        }
        if let Some(v) = lookup("DYNAMIC_ENTITIES_BACKUP_POLICY") {
            match v.parse() {
                Ok(policy) => s.backup_policy = policy,
                Err(e) => tracing::warn!(error = %e, "invalid backup policy, using default"),
            }
        }
        if let Some(v) = lookup("DYNAMIC_ENTITIES_BIND").filter(|v| !v.trim().is_empty()) {
            s.bind = v;
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_when_unset() {
        let s = EngineSettings::from_lookup(|_| None);
        assert_eq!(s, EngineSettings::default());
        assert_eq!(s.backup_retention_days, 7);
        assert_eq!(s.backup_policy, BackupPolicy::Required);
    }

    #[test]
    fn reads_overrides_and_ignores_garbage() {
        let env: HashMap<&str, &str> = [
            ("DYNAMIC_ENTITIES_DATABASE", ":memory:"),
            ("DYNAMIC_ENTITIES_BACKUP_POLICY", "best-effort"),
            ("DYNAMIC_ENTITIES_BACKUP_RETENTION_DAYS", "soon"),
        ]
        .into_iter()
        .collect();
        let s = EngineSettings::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(s.database, ":memory:");
        assert_eq!(s.backup_policy, BackupPolicy::BestEffort);
        assert_eq!(s.backup_retention_days, DEFAULT_RETENTION_DAYS);
    }
}
