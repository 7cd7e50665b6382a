//! Process-wide entity name -> descriptor map. Descriptors are immutable and swapped whole, so readers
//! holding an `Arc` keep a consistent view while a structural change is published.

use crate::definition::EntityDefinition;
use crate::error::EngineError;
use crate::schema::{EntityDescriptor, EntitySynthesizer, ExternalCatalog, LiveColumn, ResolveContext, SchemaIntrospector};
use crate::sql;
use crate::storage::StorageEngine;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;

/// Generic record access for one descriptor: prebuilt SQL for the fixed-shape statements.
#[derive(Debug)]
pub struct EntityAccessor {
    pub descriptor: Arc<EntityDescriptor>,
    pub select_by_id: String,
    pub delete_by_id: String,
}

impl EntityAccessor {
    pub fn new(descriptor: Arc<EntityDescriptor>) -> Self {
        EntityAccessor {
            select_by_id: sql::select_by_id(&descriptor).sql,
            delete_by_id: sql::delete(&descriptor).sql,
            descriptor,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub not_materialized: Vec<String>,
    /// Entity -> fields saved but not yet applied to the live table.
    pub pending_fields: Vec<(String, Vec<String>)>,
    pub failed: Vec<(String, String)>,
}

#[derive(Default)]
pub struct RuntimeRegistry {
    entries: RwLock<HashMap<String, Arc<EntityDescriptor>>>,
    accessors: RwLock<HashMap<String, Arc<EntityAccessor>>>,
    version: AtomicU64,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<EntityDescriptor>>> {
        self.entries.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<EntityDescriptor>>> {
        self.entries.write().unwrap_or_else(|p| p.into_inner())
    }

    fn evict_accessor(&self, name: &str) {
        self.accessors
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(name);
    }

    /// Install or replace; any cached accessor for the name is evicted.
    pub fn register(&self, descriptor: EntityDescriptor) -> Arc<EntityDescriptor> {
        let descriptor = Arc::new(descriptor);
        let name = descriptor.name.clone();
        self.write().insert(name.clone(), Arc::clone(&descriptor));
        self.evict_accessor(&name);
        self.version.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(entity = %name, "descriptor registered");
        descriptor
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<EntityDescriptor>> {
        let removed = self.write().remove(name);
        self.evict_accessor(name);
        if removed.is_some() {
            self.version.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(entity = %name, "descriptor unregistered");
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<Arc<EntityDescriptor>> {
        self.read().get(name).cloned()
    }

    /// Cached accessor for the current descriptor, built on first use.
    pub fn accessor(&self, name: &str) -> Option<Arc<EntityAccessor>> {
        let descriptor = self.get(name)?;
        if let Some(a) = self.accessors.read().unwrap_or_else(|p| p.into_inner()).get(name) {
            if Arc::ptr_eq(&a.descriptor, &descriptor) {
                return Some(Arc::clone(a));
            }
        }
        let accessor = Arc::new(EntityAccessor::new(descriptor));
        self.accessors
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.to_string(), Arc::clone(&accessor));
        Some(accessor)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn snapshot(&self) -> HashMap<String, Arc<EntityDescriptor>> {
        self.read().clone()
    }

    /// Registered entities holding a relation (resolved or forward) to `target`.
    pub fn dependents_of(&self, target: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .read()
            .values()
            .filter(|d| d.name != target && d.references_entity(target))
            .map(|d| d.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Bumped on every register/unregister/reload.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Rebuild from the active definitions whose tables exist. Descriptors are limited to the live
    /// columns, so fields not yet applied stay out of generic access. Per-entity failures are logged
    /// and reported, never propagated. The new map is published in one swap.
    pub async fn load_all(
        &self,
        definitions: &[EntityDefinition],
        storage: &dyn StorageEngine,
        externals: &ExternalCatalog,
    ) -> Result<LoadReport, EngineError> {
        let tables = storage.table_names().await?;
        let targets: HashMap<String, String> = definitions
            .iter()
            .filter(|d| d.active)
            .map(|d| (d.name.clone(), d.storage_name.clone()))
            .collect();

        let mut report = LoadReport::default();
        let mut built: HashMap<String, Arc<EntityDescriptor>> = HashMap::new();
        let mut loadable: Vec<(&EntityDefinition, Vec<LiveColumn>)> = Vec::new();
        for def in definitions.iter().filter(|d| d.active) {
            if !tables.contains(&def.storage_name) {
                tracing::info!(entity = %def.name, "definition not materialized, skipping");
                report.not_materialized.push(def.name.clone());
                continue;
            }
            match SchemaIntrospector::inspect(storage, &def.storage_name).await {
                Ok(live) => loadable.push((def, live.columns().to_vec())),
                Err(e) => {
                    tracing::warn!(entity = %def.name, error = %e, "failed to load entity");
                    report.failed.push((def.name.clone(), e.to_string()));
                }
            }
        }

        for (def, live) in &loadable {
            let ctx = ResolveContext {
                externals,
                materialized: &built,
                definitions: &targets,
            };
            match EntitySynthesizer::synthesize(def, &ctx) {
                Ok(d) => {
                    let (d, pending) = d.restrict_to_live(live, &tables);
                    if !pending.is_empty() {
                        tracing::info!(entity = %def.name, fields = ?pending, "fields not yet applied");
                        report.pending_fields.push((def.name.clone(), pending));
                    }
                    built.insert(def.name.clone(), Arc::new(d));
                }
                Err(e) => {
                    tracing::warn!(entity = %def.name, error = %e, "failed to load entity");
                    report.failed.push((def.name.clone(), e.to_string()));
                }
            }
        }

        // Targets loaded later in the first pass are resolvable now.
        for (def, live) in &loadable {
            let forward = built.get(&def.name).is_some_and(|d| d.has_forward_references());
            if !forward {
                continue;
            }
            let ctx = ResolveContext {
                externals,
                materialized: &built,
                definitions: &targets,
            };
            if let Ok(d) = EntitySynthesizer::synthesize(def, &ctx) {
                built.insert(def.name.clone(), Arc::new(d.restrict_to_live(live, &tables).0));
            }
        }

        report.loaded = built.keys().cloned().collect();
        report.loaded.sort();
        *self.write() = built;
        self.accessors.write().unwrap_or_else(|p| p.into_inner()).clear();
        self.version.fetch_add(1, Ordering::SeqCst);
        tracing::info!(loaded = report.loaded.len(), "registry loaded");
        Ok(report)
    }
}

/// One async mutex per entity name, serializing structural changes to that entity.
#[derive(Default)]
pub struct EntityLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        let m = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(locks.entry(name.to_string()).or_default())
        };
        m.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::FieldType;
    use crate::schema::{ColumnSpec, PhysicalType, RelationSpec, Resolution};

    fn descriptor(name: &str, forward_to: Option<&str>) -> EntityDescriptor {
        let relations = forward_to
            .map(|t| {
                vec![RelationSpec {
                    field_name: "target".into(),
                    kind: FieldType::ReferenceOne,
                    resolution: Resolution::Forward(t.into()),
                    on_delete: None,
                    inverse_name: None,
                    column: Some("target_id".into()),
                    join_table: None,
                }]
            })
            .unwrap_or_default();
        let mut col = ColumnSpec::primary_key();
        col.physical = PhysicalType::Integer;
        EntityDescriptor {
            name: name.into(),
            storage_name: name.to_lowercase(),
            columns: vec![col],
            relations,
        }
    }

    #[test]
    fn register_replaces_and_bumps_version() {
        let r = RuntimeRegistry::new();
        let v0 = r.version();
        let first = r.register(descriptor("Invoice", None));
        let held = r.get("Invoice").unwrap();
        r.register(descriptor("Invoice", Some("Customer")));
        assert!(r.version() > v0);
        assert!(Arc::ptr_eq(&first, &held));
        assert!(r.get("Invoice").unwrap().has_forward_references());
        assert!(!held.has_forward_references());
    }

    #[test]
    fn accessor_is_cached_until_descriptor_changes() {
        let r = RuntimeRegistry::new();
        r.register(descriptor("Tag", None));
        let a = r.accessor("Tag").unwrap();
        let b = r.accessor("Tag").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        r.register(descriptor("Tag", None));
        let c = r.accessor("Tag").unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(a.select_by_id.contains("\"tag\""));
        r.unregister("Tag");
        assert!(r.accessor("Tag").is_none());
    }

    #[test]
    fn dependents_include_forward_references() {
        let r = RuntimeRegistry::new();
        r.register(descriptor("Order", Some("Customer")));
        r.register(descriptor("Note", None));
        assert_eq!(r.dependents_of("Customer"), vec!["Order".to_string()]);
        assert!(r.dependents_of("Note").is_empty());
    }

    #[tokio::test]
    async fn entity_locks_serialize_same_name() {
        let locks = Arc::new(EntityLocks::new());
        let guard = locks.lock("Invoice").await;
        let other = locks.lock("Customer").await;
        drop(other);
        let l2 = Arc::clone(&locks);
        let waiter = tokio::spawn(async move {
            let _g = l2.lock("Invoice").await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }
}
