//! `_sys_entities` / `_sys_fields` persistence. Lives in the same database file as the data so
//! every snapshot carries both.

use crate::case::to_snake_case;
use crate::definition::events::{DefinitionEvent, DefinitionObserver, EventKind};
use crate::definition::types::*;
use crate::definition::validator::{validate_entity, validate_field};
use crate::error::{DefinitionError, EngineError};
use crate::storage::StorageEngine;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Create `_sys_*` tables if missing.
pub async fn ensure_sys_tables(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _sys_entities (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            storage_name TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL DEFAULT '',
            active BOOL NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _sys_fields (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_id INTEGER NOT NULL REFERENCES _sys_entities (id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            field_type TEXT NOT NULL,
            required BOOL NOT NULL DEFAULT 0,
            is_unique BOOL NOT NULL DEFAULT 0,
            default_value TEXT,
            type_params TEXT NOT NULL DEFAULT '{}',
            target_entity TEXT,
            on_delete TEXT,
            inverse_name TEXT,
            position INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            UNIQUE (entity_id, name)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Attribute changes for an existing entity. Renames are not supported once a table may exist.
#[derive(Clone, Debug, Default, serde::Deserialize)]
pub struct EntityChanges {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
}

pub struct DefinitionStore {
    storage: Arc<dyn StorageEngine>,
    observers: RwLock<Vec<Arc<dyn DefinitionObserver>>>,
}

impl DefinitionStore {
    pub async fn open(storage: Arc<dyn StorageEngine>) -> Result<Self, EngineError> {
        ensure_sys_tables(&storage.pool()).await?;
        Ok(DefinitionStore {
            storage,
            observers: RwLock::new(Vec::new()),
        })
    }

    pub fn subscribe(&self, observer: Arc<dyn DefinitionObserver>) {
        match self.observers.write() {
            Ok(mut list) => list.push(observer),
            Err(poisoned) => poisoned.into_inner().push(observer),
        }
    }

    fn pool(&self) -> SqlitePool {
        self.storage.pool()
    }

    async fn emit(&self, event: DefinitionEvent) -> Result<(), EngineError> {
        let observers: Vec<_> = match self.observers.read() {
            Ok(list) => list.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for o in observers {
            if let Err(e) = o.on_event(&event).await {
                match event.kind {
                    EventKind::BeforeDelete => return Err(e),
                    EventKind::AfterSave => {
                        tracing::warn!(entity = %event.entity.name, error = %e, "definition observer failed");
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn create_entity(&self, input: NewEntity) -> Result<EntityDefinition, EngineError> {
        let storage_name = input
            .storage_name
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| to_snake_case(&input.name));
        validate_entity(&input, &storage_name)?;
        self.check_entity_unique(&input.name, &storage_name, None).await?;
        let fields = input
            .fields
            .iter()
            .map(validate_field)
            .collect::<Result<Vec<_>, _>>()?;

        let now = Utc::now();
        let pool = self.pool();
        let mut tx = pool.begin().await?;
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO _sys_entities (name, storage_name, description, active, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?5) RETURNING id",
        )
        .bind(&input.name)
        .bind(&storage_name)
        .bind(&input.description)
        .bind(input.active)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        for (i, f) in fields.iter().enumerate() {
            let position = f.position.unwrap_or(i as i64);
            insert_field(&mut tx, id, f, position, now).await?;
        }
        tx.commit().await?;

        let saved = self.require_entity(id).await?;
        tracing::info!(entity = %saved.name, storage = %saved.storage_name, "entity definition created");
        self.emit(DefinitionEvent::after_save(saved.clone(), None)).await?;
        Ok(saved)
    }

    pub async fn update_entity(&self, id: i64, changes: EntityChanges) -> Result<EntityDefinition, EngineError> {
        let current = self.require_entity(id).await?;
        let description = changes.description.unwrap_or(current.description);
        let active = changes.active.unwrap_or(current.active);
        sqlx::query("UPDATE _sys_entities SET description = ?1, active = ?2, updated_at = ?3 WHERE id = ?4")
            .bind(&description)
            .bind(active)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool())
            .await?;
        let saved = self.require_entity(id).await?;
        self.emit(DefinitionEvent::after_save(saved.clone(), None)).await?;
        Ok(saved)
    }

    /// Deletes metadata only; the materialized table is left to an explicit `drop`.
    pub async fn delete_entity(&self, id: i64) -> Result<(), EngineError> {
        let current = self.require_entity(id).await?;
        self.emit(DefinitionEvent::before_delete(current.clone(), None)).await?;
        sqlx::query("DELETE FROM _sys_entities WHERE id = ?1")
            .bind(id)
            .execute(&self.pool())
            .await?;
        tracing::info!(entity = %current.name, "entity definition deleted");
        Ok(())
    }

    pub async fn add_field(&self, entity_id: i64, field: NewField) -> Result<FieldDefinition, EngineError> {
        let entity = self.require_entity(entity_id).await?;
        let field = validate_field(&field)?;
        if entity.field(&field.name).is_some() {
            return Err(duplicate_field(&entity.name, &field.name));
        }
        let position = field
            .position
            .unwrap_or_else(|| entity.fields.iter().map(|f| f.position + 1).max().unwrap_or(0));
        let pool = self.pool();
        let mut tx = pool.begin().await?;
        let field_id = insert_field(&mut tx, entity_id, &field, position, Utc::now()).await?;
        touch_entity(&mut tx, entity_id).await?;
        tx.commit().await?;

        let saved = self.require_entity(entity_id).await?;
        let out = saved
            .fields
            .iter()
            .find(|f| f.id == field_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("field {}", field_id)))?;
        tracing::info!(entity = %saved.name, field = %out.name, "field definition added");
        self.emit(DefinitionEvent::after_save(saved, Some(out.name.clone()))).await?;
        Ok(out)
    }

    pub async fn update_field(&self, field_id: i64, field: NewField) -> Result<FieldDefinition, EngineError> {
        let entity_id = self.field_owner(field_id).await?;
        let entity = self.require_entity(entity_id).await?;
        let field = validate_field(&field)?;
        if entity.fields.iter().any(|f| f.name == field.name && f.id != field_id) {
            return Err(duplicate_field(&entity.name, &field.name));
        }
        let position = match field.position {
            Some(p) => p,
            None => entity
                .fields
                .iter()
                .find(|f| f.id == field_id)
                .map(|f| f.position)
                .unwrap_or(0),
        };
        let pool = self.pool();
        let mut tx = pool.begin().await?;
        sqlx::query(
            "UPDATE _sys_fields SET name = ?1, field_type = ?2, required = ?3, is_unique = ?4, default_value = ?5, \
             type_params = ?6, target_entity = ?7, on_delete = ?8, inverse_name = ?9, position = ?10 WHERE id = ?11",
        )
        .bind(&field.name)
        .bind(field.field_type.as_str())
        .bind(field.required)
        .bind(field.unique)
        .bind(&field.default_value)
        .bind(serde_json::Value::Object(field.type_params.clone()).to_string())
        .bind(&field.target_entity_name)
        .bind(field.on_delete.map(|a| a.as_str()))
        .bind(&field.inverse_name)
        .bind(position)
        .bind(field_id)
        .execute(&mut *tx)
        .await?;
        touch_entity(&mut tx, entity_id).await?;
        tx.commit().await?;

        let saved = self.require_entity(entity_id).await?;
        let out = saved
            .fields
            .iter()
            .find(|f| f.id == field_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("field {}", field_id)))?;
        self.emit(DefinitionEvent::after_save(saved, Some(out.name.clone()))).await?;
        Ok(out)
    }

    /// Deletes field metadata; the live column stays until removed explicitly.
    pub async fn delete_field(&self, field_id: i64) -> Result<(), EngineError> {
        let entity_id = self.field_owner(field_id).await?;
        let entity = self.require_entity(entity_id).await?;
        let name = entity
            .fields
            .iter()
            .find(|f| f.id == field_id)
            .map(|f| f.name.clone());
        self.emit(DefinitionEvent::before_delete(entity.clone(), name.clone())).await?;
        let pool = self.pool();
        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM _sys_fields WHERE id = ?1")
            .bind(field_id)
            .execute(&mut *tx)
            .await?;
        touch_entity(&mut tx, entity_id).await?;
        tx.commit().await?;
        tracing::info!(entity = %entity.name, field = ?name, "field definition deleted");
        Ok(())
    }

    pub async fn get_entity(&self, id: i64) -> Result<Option<EntityDefinition>, EngineError> {
        let row = sqlx::query(&format!("{} WHERE id = ?1", SELECT_ENTITY))
            .bind(id)
            .fetch_optional(&self.pool())
            .await?;
        match row {
            Some(r) => Ok(Some(self.with_fields(entity_from_row(&r)?).await?)),
            None => Ok(None),
        }
    }

    pub async fn get_entity_by_name(&self, name: &str) -> Result<Option<EntityDefinition>, EngineError> {
        let row = sqlx::query(&format!("{} WHERE name = ?1", SELECT_ENTITY))
            .bind(name)
            .fetch_optional(&self.pool())
            .await?;
        match row {
            Some(r) => Ok(Some(self.with_fields(entity_from_row(&r)?).await?)),
            None => Ok(None),
        }
    }

    pub async fn list_entities(&self) -> Result<Vec<EntityDefinition>, EngineError> {
        self.list_where("").await
    }

    pub async fn list_active(&self) -> Result<Vec<EntityDefinition>, EngineError> {
        self.list_where(" WHERE active = 1").await
    }

    /// Entity name -> storage name for every active definition.
    pub async fn active_targets(&self) -> Result<HashMap<String, String>, EngineError> {
        let rows = sqlx::query("SELECT name, storage_name FROM _sys_entities WHERE active = 1")
            .fetch_all(&self.pool())
            .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for r in rows {
            out.insert(r.try_get("name")?, r.try_get("storage_name")?);
        }
        Ok(out)
    }

    pub(crate) async fn require_entity(&self, id: i64) -> Result<EntityDefinition, EngineError> {
        self.get_entity(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("entity definition {}", id)))
    }

    async fn list_where(&self, clause: &str) -> Result<Vec<EntityDefinition>, EngineError> {
        let rows = sqlx::query(&format!("{}{} ORDER BY id", SELECT_ENTITY, clause))
            .fetch_all(&self.pool())
            .await?;
        let mut fields = self.all_fields().await?;
        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            let mut e = entity_from_row(&r)?;
            e.fields = fields.remove(&e.id).unwrap_or_default();
            out.push(e);
        }
        Ok(out)
    }

    async fn with_fields(&self, mut entity: EntityDefinition) -> Result<EntityDefinition, EngineError> {
        let rows = sqlx::query(&format!("{} WHERE entity_id = ?1 ORDER BY position, id", SELECT_FIELD))
            .bind(entity.id)
            .fetch_all(&self.pool())
            .await?;
        entity.fields = rows.iter().map(field_from_row).collect::<Result<_, _>>()?;
        Ok(entity)
    }

    async fn all_fields(&self) -> Result<HashMap<i64, Vec<FieldDefinition>>, EngineError> {
        let rows = sqlx::query(&format!("{} ORDER BY entity_id, position, id", SELECT_FIELD))
            .fetch_all(&self.pool())
            .await?;
        let mut out: HashMap<i64, Vec<FieldDefinition>> = HashMap::new();
        for r in &rows {
            let f = field_from_row(r)?;
            out.entry(f.entity_id).or_default().push(f);
        }
        Ok(out)
    }

    async fn field_owner(&self, field_id: i64) -> Result<i64, EngineError> {
        sqlx::query_scalar("SELECT entity_id FROM _sys_fields WHERE id = ?1")
            .bind(field_id)
            .fetch_optional(&self.pool())
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("field definition {}", field_id)))
    }

    /// Checked up front so violations surface as validation errors, not constraint failures.
    async fn check_entity_unique(&self, name: &str, storage_name: &str, except: Option<i64>) -> Result<(), EngineError> {
        let rows = sqlx::query("SELECT id, name, storage_name FROM _sys_entities WHERE name = ?1 OR storage_name = ?2")
            .bind(name)
            .bind(storage_name)
            .fetch_all(&self.pool())
            .await?;
        for r in rows {
            let id: i64 = r.try_get("id")?;
            if Some(id) == except {
                continue;
            }
            let existing: String = r.try_get("name")?;
            let err = if existing == name {
                DefinitionError::Duplicate {
                    kind: "entity name",
                    value: name.to_string(),
                }
            } else {
                DefinitionError::Duplicate {
                    kind: "storage name",
                    value: storage_name.to_string(),
                }
            };
            return Err(err.into());
        }
        Ok(())
    }
}

const SELECT_ENTITY: &str =
    "SELECT id, name, storage_name, description, active, created_at, updated_at FROM _sys_entities";

const SELECT_FIELD: &str = "SELECT id, entity_id, name, field_type, required, is_unique, default_value, type_params, \
     target_entity, on_delete, inverse_name, position, created_at FROM _sys_fields";

fn duplicate_field(entity: &str, field: &str) -> EngineError {
    DefinitionError::Duplicate {
        kind: "field",
        value: format!("{}.{}", entity, field),
    }
    .into()
}

async fn insert_field(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    entity_id: i64,
    f: &NewField,
    position: i64,
    now: DateTime<Utc>,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "INSERT INTO _sys_fields (entity_id, name, field_type, required, is_unique, default_value, type_params, \
         target_entity, on_delete, inverse_name, position, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) RETURNING id",
    )
    .bind(entity_id)
    .bind(&f.name)
    .bind(f.field_type.as_str())
    .bind(f.required)
    .bind(f.unique)
    .bind(&f.default_value)
    .bind(serde_json::Value::Object(f.type_params.clone()).to_string())
    .bind(&f.target_entity_name)
    .bind(f.on_delete.map(|a| a.as_str()))
    .bind(&f.inverse_name)
    .bind(position)
    .bind(now)
    .fetch_one(&mut **tx)
    .await
}

async fn touch_entity(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>, entity_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE _sys_entities SET updated_at = ?1 WHERE id = ?2")
        .bind(Utc::now())
        .bind(entity_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn decode_err(msg: String) -> sqlx::Error {
    sqlx::Error::Decode(msg.into())
}

fn entity_from_row(r: &SqliteRow) -> Result<EntityDefinition, sqlx::Error> {
    Ok(EntityDefinition {
        id: r.try_get("id")?,
        name: r.try_get("name")?,
        storage_name: r.try_get("storage_name")?,
        description: r.try_get("description")?,
        active: r.try_get("active")?,
        created_at: r.try_get("created_at")?,
        updated_at: r.try_get("updated_at")?,
        fields: Vec::new(),
    })
}

fn field_from_row(r: &SqliteRow) -> Result<FieldDefinition, sqlx::Error> {
    let field_type: String = r.try_get("field_type")?;
    let on_delete: Option<String> = r.try_get("on_delete")?;
    let params: String = r.try_get("type_params")?;
    let type_params = match serde_json::from_str::<serde_json::Value>(&params) {
        Ok(serde_json::Value::Object(m)) => m,
        Ok(_) => TypeParams::new(),
        Err(e) => return Err(decode_err(format!("type_params: {}", e))),
    };
    Ok(FieldDefinition {
        id: r.try_get("id")?,
        entity_id: r.try_get("entity_id")?,
        name: r.try_get("name")?,
        field_type: field_type.parse::<FieldType>().map_err(decode_err)?,
        required: r.try_get("required")?,
        unique: r.try_get("is_unique")?,
        default_value: r.try_get("default_value")?,
        type_params,
        target_entity_name: r.try_get("target_entity")?,
        on_delete: on_delete
            .map(|s| s.parse::<OnDeleteAction>())
            .transpose()
            .map_err(decode_err)?,
        inverse_name: r.try_get("inverse_name")?,
        position: r.try_get("position")?,
        created_at: r.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn store() -> DefinitionStore {
        let storage: Arc<dyn StorageEngine> = Arc::new(SqliteStorage::open_in_memory().await.unwrap());
        DefinitionStore::open(storage).await.unwrap()
    }

    #[tokio::test]
    async fn create_and_read_back_in_order() {
        let store = store().await;
        let saved = store
            .create_entity(
                NewEntity::new("OrderItem")
                    .field(NewField::new("quantity", FieldType::Integer).required())
                    .field(NewField::new("note", FieldType::LongText)),
            )
            .await
            .unwrap();
        assert_eq!(saved.storage_name, "order_item");
        let names: Vec<_> = saved.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["quantity", "note"]);

        let added = store
            .add_field(saved.id, NewField::new("sku", FieldType::ShortText).param("max_length", 40))
            .await
            .unwrap();
        assert_eq!(added.position, 2);
        let again = store.get_entity_by_name("OrderItem").await.unwrap().unwrap();
        assert_eq!(again.fields.last().unwrap().type_params["max_length"], 40);
    }

    #[tokio::test]
    async fn duplicate_names_fail_before_insert() {
        let store = store().await;
        store.create_entity(NewEntity::new("Invoice")).await.unwrap();
        let err = store.create_entity(NewEntity::new("Invoice")).await.unwrap_err();
        assert!(matches!(err, EngineError::DefinitionValidation(DefinitionError::Duplicate { .. })));

        let mut clash = NewEntity::new("Bill");
        clash.storage_name = Some("invoice".into());
        let err = store.create_entity(clash).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::DefinitionValidation(DefinitionError::Duplicate { kind: "storage name", .. })
        ));
        assert_eq!(store.list_entities().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_entity_cascades_to_fields() {
        let store = store().await;
        let e = store
            .create_entity(NewEntity::new("Tag").field(NewField::new("label", FieldType::ShortText)))
            .await
            .unwrap();
        store.delete_entity(e.id).await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sys_fields")
            .fetch_one(&store.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    struct Recorder {
        saves: AtomicUsize,
        veto_deletes: bool,
    }

    #[async_trait::async_trait]
    impl DefinitionObserver for Recorder {
        async fn on_event(&self, event: &DefinitionEvent) -> Result<(), EngineError> {
            match event.kind {
                EventKind::AfterSave => {
                    self.saves.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                EventKind::BeforeDelete if self.veto_deletes => Err(EngineError::Backup("no snapshot".into())),
                EventKind::BeforeDelete => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn observers_see_saves_and_can_veto_deletes() {
        let store = store().await;
        let recorder = Arc::new(Recorder {
            saves: AtomicUsize::new(0),
            veto_deletes: true,
        });
        store.subscribe(recorder.clone());
        let e = store.create_entity(NewEntity::new("Note")).await.unwrap();
        let f = store
            .add_field(e.id, NewField::new("body", FieldType::LongText))
            .await
            .unwrap();
        assert_eq!(recorder.saves.load(Ordering::SeqCst), 2);

        assert!(store.delete_field(f.id).await.is_err());
        assert!(store.get_entity(e.id).await.unwrap().unwrap().field("body").is_some());
    }

    #[tokio::test]
    async fn inactive_entities_are_not_targets() {
        let store = store().await;
        let e = store.create_entity(NewEntity::new("Draft")).await.unwrap();
        store.create_entity(NewEntity::new("Live")).await.unwrap();
        store
            .update_entity(
                e.id,
                EntityChanges {
                    active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let targets = store.active_targets().await.unwrap();
        assert!(targets.contains_key("Live"));
        assert!(!targets.contains_key("Draft"));
        assert_eq!(store.list_active().await.unwrap().len(), 1);
    }
}
