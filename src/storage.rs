//! Storage engine boundary and its SQLite implementation.

use crate::schema::{ColumnSpec, EntityDescriptor, JoinTableSpec, LiveColumn};
use crate::sql::ddl;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::RwLock;

/// Structural operations the migration engine needs from storage.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Entity table plus the join tables of its many-valued relations, in one transaction.
    async fn create_table(&self, descriptor: &EntityDescriptor) -> Result<(), sqlx::Error>;

    async fn add_column(&self, table: &str, column: &ColumnSpec) -> Result<(), sqlx::Error> {
        self.add_columns(table, std::slice::from_ref(column), &[]).await
    }

    /// Add columns and create missing join tables as one unit of work.
    async fn add_columns(
        &self,
        table: &str,
        columns: &[ColumnSpec],
        join_tables: &[JoinTableSpec],
    ) -> Result<(), sqlx::Error>;

    async fn drop_column(&self, table: &str, column: &str) -> Result<(), sqlx::Error>;

    /// Drop the table and, when given, its join tables.
    async fn drop_table(&self, table: &str, join_tables: &[JoinTableSpec]) -> Result<(), sqlx::Error>;

    /// Live columns, or None when the table does not exist.
    async fn introspect_columns(&self, table: &str) -> Result<Option<Vec<LiveColumn>>, sqlx::Error>;

    async fn table_names(&self) -> Result<HashSet<String>, sqlx::Error>;

    async fn table_exists(&self, table: &str) -> Result<bool, sqlx::Error> {
        Ok(self.table_names().await?.contains(table))
    }

    async fn ensure_join_table(&self, spec: &JoinTableSpec) -> Result<(), sqlx::Error>;

    /// Backing file; None for engines without one, which makes snapshots unsupported.
    fn database_path(&self) -> Option<PathBuf>;

    async fn copy_storage_file(&self, src: &Path, dst: &Path) -> std::io::Result<u64> {
        tokio::fs::copy(src, dst).await
    }

    async fn close_all_connections(&self);

    /// Open a fresh pool after the file was replaced.
    async fn reconnect(&self) -> Result<(), sqlx::Error>;

    fn pool(&self) -> SqlitePool;
}

/// SQLite over a sqlx pool. The pool is swapped on `reconnect`, so callers fetch it per use.
pub struct SqliteStorage {
    pool: RwLock<SqlitePool>,
    options: SqliteConnectOptions,
    path: Option<PathBuf>,
}

impl SqliteStorage {
    /// Open (creating if missing) a database file. Rollback journal keeps the main file a full snapshot.
    pub async fn open_file(path: impl AsRef<Path>) -> Result<Self, sqlx::Error> {
        let path = path.as_ref().to_path_buf();
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Delete);
        let pool = Self::pool_options(false).connect_with(options.clone()).await?;
        tracing::info!(path = %path.display(), "sqlite storage opened");
        Ok(SqliteStorage {
            pool: RwLock::new(pool),
            options,
            path: Some(path),
        })
    }

    /// Private in-memory database on a single long-lived connection.
    pub async fn open_in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = Self::pool_options(true).connect_with(options.clone()).await?;
        Ok(SqliteStorage {
            pool: RwLock::new(pool),
            options,
            path: None,
        })
    }

    /// `:memory:` opens in memory, anything else is a file path.
    pub async fn open(location: &str) -> Result<Self, sqlx::Error> {
        if location == ":memory:" || location == "sqlite::memory:" {
            Self::open_in_memory().await
        } else {
            Self::open_file(location).await
        }
    }

    fn pool_options(in_memory: bool) -> SqlitePoolOptions {
        if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        }
    }

    fn current_pool(&self) -> SqlitePool {
        match self.pool.read() {
            Ok(p) => p.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl StorageEngine for SqliteStorage {
    async fn create_table(&self, descriptor: &EntityDescriptor) -> Result<(), sqlx::Error> {
        let pool = self.current_pool();
        let mut tx = pool.begin().await?;
        let sql = ddl::create_table(descriptor);
        tracing::debug!(sql = %sql, "create table");
        sqlx::query(&sql).execute(&mut *tx).await?;
        for j in descriptor.join_tables() {
            let sql = ddl::create_join_table(j);
            tracing::debug!(sql = %sql, "create join table");
            sqlx::query(&sql).execute(&mut *tx).await?;
        }
        tx.commit().await
    }

    async fn add_columns(
        &self,
        table: &str,
        columns: &[ColumnSpec],
        join_tables: &[JoinTableSpec],
    ) -> Result<(), sqlx::Error> {
        let pool = self.current_pool();
        let mut tx = pool.begin().await?;
        for c in columns {
            for sql in ddl::add_column(table, c) {
                tracing::debug!(sql = %sql, "add column");
                sqlx::query(&sql).execute(&mut *tx).await?;
            }
        }
        for j in join_tables {
            let sql = ddl::create_join_table(j);
            tracing::debug!(sql = %sql, "create join table");
            sqlx::query(&sql).execute(&mut *tx).await?;
        }
        tx.commit().await
    }

    async fn drop_column(&self, table: &str, column: &str) -> Result<(), sqlx::Error> {
        let sql = ddl::drop_column(table, column);
        tracing::debug!(sql = %sql, "drop column");
        sqlx::query(&sql).execute(&self.current_pool()).await?;
        Ok(())
    }

    async fn drop_table(&self, table: &str, join_tables: &[JoinTableSpec]) -> Result<(), sqlx::Error> {
        let pool = self.current_pool();
        let mut tx = pool.begin().await?;
        for j in join_tables {
            sqlx::query(&ddl::drop_table_if_exists(&j.name)).execute(&mut *tx).await?;
        }
        let sql = ddl::drop_table(table);
        tracing::debug!(sql = %sql, "drop table");
        sqlx::query(&sql).execute(&mut *tx).await?;
        tx.commit().await
    }

    async fn introspect_columns(&self, table: &str) -> Result<Option<Vec<LiveColumn>>, sqlx::Error> {
        let pool = self.current_pool();
        let exists = sqlx::query("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")
            .bind(table)
            .fetch_optional(&pool)
            .await?;
        if exists.is_none() {
            return Ok(None);
        }
        let rows = sqlx::query(
            "SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid",
        )
        .bind(table)
        .fetch_all(&pool)
        .await?;
        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let not_null: i64 = row.try_get("notnull")?;
            let pk: i64 = row.try_get("pk")?;
            columns.push(LiveColumn {
                name: row.try_get("name")?,
                physical_type: row.try_get("type")?,
                nullable: not_null == 0 && pk == 0,
                default: row.try_get("dflt_value")?,
                primary_key: pk > 0,
            });
        }
        Ok(Some(columns))
    }

    async fn table_names(&self) -> Result<HashSet<String>, sqlx::Error> {
        let rows = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'")
            .fetch_all(&self.current_pool())
            .await?;
        rows.iter().map(|r| r.try_get::<String, _>("name")).collect()
    }

    async fn ensure_join_table(&self, spec: &JoinTableSpec) -> Result<(), sqlx::Error> {
        sqlx::query(&ddl::create_join_table(spec))
            .execute(&self.current_pool())
            .await?;
        Ok(())
    }

    fn database_path(&self) -> Option<PathBuf> {
        self.path.clone()
    }

    async fn close_all_connections(&self) {
        self.current_pool().close().await;
    }

    async fn reconnect(&self) -> Result<(), sqlx::Error> {
        let fresh = Self::pool_options(self.path.is_none())
            .connect_with(self.options.clone())
            .await?;
        let old = match self.pool.write() {
            Ok(mut guard) => std::mem::replace(&mut *guard, fresh),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), fresh),
        };
        old.close().await;
        tracing::info!("sqlite storage reconnected");
        Ok(())
    }

    fn pool(&self) -> SqlitePool {
        self.current_pool()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::FieldType;
    use crate::schema::PhysicalType;

    fn text(name: &str) -> ColumnSpec {
        ColumnSpec {
            name: name.into(),
            field_name: Some(name.into()),
            field_type: Some(FieldType::LongText),
            physical: PhysicalType::Text,
            nullable: true,
            unique: false,
            primary_key: false,
            default: None,
            references: None,
            upload_to: None,
        }
    }

    fn descriptor() -> EntityDescriptor {
        EntityDescriptor {
            name: "Note".into(),
            storage_name: "note".into(),
            columns: vec![ColumnSpec::primary_key(), text("body")],
            relations: vec![],
        }
    }

    #[tokio::test]
    async fn introspect_reports_absent_then_columns() {
        let storage = SqliteStorage::open_in_memory().await.unwrap();
        assert!(storage.introspect_columns("note").await.unwrap().is_none());
        storage.create_table(&descriptor()).await.unwrap();
        let cols = storage.introspect_columns("note").await.unwrap().unwrap();
        let names: Vec<_> = cols.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "body"]);
        assert!(cols[0].primary_key);
        assert!(cols[1].nullable);
        assert_eq!(cols[1].physical_type, "TEXT");
    }

    #[tokio::test]
    async fn create_table_twice_fails() {
        let storage = SqliteStorage::open_in_memory().await.unwrap();
        storage.create_table(&descriptor()).await.unwrap();
        assert!(storage.create_table(&descriptor()).await.is_err());
    }

    #[tokio::test]
    async fn add_unique_column_and_drop_table() {
        let storage = SqliteStorage::open_in_memory().await.unwrap();
        storage.create_table(&descriptor()).await.unwrap();
        let mut code = text("code");
        code.unique = true;
        storage.add_column("note", &code).await.unwrap();
        assert!(storage.table_exists("note").await.unwrap());
        let cols = storage.introspect_columns("note").await.unwrap().unwrap();
        assert_eq!(cols.len(), 3);
        storage.drop_table("note", &[]).await.unwrap();
        assert!(!storage.table_exists("note").await.unwrap());
    }

    #[tokio::test]
    async fn in_memory_has_no_file() {
        let storage = SqliteStorage::open(":memory:").await.unwrap();
        assert!(storage.database_path().is_none());
    }
}
