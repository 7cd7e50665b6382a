//! Generic CRUD execution against SQLite, driven by the registered entity descriptor.

use crate::error::AppError;
use crate::registry::EntityAccessor;
use crate::schema::{ColumnSpec, EntityDescriptor, JoinTableSpec, PhysicalType};
use crate::service::validation::{PreparedRecord, RecordValidator};
use crate::sql::{self, QueryBuf, SqliteBindValue};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, ValueRef};

pub struct CrudService;

impl CrudService {
    /// List rows with optional filters (exact match), limit (default 100, max 1000), offset (default 0).
    pub async fn list(
        pool: &SqlitePool,
        accessor: &EntityAccessor,
        filters: &[(String, String)],
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Vec<Value>, AppError> {
        const DEFAULT_LIMIT: u32 = 100;
        let entity = &accessor.descriptor;
        let limit = limit.unwrap_or(DEFAULT_LIMIT).min(sql::MAX_LIMIT);
        let offset = offset.unwrap_or(0);
        let filters = RecordValidator::filters(entity, filters)?;
        let q = sql::select_list(entity, &filters, limit, offset);

        let mut conn = pool.acquire().await?;
        tracing::debug!(sql = %q.sql, params = ?q.params, "query");
        let rows = bind_all(&q.sql, &q.params).fetch_all(&mut *conn).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut record = row_to_json(entity, row)?;
            load_many(&mut *conn, entity, &mut record).await?;
            out.push(Value::Object(record));
        }
        Ok(out)
    }

    /// Fetch one row by primary key, with many-valued relations as id arrays.
    pub async fn get(pool: &SqlitePool, accessor: &EntityAccessor, id: i64) -> Result<Option<Value>, AppError> {
        let mut conn = pool.acquire().await?;
        let record = fetch_by_id(&mut *conn, accessor, id).await?;
        Ok(record.map(Value::Object))
    }

    /// Insert one row and its join rows in a transaction. Returns the created record.
    pub async fn create(pool: &SqlitePool, accessor: &EntityAccessor, body: &Map<String, Value>) -> Result<Value, AppError> {
        let entity = &accessor.descriptor;
        let prepared = RecordValidator::prepare(entity, body, false)?;
        let q = sql::insert(entity, &prepared.columns);

        let mut tx = pool.begin().await?;
        let row = execute_returning_one(&mut *tx, &q)
            .await?
            .ok_or(AppError::Db(sqlx::Error::RowNotFound))?;
        let id: i64 = row.try_get(crate::schema::PK_COLUMN)?;
        replace_links(&mut *tx, &prepared, id).await?;
        let record = fetch_by_id(&mut *tx, accessor, id)
            .await?
            .ok_or(AppError::Db(sqlx::Error::RowNotFound))?;
        tx.commit().await?;
        tracing::debug!(entity = %entity.name, id, "record created");
        Ok(Value::Object(record))
    }

    /// Partial update by id. Many-valued relations present in the body replace the stored links.
    pub async fn update(
        pool: &SqlitePool,
        accessor: &EntityAccessor,
        id: i64,
        body: &Map<String, Value>,
    ) -> Result<Option<Value>, AppError> {
        let entity = &accessor.descriptor;
        let prepared = RecordValidator::prepare(entity, body, true)?;
        let q = sql::update(entity, id, &prepared.columns);

        let mut tx = pool.begin().await?;
        if execute_returning_one(&mut *tx, &q).await?.is_none() {
            return Ok(None);
        }
        replace_links(&mut *tx, &prepared, id).await?;
        let record = fetch_by_id(&mut *tx, accessor, id).await?;
        tx.commit().await?;
        Ok(record.map(Value::Object))
    }

    /// Delete by id. Join rows go with it through ON DELETE CASCADE. Returns the deleted record or None.
    pub async fn delete(pool: &SqlitePool, accessor: &EntityAccessor, id: i64) -> Result<Option<Value>, AppError> {
        let mut tx = pool.begin().await?;
        let Some(record) = fetch_by_id(&mut *tx, accessor, id).await? else {
            return Ok(None);
        };
        sqlx::query(&accessor.delete_by_id)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_constraint)?;
        tx.commit().await?;
        Ok(Some(Value::Object(record)))
    }
}

fn bind_all<'q>(sql: &'q str, params: &[Value]) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    let mut query = sqlx::query(sql);
    for p in params {
        query = query.bind(SqliteBindValue::from_json(p));
    }
    query
}

async fn execute_returning_one(conn: &mut SqliteConnection, q: &QueryBuf) -> Result<Option<SqliteRow>, AppError> {
    tracing::debug!(sql = %q.sql, params = ?q.params, "query");
    bind_all(&q.sql, &q.params)
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_constraint)
}

async fn fetch_by_id(
    conn: &mut SqliteConnection,
    accessor: &EntityAccessor,
    id: i64,
) -> Result<Option<Map<String, Value>>, AppError> {
    let row = sqlx::query(&accessor.select_by_id)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    let Some(row) = row else { return Ok(None) };
    let mut record = row_to_json(&accessor.descriptor, &row)?;
    load_many(conn, &accessor.descriptor, &mut record).await?;
    Ok(Some(record))
}

async fn load_many(conn: &mut SqliteConnection, entity: &EntityDescriptor, record: &mut Map<String, Value>) -> Result<(), AppError> {
    let Some(id) = record.get(crate::schema::PK_COLUMN).and_then(Value::as_i64) else {
        return Ok(());
    };
    for rel in entity.many_relations() {
        let Some(join) = &rel.join_table else { continue };
        let ids: Vec<i64> = sqlx::query_scalar(&sql::select_join_targets(join))
            .bind(id)
            .fetch_all(&mut *conn)
            .await?;
        record.insert(rel.field_name.clone(), Value::from(ids));
    }
    Ok(())
}

async fn replace_links(conn: &mut SqliteConnection, prepared: &PreparedRecord, owner: i64) -> Result<(), AppError> {
    for (join, ids) in &prepared.many {
        write_links(conn, join, owner, ids).await?;
    }
    Ok(())
}

async fn write_links(conn: &mut SqliteConnection, join: &JoinTableSpec, owner: i64, ids: &[i64]) -> Result<(), AppError> {
    sqlx::query(&sql::delete_join_rows(join))
        .bind(owner)
        .execute(&mut *conn)
        .await?;
    let insert = sql::insert_join_row(join);
    for target in ids {
        sqlx::query(&insert)
            .bind(owner)
            .bind(*target)
            .execute(&mut *conn)
            .await
            .map_err(map_constraint)?;
    }
    Ok(())
}

/// Constraint failures are the caller's fault; everything else stays a database error.
fn map_constraint(e: sqlx::Error) -> AppError {
    use sqlx::error::ErrorKind;
    if let sqlx::Error::Database(db) = &e {
        let msg = match db.kind() {
            ErrorKind::UniqueViolation => Some("value must be unique"),
            ErrorKind::ForeignKeyViolation => Some("referenced record does not exist or is still referenced"),
            ErrorKind::NotNullViolation => Some("required value missing"),
            _ => None,
        };
        if let Some(msg) = msg {
            return AppError::Validation(format!("{}: {}", msg, db.message()));
        }
    }
    AppError::Db(e)
}

fn row_to_json(entity: &EntityDescriptor, row: &SqliteRow) -> Result<Map<String, Value>, AppError> {
    let mut map = Map::new();
    for col in &entity.columns {
        map.insert(col.name.clone(), cell_to_value(row, col)?);
    }
    Ok(map)
}

/// SQLite stores by value, so cells are decoded by the column's declared physical type.
fn cell_to_value(row: &SqliteRow, col: &ColumnSpec) -> Result<Value, sqlx::Error> {
    let name = col.name.as_str();
    if row.try_get_raw(name)?.is_null() {
        return Ok(Value::Null);
    }
    let v = match col.physical {
        PhysicalType::Integer => Value::from(row.try_get_unchecked::<i64, _>(name)?),
        PhysicalType::Boolean => Value::Bool(row.try_get_unchecked::<i64, _>(name)? != 0),
        PhysicalType::Decimal { .. } => serde_json::Number::from_f64(row.try_get_unchecked::<f64, _>(name)?)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        PhysicalType::Varchar { .. } | PhysicalType::Text | PhysicalType::Date | PhysicalType::DateTime => {
            Value::String(row.try_get_unchecked::<String, _>(name)?)
        }
    };
    Ok(v)
}
