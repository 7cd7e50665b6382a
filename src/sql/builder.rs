//! Builds parameterized INSERT, SELECT, UPDATE, DELETE from an entity descriptor.

use crate::schema::{EntityDescriptor, JoinTableSpec, PK_COLUMN};
use crate::sql::ddl::quoted;
use serde_json::{Map, Value};

/// Hard cap on list page size.
pub const MAX_LIMIT: u32 = 1000;

pub struct QueryBuf {
    pub sql: String,
    pub params: Vec<Value>,
}

impl QueryBuf {
    fn new() -> Self {
        QueryBuf {
            sql: String::new(),
            params: Vec::new(),
        }
    }

    fn push_param(&mut self, v: Value) -> usize {
        self.params.push(v);
        self.params.len()
    }
}

/// SELECT list: every owner-table column, in descriptor order.
fn select_column_list(entity: &EntityDescriptor) -> String {
    entity
        .columns
        .iter()
        .map(|c| quoted(&c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// SELECT by primary key. Caller binds id as sole param.
pub fn select_by_id(entity: &EntityDescriptor) -> QueryBuf {
    let mut q = QueryBuf::new();
    q.sql = format!(
        "SELECT {} FROM {} WHERE {} = ?1",
        select_column_list(entity),
        quoted(&entity.storage_name),
        quoted(PK_COLUMN)
    );
    q
}

/// SELECT list with optional filters (exact match per column), ORDER BY pk, LIMIT/OFFSET.
/// Filters on unknown columns are ignored; params are bound in filter order.
pub fn select_list(entity: &EntityDescriptor, filters: &[(String, Value)], limit: u32, offset: u32) -> QueryBuf {
    let mut q = QueryBuf::new();
    let mut where_parts = Vec::new();
    for (col, val) in filters {
        if entity.column(col).is_none() {
            continue;
        }
        if val.is_null() {
            where_parts.push(format!("{} IS NULL", quoted(col)));
            continue;
        }
        let n = q.push_param(val.clone());
        where_parts.push(format!("{} = ?{}", quoted(col), n));
    }
    let where_clause = if where_parts.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", where_parts.join(" AND "))
    };
    q.sql = format!(
        "SELECT {} FROM {}{} ORDER BY {} LIMIT {} OFFSET {}",
        select_column_list(entity),
        quoted(&entity.storage_name),
        where_clause,
        quoted(PK_COLUMN),
        limit.min(MAX_LIMIT),
        offset
    );
    q
}

/// INSERT of the columns present in `body`; absent columns take their declared defaults.
pub fn insert(entity: &EntityDescriptor, body: &Map<String, Value>) -> QueryBuf {
    let mut q = QueryBuf::new();
    let mut cols = Vec::new();
    let mut placeholders = Vec::new();
    for c in &entity.columns {
        if c.primary_key {
            continue;
        }
        let Some(val) = body.get(&c.name) else { continue };
        let n = q.push_param(val.clone());
        cols.push(quoted(&c.name));
        placeholders.push(format!("?{}", n));
    }
    let table = quoted(&entity.storage_name);
    let returning = select_column_list(entity);
    q.sql = if cols.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES RETURNING {}", table, returning)
    } else {
        format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
            table,
            cols.join(", "),
            placeholders.join(", "),
            returning
        )
    };
    q
}

/// UPDATE by id: SET only columns present in body. With nothing to set, selects the row instead.
pub fn update(entity: &EntityDescriptor, id: i64, body: &Map<String, Value>) -> QueryBuf {
    let mut q = QueryBuf::new();
    let mut sets = Vec::new();
    for c in &entity.columns {
        if c.primary_key {
            continue;
        }
        let Some(val) = body.get(&c.name) else { continue };
        let n = q.push_param(val.clone());
        sets.push(format!("{} = ?{}", quoted(&c.name), n));
    }
    if sets.is_empty() {
        let mut q = select_by_id(entity);
        q.params.push(Value::from(id));
        return q;
    }
    let n = q.push_param(Value::from(id));
    q.sql = format!(
        "UPDATE {} SET {} WHERE {} = ?{} RETURNING {}",
        quoted(&entity.storage_name),
        sets.join(", "),
        quoted(PK_COLUMN),
        n,
        select_column_list(entity)
    );
    q
}

/// DELETE by id. Caller binds id as sole param.
pub fn delete(entity: &EntityDescriptor) -> QueryBuf {
    let mut q = QueryBuf::new();
    q.sql = format!(
        "DELETE FROM {} WHERE {} = ?1",
        quoted(&entity.storage_name),
        quoted(PK_COLUMN)
    );
    q
}

/// Target ids linked to one owner row.
pub fn select_join_targets(join: &JoinTableSpec) -> String {
    format!(
        "SELECT {} FROM {} WHERE {} = ?1 ORDER BY {}",
        quoted(&join.target_column),
        quoted(&join.name),
        quoted(&join.owner_column),
        quoted(&join.target_column)
    )
}

pub fn delete_join_rows(join: &JoinTableSpec) -> String {
    format!("DELETE FROM {} WHERE {} = ?1", quoted(&join.name), quoted(&join.owner_column))
}

pub fn insert_join_row(join: &JoinTableSpec) -> String {
    format!(
        "INSERT OR IGNORE INTO {} ({}, {}) VALUES (?1, ?2)",
        quoted(&join.name),
        quoted(&join.owner_column),
        quoted(&join.target_column)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::FieldType;
    use crate::schema::{ColumnSpec, PhysicalType};
    use serde_json::json;

    fn invoice() -> EntityDescriptor {
        let col = |name: &str, physical| ColumnSpec {
            name: name.to_string(),
            field_name: Some(name.to_string()),
            field_type: Some(FieldType::Integer),
            physical,
            nullable: true,
            unique: false,
            primary_key: false,
            default: None,
            references: None,
            upload_to: None,
        };
        EntityDescriptor {
            name: "Invoice".into(),
            storage_name: "invoice".into(),
            columns: vec![
                ColumnSpec::primary_key(),
                col("amount", PhysicalType::Decimal { digits: 10, places: 2 }),
                col("paid", PhysicalType::Boolean),
            ],
            relations: vec![],
        }
    }

    #[test]
    fn list_ignores_unknown_filters_and_caps_limit() {
        let filters = vec![
            ("paid".to_string(), json!(true)),
            ("bogus".to_string(), json!(1)),
            ("amount".to_string(), Value::Null),
        ];
        let q = select_list(&invoice(), &filters, 5000, 10);
        assert_eq!(q.params, vec![json!(true)]);
        assert!(q.sql.contains("WHERE \"paid\" = ?1 AND \"amount\" IS NULL"));
        assert!(q.sql.ends_with("LIMIT 1000 OFFSET 10"));
    }

    #[test]
    fn insert_skips_pk_and_absent_columns() {
        let mut body = Map::new();
        body.insert("id".into(), json!(99));
        body.insert("paid".into(), json!(false));
        let q = insert(&invoice(), &body);
        assert!(q.sql.starts_with("INSERT INTO \"invoice\" (\"paid\") VALUES (?1)"));
        assert_eq!(q.params.len(), 1);

        let q = insert(&invoice(), &Map::new());
        assert!(q.sql.contains("DEFAULT VALUES"));
    }

    #[test]
    fn update_binds_id_last() {
        let mut body = Map::new();
        body.insert("amount".into(), json!(12.5));
        let q = update(&invoice(), 7, &body);
        assert!(q.sql.contains("SET \"amount\" = ?1 WHERE \"id\" = ?2"));
        assert_eq!(q.params, vec![json!(12.5), json!(7)]);
    }
}
