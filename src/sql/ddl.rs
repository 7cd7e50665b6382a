//! DDL text for SQLite. Identifiers come from validated definitions only; literals are escaped.

use crate::schema::{ColumnSpec, EntityDescriptor, JoinTableSpec};

/// Quote identifier for SQLite.
pub fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// One column clause as used by CREATE TABLE.
pub fn column_definition(c: &ColumnSpec) -> String {
    if c.primary_key {
        return format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", quoted(&c.name));
    }
    let mut def = format!("{} {}", quoted(&c.name), c.physical.sql());
    if !c.nullable {
        def.push_str(" NOT NULL");
    }
    if c.unique {
        def.push_str(" UNIQUE");
    }
    push_default_and_reference(&mut def, c);
    def
}

fn push_default_and_reference(def: &mut String, c: &ColumnSpec) {
    if let Some(ref d) = c.default {
        def.push_str(" DEFAULT ");
        def.push_str(&d.sql_literal());
    }
    if let Some(ref fk) = c.references {
        def.push_str(&format!(
            " REFERENCES {} ({}) ON DELETE {}",
            quoted(&fk.table),
            quoted(&fk.column),
            fk.on_delete.sql()
        ));
    }
}

/// CREATE TABLE for the entity table. Fails when the table exists.
pub fn create_table(d: &EntityDescriptor) -> String {
    let col_defs: Vec<String> = d.columns.iter().map(column_definition).collect();
    format!("CREATE TABLE {} (\n  {}\n)", quoted(&d.storage_name), col_defs.join(",\n  "))
}

/// Join table for a many-valued relation; both sides cascade and each pair appears once.
pub fn create_join_table(j: &JoinTableSpec) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n  \"id\" INTEGER PRIMARY KEY AUTOINCREMENT,\n  {} INTEGER NOT NULL REFERENCES {} (\"id\") ON DELETE CASCADE,\n  {} INTEGER NOT NULL REFERENCES {} (\"id\") ON DELETE CASCADE,\n  UNIQUE ({}, {})\n)",
        quoted(&j.name),
        quoted(&j.owner_column),
        quoted(&j.owner_table),
        quoted(&j.target_column),
        quoted(&j.target_table),
        quoted(&j.owner_column),
        quoted(&j.target_column),
    )
}

pub fn unique_index_name(table: &str, column: &str) -> String {
    format!("ux_{}_{}", table, column)
}

/// Statements adding one column to an existing table. SQLite cannot ADD COLUMN ... UNIQUE,
/// so uniqueness becomes a separate unique index.
pub fn add_column(table: &str, c: &ColumnSpec) -> Vec<String> {
    let mut def = format!("{} {}", quoted(&c.name), c.physical.sql());
    if !c.nullable {
        def.push_str(" NOT NULL");
    }
    push_default_and_reference(&mut def, c);
    let mut stmts = vec![format!("ALTER TABLE {} ADD COLUMN {}", quoted(table), def)];
    if c.unique {
        stmts.push(format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({})",
            quoted(&unique_index_name(table, &c.name)),
            quoted(table),
            quoted(&c.name)
        ));
    }
    stmts
}

pub fn drop_column(table: &str, column: &str) -> String {
    format!("ALTER TABLE {} DROP COLUMN {}", quoted(table), quoted(column))
}

pub fn drop_table(table: &str) -> String {
    format!("DROP TABLE {}", quoted(table))
}

pub fn drop_table_if_exists(table: &str) -> String {
    format!("DROP TABLE IF EXISTS {}", quoted(table))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{FieldType, OnDeleteAction};
    use crate::schema::{DefaultValue, ForeignKey, PhysicalType};

    fn col(name: &str, physical: PhysicalType) -> ColumnSpec {
        ColumnSpec {
            name: name.into(),
            field_name: Some(name.into()),
            field_type: Some(FieldType::Integer),
            physical,
            nullable: true,
            unique: false,
            primary_key: false,
            default: None,
            references: None,
            upload_to: None,
        }
    }

    #[test]
    fn create_table_lists_pk_then_columns() {
        let mut paid = col("paid", PhysicalType::Boolean);
        paid.nullable = false;
        paid.default = Some(DefaultValue::Boolean(false));
        let d = EntityDescriptor {
            name: "Invoice".into(),
            storage_name: "invoice".into(),
            columns: vec![
                ColumnSpec::primary_key(),
                col("amount", PhysicalType::Decimal { digits: 10, places: 2 }),
                paid,
            ],
            relations: vec![],
        };
        let sql = create_table(&d);
        assert!(sql.starts_with("CREATE TABLE \"invoice\""));
        assert!(sql.contains("\"id\" INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(sql.contains("\"amount\" DECIMAL(10, 2)"));
        assert!(sql.contains("\"paid\" BOOL NOT NULL DEFAULT 0"));
    }

    #[test]
    fn unique_added_column_becomes_index() {
        let mut code = col("code", PhysicalType::Varchar { max_length: 20 });
        code.unique = true;
        let stmts = add_column("item", &code);
        assert_eq!(stmts.len(), 2);
        assert!(!stmts[0].contains("UNIQUE"));
        assert!(stmts[1].starts_with("CREATE UNIQUE INDEX"));
    }

    #[test]
    fn reference_clause_and_quote_escaping() {
        let mut fk = col("customer_id", PhysicalType::Integer);
        fk.references = Some(ForeignKey {
            table: "customer".into(),
            column: "id".into(),
            on_delete: OnDeleteAction::Protect,
        });
        assert!(column_definition(&fk).ends_with("REFERENCES \"customer\" (\"id\") ON DELETE RESTRICT"));
        assert_eq!(quoted("we\"ird"), "\"we\"\"ird\"");
    }
}
