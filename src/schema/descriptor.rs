//! Synthesized entity structure: definitions flattened into concrete column specs for DDL and generic access.

use crate::definition::{FieldType, OnDeleteAction};
use crate::schema::introspect::LiveColumn;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

/// Name of the implicit primary-key column.
pub const PK_COLUMN: &str = "id";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhysicalType {
    Varchar { max_length: u32 },
    Text,
    Integer,
    Decimal { digits: u32, places: u32 },
    Boolean,
    Date,
    DateTime,
}

impl PhysicalType {
    /// Declared type as written into DDL. SQLite keeps it verbatim in the catalog.
    pub fn sql(&self) -> String {
        match self {
            PhysicalType::Varchar { max_length } => format!("VARCHAR({})", max_length),
            PhysicalType::Text => "TEXT".into(),
            PhysicalType::Integer => "INTEGER".into(),
            PhysicalType::Decimal { digits, places } => format!("DECIMAL({}, {})", digits, places),
            PhysicalType::Boolean => "BOOL".into(),
            PhysicalType::Date => "DATE".into(),
            PhysicalType::DateTime => "DATETIME".into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DefaultValue {
    Integer(i64),
    /// Kept as validated text so no precision is lost.
    Decimal(String),
    Boolean(bool),
    Text(String),
}

impl DefaultValue {
    pub fn sql_literal(&self) -> String {
        match self {
            DefaultValue::Integer(n) => n.to_string(),
            DefaultValue::Decimal(s) => s.clone(),
            DefaultValue::Boolean(b) => if *b { "1".into() } else { "0".into() },
            DefaultValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            DefaultValue::Integer(n) => serde_json::Value::from(*n),
            DefaultValue::Decimal(s) => s
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(serde_json::Value::Number)
                .unwrap_or_else(|| serde_json::Value::String(s.clone())),
            DefaultValue::Boolean(b) => serde_json::Value::Bool(*b),
            DefaultValue::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
    pub on_delete: OnDeleteAction,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ColumnSpec {
    /// Physical column name (`<field>_id` for single-valued relations).
    pub name: String,
    /// Declaring field; None for the implicit primary key.
    pub field_name: Option<String>,
    pub field_type: Option<FieldType>,
    pub physical: PhysicalType,
    pub nullable: bool,
    pub unique: bool,
    pub primary_key: bool,
    pub default: Option<DefaultValue>,
    pub references: Option<ForeignKey>,
    /// Storage directory for file and image fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_to: Option<String>,
}

impl ColumnSpec {
    pub fn primary_key() -> Self {
        ColumnSpec {
            name: PK_COLUMN.into(),
            field_name: None,
            field_type: None,
            physical: PhysicalType::Integer,
            nullable: false,
            unique: true,
            primary_key: true,
            default: None,
            references: None,
            upload_to: None,
        }
    }
}

/// Entity outside the dynamic set that relations may target (e.g. `auth.User`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExternalEntity {
    pub namespace: String,
    pub name: String,
    pub storage_name: String,
}

impl ExternalEntity {
    pub fn new(namespace: &str, name: &str, storage_name: &str) -> Self {
        ExternalEntity {
            namespace: namespace.into(),
            name: name.into(),
            storage_name: storage_name.into(),
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ResolvedTarget {
    Entity(Arc<EntityDescriptor>),
    External(ExternalEntity),
}

impl ResolvedTarget {
    pub fn name(&self) -> String {
        match self {
            ResolvedTarget::Entity(d) => d.name.clone(),
            ResolvedTarget::External(e) => e.qualified_name(),
        }
    }

    pub fn storage_name(&self) -> &str {
        match self {
            ResolvedTarget::Entity(d) => &d.storage_name,
            ResolvedTarget::External(e) => &e.storage_name,
        }
    }
}

impl Serialize for ResolvedTarget {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut st = serializer.serialize_struct("ResolvedTarget", 3)?;
        let kind = match self {
            ResolvedTarget::Entity(_) => "entity",
            ResolvedTarget::External(_) => "external",
        };
        st.serialize_field("kind", kind)?;
        st.serialize_field("name", &self.name())?;
        st.serialize_field("storage_name", self.storage_name())?;
        st.end()
    }
}

/// Resolution state of one relational field. `Forward` targets are re-resolved when they materialize.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "state", content = "target", rename_all = "snake_case")]
pub enum Resolution {
    Resolved(ResolvedTarget),
    Forward(String),
}

impl Resolution {
    pub fn is_forward(&self) -> bool {
        matches!(self, Resolution::Forward(_))
    }

    pub fn target_name(&self) -> String {
        match self {
            Resolution::Resolved(t) => t.name(),
            Resolution::Forward(name) => name.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JoinTableSpec {
    pub name: String,
    pub owner_table: String,
    pub owner_column: String,
    pub target_table: String,
    pub target_column: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RelationSpec {
    pub field_name: String,
    pub kind: FieldType,
    pub resolution: Resolution,
    pub on_delete: Option<OnDeleteAction>,
    pub inverse_name: Option<String>,
    /// Owner-table column for single-valued relations.
    pub column: Option<String>,
    /// Join table for many-valued relations.
    pub join_table: Option<JoinTableSpec>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EntityDescriptor {
    pub name: String,
    pub storage_name: String,
    /// Implicit primary key first, then fields in declared order.
    pub columns: Vec<ColumnSpec>,
    pub relations: Vec<RelationSpec>,
}

impl EntityDescriptor {
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Column backing a field, accepting either the field name or the column name.
    pub fn column_for_input(&self, key: &str) -> Option<&ColumnSpec> {
        self.column(key)
            .or_else(|| self.columns.iter().find(|c| c.field_name.as_deref() == Some(key)))
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn relation(&self, field_name: &str) -> Option<&RelationSpec> {
        self.relations.iter().find(|r| r.field_name == field_name)
    }

    pub fn join_tables(&self) -> impl Iterator<Item = &JoinTableSpec> {
        self.relations.iter().filter_map(|r| r.join_table.as_ref())
    }

    pub fn many_relations(&self) -> impl Iterator<Item = &RelationSpec> {
        self.relations.iter().filter(|r| r.join_table.is_some())
    }

    pub fn has_forward_references(&self) -> bool {
        self.relations.iter().any(|r| r.resolution.is_forward())
    }

    /// The part of this descriptor the live table can serve: columns present in `live` (the primary
    /// key always) and relations whose column or join table exists. Also returns the fields left out,
    /// i.e. saved in the definition but not yet applied by an update.
    pub fn restrict_to_live(&self, live: &[LiveColumn], tables: &HashSet<String>) -> (EntityDescriptor, Vec<String>) {
        let live: HashSet<&str> = live.iter().map(|c| c.name.as_str()).collect();
        let mut pending = Vec::new();
        let columns = self
            .columns
            .iter()
            .filter(|c| {
                let keep = c.primary_key || live.contains(c.name.as_str());
                if !keep {
                    pending.push(c.field_name.clone().unwrap_or_else(|| c.name.clone()));
                }
                keep
            })
            .cloned()
            .collect();
        let relations = self
            .relations
            .iter()
            .filter(|r| {
                let keep = match (&r.column, &r.join_table) {
                    (Some(col), _) => live.contains(col.as_str()),
                    (None, Some(join)) => tables.contains(&join.name),
                    (None, None) => true,
                };
                if !keep && !pending.contains(&r.field_name) {
                    pending.push(r.field_name.clone());
                }
                keep
            })
            .cloned()
            .collect();
        let restricted = EntityDescriptor {
            name: self.name.clone(),
            storage_name: self.storage_name.clone(),
            columns,
            relations,
        };
        (restricted, pending)
    }

    /// True when any relation targets `entity`, resolved or forward.
    pub fn references_entity(&self, entity: &str) -> bool {
        self.relations.iter().any(|r| match &r.resolution {
            Resolution::Forward(name) => name == entity,
            Resolution::Resolved(ResolvedTarget::Entity(d)) => d.name == entity,
            Resolution::Resolved(ResolvedTarget::External(_)) => false,
        })
    }
}
