//! Persisted definition types: one row per entity in `_sys_entities`, one per field in `_sys_fields`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Open key/value map of type-specific settings (max_length, max_digits, decimal_places, upload_to).
pub type TypeParams = serde_json::Map<String, serde_json::Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldType {
    #[serde(alias = "char")]
    ShortText,
    #[serde(alias = "text")]
    LongText,
    Integer,
    Decimal,
    Boolean,
    Date,
    Datetime,
    Email,
    Url,
    File,
    Image,
    #[serde(alias = "foreign_key")]
    ReferenceOne,
    #[serde(alias = "many_to_many")]
    ReferenceMany,
    #[serde(alias = "one_to_one")]
    ReferenceOneToOne,
}

impl FieldType {
    pub const ALL: [FieldType; 14] = [
        FieldType::ShortText,
        FieldType::LongText,
        FieldType::Integer,
        FieldType::Decimal,
        FieldType::Boolean,
        FieldType::Date,
        FieldType::Datetime,
        FieldType::Email,
        FieldType::Url,
        FieldType::File,
        FieldType::Image,
        FieldType::ReferenceOne,
        FieldType::ReferenceMany,
        FieldType::ReferenceOneToOne,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::ShortText => "short-text",
            FieldType::LongText => "long-text",
            FieldType::Integer => "integer",
            FieldType::Decimal => "decimal",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Datetime => "datetime",
            FieldType::Email => "email",
            FieldType::Url => "url",
            FieldType::File => "file",
            FieldType::Image => "image",
            FieldType::ReferenceOne => "reference-one",
            FieldType::ReferenceMany => "reference-many",
            FieldType::ReferenceOneToOne => "reference-one-to-one",
        }
    }

    pub fn is_relational(&self) -> bool {
        matches!(
            self,
            FieldType::ReferenceOne | FieldType::ReferenceMany | FieldType::ReferenceOneToOne
        )
    }

    /// Single-valued relations live as a column on the owner table.
    pub fn is_single_valued_relation(&self) -> bool {
        matches!(self, FieldType::ReferenceOne | FieldType::ReferenceOneToOne)
    }

    pub fn is_text_like(&self) -> bool {
        matches!(
            self,
            FieldType::ShortText | FieldType::LongText | FieldType::Email | FieldType::Url
        )
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        let normalized = match lower.as_str() {
            "char" => "short-text",
            "text" => "long-text",
            "foreign_key" => "reference-one",
            "many_to_many" => "reference-many",
            "one_to_one" => "reference-one-to-one",
            other => other,
        };
        FieldType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| format!("unknown field type: {}", s))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnDeleteAction {
    #[serde(alias = "CASCADE")]
    Cascade,
    #[serde(alias = "PROTECT")]
    Protect,
    #[serde(alias = "SET_NULL")]
    SetNull,
    #[serde(alias = "SET_DEFAULT")]
    SetDefault,
    #[serde(alias = "DO_NOTHING")]
    NoAction,
}

impl OnDeleteAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnDeleteAction::Cascade => "cascade",
            OnDeleteAction::Protect => "protect",
            OnDeleteAction::SetNull => "set-null",
            OnDeleteAction::SetDefault => "set-default",
            OnDeleteAction::NoAction => "no-action",
        }
    }

    /// Referential action clause for the storage engine.
    pub fn sql(&self) -> &'static str {
        match self {
            OnDeleteAction::Cascade => "CASCADE",
            OnDeleteAction::Protect => "RESTRICT",
            OnDeleteAction::SetNull => "SET NULL",
            OnDeleteAction::SetDefault => "SET DEFAULT",
            OnDeleteAction::NoAction => "NO ACTION",
        }
    }
}

impl FromStr for OnDeleteAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "cascade" => Ok(OnDeleteAction::Cascade),
            "protect" => Ok(OnDeleteAction::Protect),
            "set-null" => Ok(OnDeleteAction::SetNull),
            "set-default" => Ok(OnDeleteAction::SetDefault),
            "no-action" | "do-nothing" => Ok(OnDeleteAction::NoAction),
            _ => Err(format!("unknown on-delete action: {}", s)),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub id: i64,
    pub entity_id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub required: bool,
    pub unique: bool,
    pub default_value: Option<String>,
    pub type_params: TypeParams,
    pub target_entity_name: Option<String>,
    pub on_delete: Option<OnDeleteAction>,
    pub inverse_name: Option<String>,
    pub position: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityDefinition {
    pub id: i64,
    pub name: String,
    pub storage_name: String,
    pub description: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Ordered by `position`, then insertion id.
    pub fields: Vec<FieldDefinition>,
}

impl EntityDefinition {
    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Input for creating or replacing an entity definition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewEntity {
    pub name: String,
    /// Defaults to the snake_case form of `name`.
    #[serde(default)]
    pub storage_name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub fields: Vec<NewField>,
}

impl NewEntity {
    pub fn new(name: &str) -> Self {
        NewEntity {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn field(mut self, field: NewField) -> Self {
        self.fields.push(field);
        self
    }
}

impl Default for NewEntity {
    fn default() -> Self {
        NewEntity {
            name: String::new(),
            storage_name: None,
            description: String::new(),
            active: true,
            fields: Vec::new(),
        }
    }
}

/// Input for one field. `position` defaults to the end of the entity's field list.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub type_params: TypeParams,
    #[serde(default)]
    pub target_entity_name: Option<String>,
    #[serde(default)]
    pub on_delete: Option<OnDeleteAction>,
    #[serde(default)]
    pub inverse_name: Option<String>,
    #[serde(default)]
    pub position: Option<i64>,
}

impl NewField {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        NewField {
            name: name.to_string(),
            field_type,
            required: false,
            unique: false,
            default_value: None,
            type_params: TypeParams::new(),
            target_entity_name: None,
            on_delete: None,
            inverse_name: None,
            position: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn default_value(mut self, value: &str) -> Self {
        self.default_value = Some(value.to_string());
        self
    }

    pub fn param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.type_params.insert(key.to_string(), value.into());
        self
    }

    pub fn references(mut self, target: &str, on_delete: OnDeleteAction) -> Self {
        self.target_entity_name = Some(target.to_string());
        if self.field_type.is_single_valued_relation() {
            self.on_delete = Some(on_delete);
        }
        self
    }
}

impl From<&FieldDefinition> for NewField {
    fn from(f: &FieldDefinition) -> Self {
        NewField {
            name: f.name.clone(),
            field_type: f.field_type,
            required: f.required,
            unique: f.unique,
            default_value: f.default_value.clone(),
            type_params: f.type_params.clone(),
            target_entity_name: f.target_entity_name.clone(),
            on_delete: f.on_delete,
            inverse_name: f.inverse_name.clone(),
            position: Some(f.position),
        }
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_type_accepts_legacy_names() {
        assert_eq!("char".parse::<FieldType>().unwrap(), FieldType::ShortText);
        assert_eq!("foreign_key".parse::<FieldType>().unwrap(), FieldType::ReferenceOne);
        assert_eq!("reference-many".parse::<FieldType>().unwrap(), FieldType::ReferenceMany);
        assert!("blob".parse::<FieldType>().is_err());
    }

    #[test]
    fn field_type_serde_uses_kebab_case() {
        let v = serde_json::to_value(FieldType::ReferenceOneToOne).unwrap();
        assert_eq!(v, serde_json::json!("reference-one-to-one"));
        let t: FieldType = serde_json::from_value(serde_json::json!("text")).unwrap();
        assert_eq!(t, FieldType::LongText);
    }

    #[test]
    fn on_delete_parses_both_spellings() {
        assert_eq!("SET_NULL".parse::<OnDeleteAction>().unwrap(), OnDeleteAction::SetNull);
        assert_eq!("no-action".parse::<OnDeleteAction>().unwrap(), OnDeleteAction::NoAction);
        assert_eq!(OnDeleteAction::Protect.sql(), "RESTRICT");
    }
}
