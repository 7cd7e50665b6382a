//! Definition validation: identifiers, reserved names, type parameters, defaults, relation rules.

use crate::definition::{FieldType, NewEntity, NewField, OnDeleteAction, TypeParams};
use crate::error::DefinitionError;
use crate::schema::DefaultValue;
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

/// Field names that collide with accessor names on generic records.
pub const RESERVED_FIELD_NAMES: &[&str] = &["id", "pk", "save", "delete", "objects", "meta"];

/// Storage names with this prefix belong to the definition store.
pub const RESERVED_STORAGE_PREFIX: &str = "_sys_";

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static identifier pattern"))
}

pub fn is_identifier(s: &str) -> bool {
    identifier_re().is_match(s)
}

pub fn validate_entity(entity: &NewEntity, storage_name: &str) -> Result<(), DefinitionError> {
    if !is_identifier(&entity.name) {
        return Err(DefinitionError::entity(&entity.name, "name must be a valid identifier"));
    }
    if !is_identifier(storage_name) {
        return Err(DefinitionError::entity(
            &entity.name,
            format!("storage name '{}' must be a valid identifier", storage_name),
        ));
    }
    if storage_name.to_lowercase().starts_with(RESERVED_STORAGE_PREFIX) {
        return Err(DefinitionError::entity(
            &entity.name,
            format!("storage name may not start with '{}'", RESERVED_STORAGE_PREFIX),
        ));
    }
    let mut seen = HashSet::new();
    for f in &entity.fields {
        if !seen.insert(f.name.as_str()) {
            return Err(DefinitionError::Duplicate {
                kind: "field",
                value: format!("{}.{}", entity.name, f.name),
            });
        }
        validate_field(f)?;
    }
    Ok(())
}

/// Validate one field and return it normalized: relation attributes are cleared on
/// non-relational types.
pub fn validate_field(field: &NewField) -> Result<NewField, DefinitionError> {
    let name = field.name.as_str();
    if !is_identifier(name) {
        return Err(DefinitionError::field(name, "name must be a valid identifier"));
    }
    if RESERVED_FIELD_NAMES.contains(&name.to_lowercase().as_str()) {
        return Err(DefinitionError::field(name, "name is reserved"));
    }

    let mut out = field.clone();
    if field.field_type.is_relational() {
        let target = field
            .target_entity_name
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());
        if target.is_none() {
            return Err(DefinitionError::field(name, "relational fields require a target entity"));
        }
        if field.field_type.is_single_valued_relation() {
            match field.on_delete {
                None => {
                    return Err(DefinitionError::field(name, "single-valued relations require an on-delete action"));
                }
                Some(OnDeleteAction::SetNull) if field.required => {
                    return Err(DefinitionError::field(name, "set-null is not allowed on a required relation"));
                }
                Some(_) => {}
            }
        } else {
            if field.required {
                return Err(DefinitionError::field(name, "many-valued relations cannot be required"));
            }
            out.on_delete = None;
        }
        if let Some(inv) = field.inverse_name.as_deref().filter(|s| !s.is_empty()) {
            if !is_identifier(inv) {
                return Err(DefinitionError::field(name, "inverse name must be a valid identifier"));
            }
        }
        out.default_value = None;
    } else {
        out.target_entity_name = None;
        out.on_delete = None;
        out.inverse_name = None;
    }

    validate_type_params(name, field.field_type, &field.type_params)?;
    if let Some(raw) = out.default_value.as_deref().filter(|s| !s.is_empty()) {
        parse_default(name, field.field_type, raw)?;
    } else {
        out.default_value = None;
    }
    Ok(out)
}

/// Read an integer parameter; accepts JSON numbers and numeric strings.
pub(crate) fn int_param(field: &str, params: &TypeParams, key: &str) -> Result<Option<i64>, DefinitionError> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| DefinitionError::field(field, format!("{} must be an integer", key))),
        Some(serde_json::Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| DefinitionError::field(field, format!("{} must be a number", key))),
        Some(_) => Err(DefinitionError::field(field, format!("{} must be a number", key))),
    }
}

pub(crate) fn string_param<'a>(
    field: &str,
    params: &'a TypeParams,
    key: &str,
) -> Result<Option<&'a str>, DefinitionError> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(DefinitionError::field(field, format!("{} must be a string", key))),
    }
}

pub fn validate_type_params(field: &str, ty: FieldType, params: &TypeParams) -> Result<(), DefinitionError> {
    match ty {
        FieldType::ShortText => {
            if let Some(n) = int_param(field, params, "max_length")? {
                if n <= 0 {
                    return Err(DefinitionError::field(field, "max_length must be a positive number"));
                }
            }
        }
        FieldType::Decimal => {
            let digits = int_param(field, params, "max_digits")?;
            let places = int_param(field, params, "decimal_places")?;
            if let Some(d) = digits {
                if d <= 0 {
                    return Err(DefinitionError::field(field, "max_digits must be a positive number"));
                }
            }
            if let Some(p) = places {
                if p < 0 {
                    return Err(DefinitionError::field(field, "decimal_places cannot be negative"));
                }
                if p > digits.unwrap_or(DEFAULT_MAX_DIGITS) {
                    return Err(DefinitionError::field(field, "decimal_places cannot exceed max_digits"));
                }
            }
        }
        FieldType::File | FieldType::Image => {
            string_param(field, params, "upload_to")?;
        }
        _ => {}
    }
    Ok(())
}

pub(crate) const DEFAULT_MAX_LENGTH: i64 = 255;
pub(crate) const DEFAULT_MAX_DIGITS: i64 = 10;
pub(crate) const DEFAULT_DECIMAL_PLACES: i64 = 2;

/// Parse the string form of a default value per field type.
pub fn parse_default(field: &str, ty: FieldType, raw: &str) -> Result<DefaultValue, DefinitionError> {
    let raw = raw.trim();
    match ty {
        FieldType::Integer => raw
            .parse::<i64>()
            .map(DefaultValue::Integer)
            .map_err(|_| DefinitionError::field(field, format!("default '{}' is not an integer", raw))),
        FieldType::Decimal => {
            if raw.parse::<f64>().map(f64::is_finite).unwrap_or(false) {
                Ok(DefaultValue::Decimal(raw.to_string()))
            } else {
                Err(DefinitionError::field(field, format!("default '{}' is not a decimal", raw)))
            }
        }
        FieldType::Boolean => match raw.to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(DefaultValue::Boolean(true)),
            "false" | "0" | "no" => Ok(DefaultValue::Boolean(false)),
            _ => Err(DefinitionError::field(field, format!("default '{}' is not a boolean", raw))),
        },
        t if t.is_relational() => Err(DefinitionError::field(field, "relational fields cannot carry a default")),
        _ => Ok(DefaultValue::Text(raw.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field(name: &str, ty: FieldType) -> NewField {
        NewField::new(name, ty)
    }

    #[test]
    fn rejects_reserved_and_non_identifier_names() {
        assert!(validate_field(&field("id", FieldType::Integer)).is_err());
        assert!(validate_field(&field("Save", FieldType::Integer)).is_err());
        assert!(validate_field(&field("2fast", FieldType::Integer)).is_err());
        assert!(validate_field(&field("with space", FieldType::Integer)).is_err());
        assert!(validate_field(&field("total_2", FieldType::Integer)).is_ok());
    }

    #[test]
    fn decimal_params_are_checked() {
        let bad_places = field("amount", FieldType::Decimal)
            .param("max_digits", 4)
            .param("decimal_places", 6);
        assert!(validate_field(&bad_places).is_err());
        let negative = field("amount", FieldType::Decimal).param("decimal_places", -1);
        assert!(validate_field(&negative).is_err());
        let text = field("amount", FieldType::Decimal).param("max_digits", "ten");
        assert!(validate_field(&text).is_err());
        let ok = field("amount", FieldType::Decimal)
            .param("max_digits", "10")
            .param("decimal_places", 2);
        assert!(validate_field(&ok).is_ok());
    }

    #[test]
    fn max_length_must_be_positive_number() {
        assert!(validate_field(&field("title", FieldType::ShortText).param("max_length", 0)).is_err());
        assert!(validate_field(&field("title", FieldType::ShortText).param("max_length", json!([1]))).is_err());
        assert!(validate_field(&field("title", FieldType::ShortText).param("max_length", 80)).is_ok());
    }

    #[test]
    fn upload_to_must_be_string() {
        assert!(validate_field(&field("doc", FieldType::File).param("upload_to", 3)).is_err());
        assert!(validate_field(&field("doc", FieldType::File).param("upload_to", "docs/")).is_ok());
    }

    #[test]
    fn relation_rules() {
        let no_target = field("customer", FieldType::ReferenceOne);
        assert!(validate_field(&no_target).is_err());

        let mut no_action = field("customer", FieldType::ReferenceOne);
        no_action.target_entity_name = Some("Customer".into());
        assert!(validate_field(&no_action).is_err());

        let required_many = field("tags", FieldType::ReferenceMany)
            .references("Tag", OnDeleteAction::Cascade)
            .required();
        assert!(validate_field(&required_many).is_err());

        let set_null_required = field("customer", FieldType::ReferenceOne)
            .references("Customer", OnDeleteAction::SetNull)
            .required();
        assert!(validate_field(&set_null_required).is_err());

        let ok = field("customer", FieldType::ReferenceOne).references("Customer", OnDeleteAction::Protect);
        assert!(validate_field(&ok).is_ok());
    }

    #[test]
    fn relation_attributes_cleared_on_scalar_fields() {
        let mut f = field("title", FieldType::ShortText);
        f.target_entity_name = Some("Customer".into());
        f.on_delete = Some(OnDeleteAction::Cascade);
        let out = validate_field(&f).unwrap();
        assert!(out.target_entity_name.is_none());
        assert!(out.on_delete.is_none());
    }

    #[test]
    fn defaults_parse_per_type() {
        assert_eq!(parse_default("n", FieldType::Integer, "42").unwrap(), DefaultValue::Integer(42));
        assert!(parse_default("n", FieldType::Integer, "4.2").is_err());
        assert_eq!(parse_default("b", FieldType::Boolean, "Yes").unwrap(), DefaultValue::Boolean(true));
        assert!(parse_default("b", FieldType::Boolean, "maybe").is_err());
        assert_eq!(
            parse_default("d", FieldType::Decimal, "9.99").unwrap(),
            DefaultValue::Decimal("9.99".into())
        );
        assert!(validate_field(&field("n", FieldType::Integer).default_value("abc")).is_err());
    }

    #[test]
    fn entity_rejects_duplicate_fields_and_reserved_storage() {
        let entity = NewEntity {
            name: "Invoice".into(),
            fields: vec![field("paid", FieldType::Boolean), field("paid", FieldType::Boolean)],
            ..Default::default()
        };
        assert!(matches!(
            validate_entity(&entity, "invoice"),
            Err(DefinitionError::Duplicate { .. })
        ));
        let entity = NewEntity {
            name: "Sneaky".into(),
            ..Default::default()
        };
        assert!(validate_entity(&entity, "_sys_entities").is_err());
        assert!(validate_entity(&entity, "sneaky").is_ok());
    }
}
