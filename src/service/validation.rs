//! Record validation and coercion from the entity descriptor.

use crate::definition::FieldType;
use crate::error::AppError;
use crate::schema::{ColumnSpec, EntityDescriptor, JoinTableSpec, PhysicalType};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;
use serde_json::{Map, Number, Value};
use std::sync::OnceLock;

/// Column values keyed by column name, plus id lists for many-valued relations.
#[derive(Debug, Default)]
pub struct PreparedRecord {
    pub columns: Map<String, Value>,
    pub many: Vec<(JoinTableSpec, Vec<i64>)>,
}

pub struct RecordValidator;

impl RecordValidator {
    /// Validate and coerce a create/update body. Keys may be field names or column names.
    /// With `partial`, required columns are only checked when present.
    pub fn prepare(entity: &EntityDescriptor, body: &Map<String, Value>, partial: bool) -> Result<PreparedRecord, AppError> {
        let mut out = PreparedRecord::default();
        for (key, v) in body {
            if key == crate::schema::PK_COLUMN {
                continue;
            }
            if let Some(col) = entity.column_for_input(key) {
                let coerced = coerce(col, v)?;
                if coerced.is_null() && !col.nullable {
                    return Err(AppError::Validation(format!("{} is required", key)));
                }
                out.columns.insert(col.name.clone(), coerced);
                continue;
            }
            if let Some(join) = entity.relation(key).and_then(|r| r.join_table.as_ref()) {
                out.many.push((join.clone(), id_list(key, v)?));
                continue;
            }
            return Err(AppError::Validation(format!("unknown field: {}", key)));
        }
        if !partial {
            for col in &entity.columns {
                if col.primary_key || col.nullable || col.default.is_some() {
                    continue;
                }
                if !out.columns.contains_key(&col.name) {
                    let name = col.field_name.as_deref().unwrap_or(&col.name);
                    return Err(AppError::Validation(format!("{} is required", name)));
                }
            }
        }
        Ok(out)
    }

    /// Coerce query-string filters; unknown keys are dropped.
    pub fn filters(entity: &EntityDescriptor, raw: &[(String, String)]) -> Result<Vec<(String, Value)>, AppError> {
        let mut out = Vec::new();
        for (key, s) in raw {
            let Some(col) = entity.column_for_input(key) else { continue };
            let v = if s.eq_ignore_ascii_case("null") {
                Value::Null
            } else if col.primary_key {
                coerce_integer(key, &Value::String(s.clone()))?
            } else {
                coerce(col, &Value::String(s.clone()))?
            };
            out.push((col.name.clone(), v));
        }
        Ok(out)
    }
}

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("static email pattern"))
}

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?i)(https?|ftps?)://[^\s/$.?#][^\s]*$").expect("static url pattern"))
}

fn invalid(col: &str, what: &str) -> AppError {
    AppError::Validation(format!("{} must be {}", col, what))
}

fn coerce(col: &ColumnSpec, v: &Value) -> Result<Value, AppError> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    let name = col.field_name.as_deref().unwrap_or(&col.name);
    let value = match col.physical {
        PhysicalType::Integer => coerce_integer(name, v)?,
        PhysicalType::Decimal { digits, places } => coerce_decimal(name, v, digits, places)?,
        PhysicalType::Boolean => coerce_bool(name, v)?,
        PhysicalType::Date => {
            let s = v.as_str().ok_or_else(|| invalid(name, "a date string"))?;
            let d = NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| invalid(name, "a date (YYYY-MM-DD)"))?;
            Value::String(d.format("%Y-%m-%d").to_string())
        }
        PhysicalType::DateTime => {
            let s = v.as_str().ok_or_else(|| invalid(name, "a datetime string"))?;
            Value::String(parse_datetime(s.trim()).ok_or_else(|| invalid(name, "an ISO-8601 datetime"))?)
        }
        PhysicalType::Varchar { .. } | PhysicalType::Text => {
            let s = v.as_str().ok_or_else(|| invalid(name, "a string"))?;
            Value::String(s.to_string())
        }
    };
    if let (PhysicalType::Varchar { max_length }, Some(s)) = (&col.physical, value.as_str()) {
        if s.chars().count() > *max_length as usize {
            return Err(AppError::Validation(format!(
                "{} must be at most {} characters",
                name, max_length
            )));
        }
    }
    match (col.field_type, value.as_str()) {
        (Some(FieldType::Email), Some(s)) if !email_re().is_match(s) => Err(invalid(name, "a valid email")),
        (Some(FieldType::Url), Some(s)) if !url_re().is_match(s) => Err(invalid(name, "a valid URL")),
        _ => Ok(value),
    }
}

fn coerce_integer(name: &str, v: &Value) -> Result<Value, AppError> {
    match v {
        Value::Number(n) if n.is_i64() => Ok(v.clone()),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| invalid(name, "an integer")),
        _ => Err(invalid(name, "an integer")),
    }
}

fn coerce_decimal(name: &str, v: &Value, digits: u32, places: u32) -> Result<Value, AppError> {
    let text = match v {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return Err(invalid(name, "a decimal number")),
    };
    let f: f64 = text.parse().map_err(|_| invalid(name, "a decimal number"))?;
    if !f.is_finite() {
        return Err(invalid(name, "a finite number"));
    }
    let unsigned = text.trim_start_matches(['-', '+']);
    let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    let int_digits = int_part.trim_start_matches('0').len() as u32;
    if !text.contains(['e', 'E']) {
        if frac_part.trim_end_matches('0').len() as u32 > places {
            return Err(AppError::Validation(format!("{} allows at most {} decimal places", name, places)));
        }
        if int_digits > digits.saturating_sub(places) {
            return Err(AppError::Validation(format!("{} allows at most {} digits", name, digits)));
        }
    }
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| invalid(name, "a finite number"))
}

fn coerce_bool(name: &str, v: &Value) -> Result<Value, AppError> {
    match v {
        Value::Bool(_) => Ok(v.clone()),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Ok(Value::Bool(false)),
            Some(1) => Ok(Value::Bool(true)),
            _ => Err(invalid(name, "a boolean")),
        },
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(Value::Bool(true)),
            "false" | "0" | "no" => Ok(Value::Bool(false)),
            _ => Err(invalid(name, "a boolean")),
        },
        _ => Err(invalid(name, "a boolean")),
    }
}

/// Normalized to `YYYY-MM-DD HH:MM:SS[.f]`, UTC when an offset is given.
fn parse_datetime(s: &str) -> Option<String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc().format("%Y-%m-%d %H:%M:%S%.f").to_string());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S%.f").to_string())
}

fn id_list(key: &str, v: &Value) -> Result<Vec<i64>, AppError> {
    match v {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .iter()
            .map(|i| match coerce_integer(key, i)? {
                Value::Number(n) => n.as_i64().ok_or_else(|| invalid(key, "a list of ids")),
                _ => Err(invalid(key, "a list of ids")),
            })
            .collect(),
        _ => Err(invalid(key, "a list of ids")),
    }
}
