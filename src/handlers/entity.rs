//! Record CRUD handlers for registered entities: list, create, read, update, delete.

use crate::error::AppError;
use crate::registry::EntityAccessor;
use crate::response::{success_many, success_one, success_one_ok};
use crate::service::CrudService;
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Match the path segment against entity names, then storage names.
fn accessor_for(state: &AppState, segment: &str) -> Result<Arc<EntityAccessor>, AppError> {
    let registry = &state.engine.registry;
    if let Some(a) = registry.accessor(segment) {
        return Ok(a);
    }
    registry
        .snapshot()
        .values()
        .find(|d| d.storage_name == segment || d.name.eq_ignore_ascii_case(segment))
        .and_then(|d| registry.accessor(&d.name))
        .ok_or_else(|| AppError::NotFound(format!("entity '{}'", segment)))
}

fn parse_id(id_str: &str) -> Result<i64, AppError> {
    id_str.parse().map_err(|_| AppError::BadRequest("invalid id".into()))
}

fn body_to_map(value: Value) -> Result<Map<String, Value>, AppError> {
    match value {
        Value::Object(m) => Ok(m),
        _ => Err(AppError::BadRequest("body must be a JSON object".into())),
    }
}

pub async fn list(
    State(state): State<AppState>,
    Path(entity): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let accessor = accessor_for(&state, &entity)?;
    let mut limit: Option<u32> = None;
    let mut offset: Option<u32> = None;
    let mut filters = Vec::new();
    for (k, v) in params {
        match k.as_str() {
            "limit" => limit = v.parse().ok(),
            "offset" => offset = v.parse().ok(),
            _ => filters.push((k, v)),
        }
    }
    filters.sort();
    let rows = CrudService::list(&state.pool(), &accessor, &filters, limit, offset).await?;
    Ok(success_many(rows))
}

pub async fn create(
    State(state): State<AppState>,
    Path(entity): Path<String>,
    Json(body): Json<Value>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let accessor = accessor_for(&state, &entity)?;
    let body = body_to_map(body)?;
    let row = CrudService::create(&state.pool(), &accessor, &body).await?;
    Ok(success_one(row))
}

pub async fn read(
    State(state): State<AppState>,
    Path((entity, id)): Path<(String, String)>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let accessor = accessor_for(&state, &entity)?;
    let id = parse_id(&id)?;
    let row = CrudService::get(&state.pool(), &accessor, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("{} {}", accessor.descriptor.name, id)))?;
    Ok(success_one_ok(row))
}

pub async fn update(
    State(state): State<AppState>,
    Path((entity, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let accessor = accessor_for(&state, &entity)?;
    let id = parse_id(&id)?;
    let body = body_to_map(body)?;
    let row = CrudService::update(&state.pool(), &accessor, id, &body)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("{} {}", accessor.descriptor.name, id)))?;
    Ok(success_one_ok(row))
}

pub async fn delete(
    State(state): State<AppState>,
    Path((entity, id)): Path<(String, String)>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let accessor = accessor_for(&state, &entity)?;
    let id = parse_id(&id)?;
    let row = CrudService::delete(&state.pool(), &accessor, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("{} {}", accessor.descriptor.name, id)))?;
    Ok(success_one_ok(row))
}
