//! Admin handlers: definition metadata, table operations and backups.

use crate::admin::AdminOutcome;
use crate::definition::{NewEntity, NewField};
use crate::error::{AppError, EngineError};
use crate::response::{success_many, success_one, success_one_ok, with_status, SuccessOne};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use std::path::PathBuf;

/// Failed outcomes are reported with 422 and the same envelope.
fn outcome(o: AdminOutcome) -> (StatusCode, Json<SuccessOne<AdminOutcome>>) {
    let status = if o.success {
        StatusCode::OK
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };
    with_status(status, o)
}

pub async fn list_definitions(State(state): State<AppState>) -> Result<impl axum::response::IntoResponse, AppError> {
    let defs = state.engine.definitions.list_entities().await?;
    Ok(success_many(defs))
}

pub async fn create_definition(
    State(state): State<AppState>,
    Json(body): Json<NewEntity>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let def = state.engine.definitions.create_entity(body).await?;
    Ok(success_one(def))
}

pub async fn get_definition(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let def = state
        .engine
        .definitions
        .get_entity(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("entity definition {}", id)))?;
    Ok(success_one_ok(def))
}

/// Removes metadata only; a materialized table stays until dropped explicitly.
pub async fn delete_definition(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    state.engine.definitions.delete_entity(id).await?;
    Ok(success_one_ok(serde_json::json!({ "deleted": id })))
}

pub async fn add_field(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<NewField>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let field = state.engine.definitions.add_field(id, body).await?;
    Ok(success_one(field))
}

pub async fn create_table(State(state): State<AppState>, Path(id): Path<i64>) -> impl axum::response::IntoResponse {
    outcome(state.engine.admin.create_entity_table(id).await)
}

pub async fn update_table(State(state): State<AppState>, Path(id): Path<i64>) -> impl axum::response::IntoResponse {
    outcome(state.engine.admin.update_entity_table(id).await)
}

pub async fn drop_table(State(state): State<AppState>, Path(id): Path<i64>) -> impl axum::response::IntoResponse {
    outcome(state.engine.admin.drop_entity_table(id).await)
}

pub async fn schema(State(state): State<AppState>) -> impl axum::response::IntoResponse {
    outcome(state.engine.admin.schema_overview().await)
}

pub async fn list_backups(State(state): State<AppState>) -> impl axum::response::IntoResponse {
    outcome(state.engine.admin.list_backups().await)
}

#[derive(Debug, Deserialize)]
pub struct CreateBackupBody {
    #[serde(default = "manual_label")]
    pub label: String,
    #[serde(default)]
    pub entity: Option<String>,
}

fn manual_label() -> String {
    "manual".into()
}

pub async fn create_backup(
    State(state): State<AppState>,
    Json(body): Json<CreateBackupBody>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    if !crate::definition::validator::is_identifier(&body.label) {
        return Err(AppError::BadRequest("label must be an identifier".into()));
    }
    Ok(outcome(
        state.engine.admin.create_backup(&body.label, body.entity.as_deref()).await,
    ))
}

#[derive(Debug, Deserialize)]
pub struct RestoreBody {
    pub path: PathBuf,
}

/// Only snapshots inside the backup directory can be restored.
pub async fn restore_backup(
    State(state): State<AppState>,
    Json(body): Json<RestoreBody>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let dir = state.engine.backups.directory();
    let path = if body.path.is_absolute() {
        body.path
    } else {
        dir.join(&body.path)
    };
    let inside = match (tokio::fs::canonicalize(dir).await, tokio::fs::canonicalize(&path).await) {
        (Ok(d), Ok(p)) => p.starts_with(d),
        _ => false,
    };
    if !inside {
        return Err(AppError::Engine(EngineError::Restore(format!(
            "no backup at {}",
            path.display()
        ))));
    }
    Ok(outcome(state.engine.admin.restore_backup(&path).await))
}

#[derive(Debug, Default, Deserialize)]
pub struct CleanupBody {
    #[serde(default)]
    pub retention_days: Option<u32>,
}

pub async fn cleanup_backups(
    State(state): State<AppState>,
    body: Option<Json<CleanupBody>>,
) -> impl axum::response::IntoResponse {
    let days = body
        .and_then(|Json(b)| b.retention_days)
        .unwrap_or_else(|| state.engine.backups.retention_days());
    outcome(state.engine.admin.cleanup_backups(days).await)
}

pub async fn backup_status(State(state): State<AppState>) -> impl axum::response::IntoResponse {
    outcome(state.engine.admin.backup_status().await)
}
