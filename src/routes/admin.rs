//! Admin routes: definitions, table materialization, schema overview, backups.

use crate::handlers::admin::{
    add_field, backup_status, cleanup_backups, create_backup, create_definition, create_table, delete_definition,
    drop_table, get_definition, list_backups, list_definitions, restore_backup, schema, update_table,
};
use crate::state::AppState;
use axum::{routing::get, routing::post, Router};

pub fn admin_routes(state: AppState) -> Router {
    Router::new()
        .route("/definitions", get(list_definitions).post(create_definition))
        .route("/definitions/:id", get(get_definition).delete(delete_definition))
        .route("/definitions/:id/fields", post(add_field))
        .route("/entities/:id/create_table", post(create_table))
        .route("/entities/:id/update_table", post(update_table))
        .route("/entities/:id/drop_table", post(drop_table))
        .route("/schema", get(schema))
        .route("/backups", get(list_backups).post(create_backup))
        .route("/backups/restore", post(restore_backup))
        .route("/backups/cleanup", post(cleanup_backups))
        .route("/backups/status", get(backup_status))
        .with_state(state)
}
