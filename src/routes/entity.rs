//! Record CRUD routes. The first segment names a registered entity (name or storage name).

use crate::handlers::entity::{create, delete as delete_handler, list, read, update};
use crate::state::AppState;
use axum::{routing::get, Router};

pub fn entity_routes(state: AppState) -> Router {
    Router::new()
        .route("/:entity", get(list).post(create))
        .route("/:entity/:id", get(read).patch(update).delete(delete_handler))
        .with_state(state)
}
