//! Router assembly: common, record and admin routes.

pub mod admin;
pub mod common;
pub mod entity;

pub use admin::admin_routes;
pub use common::common_routes_with_ready;
pub use entity::entity_routes;

use crate::state::AppState;
use axum::Router;

/// Full application: `/health`, `/ready`, `/version`, `/data/...` and `/admin/...`.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(common_routes_with_ready(state.clone()))
        .nest("/data", entity_routes(state.clone()))
        .nest("/admin", admin_routes(state))
}
