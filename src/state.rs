//! Shared application state for all routes.

use crate::engine::Engine;
use sqlx::SqlitePool;

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        AppState { engine }
    }

    /// Current pool; replaced after a restore, so never cache it.
    pub fn pool(&self) -> SqlitePool {
        self.engine.storage.pool()
    }
}
