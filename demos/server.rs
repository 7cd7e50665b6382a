//! Example server: opens the configured SQLite database and serves the data and admin routes.
//!
//! Run: `cargo run --example server`
//! Settings come from `DYNAMIC_ENTITIES_*` variables (a `.env` file is honoured).

use dynamic_entities::{app, AppState, Engine, EngineSettings};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;

const BODY_LIMIT_BYTES: usize = 1024 * 1024;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("dynamic_entities=info")),
        )
        .init();

    let settings = EngineSettings::from_env();
    let engine = Engine::open(&settings).await?;
    tracing::info!(
        database = %settings.database,
        entities = engine.registry.names().len(),
        "engine ready"
    );

    let app = app(AppState::new(engine)).layer(ServiceBuilder::new().layer(RequestBodyLimitLayer::new(BODY_LIMIT_BYTES)));
    let listener = TcpListener::bind(&settings.bind).await?;
    tracing::info!("listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
