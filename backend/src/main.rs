mod api;
mod config;
mod db;
mod errors;
mod fhe;
mod ledger;
mod models;
mod state;

use crate::config::Config;
use crate::errors::ApiError;
use crate::state::AppState;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from_env()?;

    // Local state (ledger, engine key) lives under DATA_DIR.
    std::fs::create_dir_all(&config.data_dir).map_err(|_| ApiError::Internal)?;

    let db = db::connect(&config.database_url, config.db_max_connections).await?;
    db::init_schema(&db).await?;

    let addr = config.addr.clone();
    let contract = config.contract_address.clone();
    let state = AppState::new(config, db).await?;

    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|_| ApiError::Internal)?;

    tracing::info!(%addr, %contract, "club backend listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|_| ApiError::Internal)?;

    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::warn!("failed to install ctrl-c handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
