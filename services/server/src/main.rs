// server: Accepts device websocket connections and ingests their samples
// into the partitioned timeseries store.

use std::net::SocketAddr;
use std::sync::Arc;

use server::auth::{ApiTokenVerifier, DenyAllVerifier, Sha256TokenVerifier};
use server::config::{DatabaseSettings, EngineSettings};
use server::state::AppState;
use server::{build_router, db};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let database = match DatabaseSettings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            error!(error = %err, "invalid database configuration");
            std::process::exit(1);
        }
    };
    let engine = match EngineSettings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            error!(error = %err, "invalid pool configuration");
            std::process::exit(1);
        }
    };

    let pool = match db::create_pool(&database, &engine) {
        Ok(pool) => pool,
        Err(err) => {
            error!(error = %err, "invalid database URL");
            std::process::exit(1);
        }
    };
    if let Err(err) = db::run_migrations(&pool).await {
        // The pool is lazy; a database that is still starting up will be
        // picked up by the next request, but the schema must be in place.
        warn!(error = %err, "running migrations failed");
    } else {
        info!("migrations applied");
    }

    let verifier: Arc<dyn ApiTokenVerifier> = match Sha256TokenVerifier::from_env() {
        Some(verifier) => Arc::new(verifier),
        None => {
            warn!(
                "{} is not set; all API token requests will be rejected",
                server::auth::API_TOKEN_DIGEST_ENV
            );
            Arc::new(DenyAllVerifier)
        }
    };

    let edge_version = std::env::var("EDGE_VERSION")
        .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_owned());
    let state = AppState::new(pool, verifier, &edge_version);
    let router = build_router(state);

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_owned());
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(addr = %bind_addr, error = %err, "failed to bind");
            std::process::exit(1);
        }
    };
    info!(addr = %bind_addr, "server listening");

    if let Err(err) = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    {
        error!(error = %err, "server error");
        std::process::exit(1);
    }
}
