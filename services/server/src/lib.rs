pub mod auth;
pub mod config;
pub mod connection;
pub mod data;
pub mod db;
pub mod error;
pub mod handler;
pub mod http;
pub mod repo;
pub mod state;
pub mod token;
pub mod ws;

pub use state::AppState;

use axum::Router;
use axum::routing::get;
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(http::health::health))
        .route("/devices/:device_id/ws/token", get(ws::get_ws_token))
        .route("/devices/:device_id/ws", get(ws::device_ws))
        .route("/data/timeseries", get(http::data::get_timeseries_route))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
