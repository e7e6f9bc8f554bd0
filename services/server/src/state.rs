use std::sync::Arc;

use sqlx::PgPool;

use crate::auth::ApiTokenVerifier;
use crate::connection::ConnectionManager;
use crate::token::TokenService;
use crate::ws::ServerWebsocketChannel;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub connections: Arc<ConnectionManager<ServerWebsocketChannel>>,
    pub verifier: Arc<dyn ApiTokenVerifier>,
    pub tokens: Arc<TokenService>,
}

impl AppState {
    pub fn new(pool: PgPool, verifier: Arc<dyn ApiTokenVerifier>, edge_version: &str) -> Self {
        AppState {
            pool,
            connections: Arc::new(ConnectionManager::new(edge_version)),
            verifier,
            tokens: Arc::new(TokenService::new()),
        }
    }
}
