// API server implementation using actix-web

use std::sync::Arc;
use std::time::Instant;

use crate::api::{auth, middleware, routes};
use crate::config::{AppConfig, ServerConfig};
use crate::database_ops::FacilityStore;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use sqlx::PgPool;

/// Shared, read-only state handed to every handler.
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn FacilityStore>,
    /// Present when the store is database-backed; used by the health probe.
    pub pool: Option<PgPool>,
    pub started: Instant,
}

impl AppState {
    pub fn new(config: AppConfig, store: Arc<dyn FacilityStore>, pool: Option<PgPool>) -> Self {
        Self {
            config,
            store,
            pool,
            started: Instant::now(),
        }
    }
}

pub struct ApiServer {
    config: ServerConfig,
}

impl ApiServer {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    pub fn from_env() -> Result<Self> {
        crate::util::env::init_env();
        Ok(Self::new(ServerConfig::from_env()?))
    }

    /// Bind and serve until shutdown.
    pub async fn run(self, state: AppState) -> Result<()> {
        let bind_addr = format!("{}:{}", self.config.host, self.config.port);

        tracing::info!(
            host = %self.config.host,
            port = self.config.port,
            table = %state.config.store.table,
            "starting cqc-gp-sync API server"
        );

        let state = web::Data::new(state);
        let api_secret = self.config.api_secret.clone();
        let allowed_origins = self.config.allowed_origins.clone();

        HttpServer::new(move || {
            let (logger, compress) = middleware::setup_middleware();
            let cors = middleware::setup_cors(&allowed_origins);
            let auth = auth::Auth::new(api_secret.clone());

            App::new()
                .app_data(state.clone())
                .app_data(middleware::json_config())
                .wrap(auth)
                .wrap(cors)
                .wrap(compress)
                .wrap(logger)
                .configure(routes::configure_routes)
        })
        .bind(&bind_addr)
        .with_context(|| format!("Failed to bind to {bind_addr}"))?
        .run()
        .await
        .context("HTTP server error")?;

        Ok(())
    }
}
