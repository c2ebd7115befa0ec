// HTTP API server binary: sync trigger and single-facility refresh endpoints

use std::sync::Arc;

use anyhow::Result;
use cqc_gp_sync::api::{ApiServer, AppState};
use cqc_gp_sync::config::AppConfig;
use cqc_gp_sync::database_ops::{Db, PgFacilityStore};
use cqc_gp_sync::logging::init_tracing;
use cqc_gp_sync::util::env as env_util;

#[actix_web::main]
async fn main() -> Result<()> {
    init_tracing("info,sqlx=warn")?;
    env_util::init_env();

    let server = ApiServer::from_env()?;
    let config = AppConfig::from_env()?;

    let database_url = env_util::db_url_prefer_session()?;
    let max_connections: u32 = env_util::env_parse("DB_MAX_CONNS", 10u32);
    let db = Db::connect(&database_url, max_connections).await?;
    tracing::info!(table = %config.store.table, "database connected");

    let store = Arc::new(PgFacilityStore::new(db.pool.clone(), config.store.table.clone()));
    server.run(AppState::new(config, store, Some(db.pool))).await
}
