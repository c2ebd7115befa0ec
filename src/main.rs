use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use cqc_gp_sync::config::AppConfig;
use cqc_gp_sync::cqc::CqcApiClient;
use cqc_gp_sync::database_ops::{db, Db, FacilityStore, PgFacilityStore};
use cqc_gp_sync::logging::init_tracing;
use cqc_gp_sync::nhs::{OdsClient, PrescribingClient};
use cqc_gp_sync::sync::facility::{self, CqcDetailsRequest, NhsDataRequest, NhsSources};
use cqc_gp_sync::sync::{
    change_window_timestamp, format_change_timestamp, SyncMode, SyncOptions, SyncService,
};
use cqc_gp_sync::util::env::{db_url_prefer_session, env_parse, preflight_check};

#[derive(Parser, Debug)]
#[command(name = "cqc-gp-sync", version, about = "CQC / NHS GP practice sync")]
struct Cli {
    /// Override the database URL (defaults to the SUPABASE_DB_* / DATABASE_URL chain)
    #[arg(long, global = true)]
    db_url: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Walk the whole CQC listing and upsert every GP practice
    Full,
    /// Re-sync locations changed in a time window
    Delta {
        /// RFC 3339 start; defaults to the newest updated_at in the table
        #[arg(long)]
        start: Option<String>,
        /// RFC 3339 end; open-ended when omitted
        #[arg(long)]
        end: Option<String>,
    },
    /// Refresh one location with its provider and provider assessment
    CqcDetails {
        #[arg(long)]
        location_id: String,
        #[arg(long)]
        provider_id: Option<String>,
    },
    /// Merge ODS / prescribing / CQC data for one practice
    NhsData {
        #[arg(long)]
        location_id: Option<String>,
        #[arg(long)]
        ods_code: Option<String>,
        /// Comma-separated subset of ods,prescribing,cqc
        #[arg(long, value_delimiter = ',', default_value = "ods")]
        sources: Vec<String>,
    },
    /// Apply pending SQL migrations
    Migrate {
        #[arg(long, default_value = "./migrations")]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info,sqlx=warn")?;
    let cli = Cli::parse();

    preflight_check(
        "cqc-gp-sync",
        &[],
        &["SUPABASE_DB_SESSION_URL", "DATABASE_URL", "GP_TABLE", "SCHEMA_FALLBACK"],
    )?;
    let database_url = match cli.db_url {
        Some(url) => url,
        None => db_url_prefer_session().context("no database URL configured")?,
    };
    let database = Db::connect(&database_url, env_parse("DB_MAX_CONNS", 5u32)).await?;

    if let Commands::Migrate { dir } = &cli.command {
        db::run_migrations(&database.pool, dir).await?;
        info!(dir = %dir.display(), "migrations applied");
        return Ok(());
    }

    let config = AppConfig::from_env()?;
    let store = PgFacilityStore::new(database.pool.clone(), config.store.table.clone());

    match cli.command {
        Commands::Full => {
            let started = Instant::now();
            let client = CqcApiClient::new(config.cqc.clone())?;
            let stats = SyncService::new(&client, &store, SyncOptions::from_config(&config))
                .full_sync()
                .await?;
            print_json(&stats.summary(SyncMode::Full, started.elapsed()))
        }
        Commands::Delta { start, end } => {
            let start = match start {
                Some(raw) => change_window_timestamp(&raw).context("invalid --start")?,
                None => {
                    let watermark = store
                        .latest_update_timestamp()
                        .await?
                        .context("table is empty; pass --start for the first delta run")?;
                    format_change_timestamp(watermark)
                }
            };
            let end = end
                .map(|raw| change_window_timestamp(&raw))
                .transpose()
                .context("invalid --end")?;
            info!(start = %start, end = ?end, "delta window");

            let started = Instant::now();
            let client = CqcApiClient::new(config.cqc.clone())?;
            let stats = SyncService::new(&client, &store, SyncOptions::from_config(&config))
                .delta_sync(&start, end.as_deref())
                .await?;
            print_json(&stats.summary(SyncMode::Delta, started.elapsed()))
        }
        Commands::CqcDetails {
            location_id,
            provider_id,
        } => {
            let client = CqcApiClient::new(config.cqc.clone())?;
            let req = CqcDetailsRequest {
                location_id,
                provider_id,
            };
            let resp =
                facility::fetch_cqc_details(&client, &store, &config.store, &req, Utc::now())
                    .await?;
            print_json(&resp)
        }
        Commands::NhsData {
            location_id,
            ods_code,
            sources,
        } => {
            let cqc = CqcApiClient::new(config.cqc.clone())?;
            let ods = OdsClient::new(&config.nhs)?;
            let prescribing = PrescribingClient::new(&config.nhs)?;
            let req = NhsDataRequest {
                practice_ods_code: None,
                ods_code,
                location_id,
                data_sources: sources,
            };
            let resp = facility::fetch_nhs_data(
                NhsSources {
                    cqc: &cqc,
                    ods: &ods,
                    prescribing: &prescribing,
                },
                &store,
                &config.store,
                &req,
                Utc::now(),
            )
            .await?;
            print_json(&resp)
        }
        Commands::Migrate { .. } => Ok(()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
