use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool, Row,
};
use tracing::{info, instrument};

use crate::util::env::env_flag;

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    /// Connect and, when `AUTO_MIGRATE` is on, apply pending `./migrations`.
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let db = Self::connect_no_migrate(database_url, max_connections).await?;
        if env_flag("AUTO_MIGRATE", false) {
            info!("running migrations (AUTO_MIGRATE=on)");
            run_migrations(&db.pool, Path::new("./migrations")).await?;
        } else {
            info!("AUTO_MIGRATE disabled; skipping migrations");
        }
        Ok(db)
    }

    #[instrument(skip(database_url))]
    pub async fn connect_no_migrate(database_url: &str, max_connections: u32) -> Result<Self> {
        let mut opts =
            PgConnectOptions::from_str(database_url).context("invalid database URL")?;
        if database_url.contains("sslmode=require") {
            opts = opts.ssl_mode(PgSslMode::Require);
        }
        // Supabase pooler (PgBouncer) cannot hold prepared statements across transactions.
        if !env_flag("USE_PREPARED", false) {
            opts = opts.statement_cache_capacity(0);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(opts)
            .await
            .context("connecting to postgres")?;
        info!(max_connections, "connected to db");
        Ok(Self { pool })
    }
}

/// Apply `NNNN_description.sql` files in version order, skipping versions
/// already recorded in `_sqlx_migrations`. Other filenames are ignored.
pub async fn run_migrations(pool: &PgPool, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    sqlx::raw_sql(
        "CREATE TABLE IF NOT EXISTS _sqlx_migrations (
            version BIGINT PRIMARY KEY,
            description TEXT,
            installed_at TIMESTAMPTZ DEFAULT now()
         )",
    )
    .execute(pool)
    .await?;

    let mut applied: HashSet<i64> = HashSet::new();
    for row in sqlx::raw_sql("SELECT version FROM _sqlx_migrations")
        .fetch_all(pool)
        .await?
    {
        applied.insert(row.try_get::<i64, _>(0)?);
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some((version, desc)) = path
            .file_name()
            .and_then(|f| f.to_str())
            .and_then(parse_migration_name)
        {
            files.push((version, desc, path));
        }
    }
    files.sort_by_key(|(v, _, _)| *v);

    for (version, desc, path) in files {
        if applied.contains(&version) {
            continue;
        }
        apply_migration(pool, version, &desc, &path).await?;
    }
    Ok(())
}

async fn apply_migration(pool: &PgPool, version: i64, desc: &str, path: &Path) -> Result<()> {
    let sql = std::fs::read_to_string(path)
        .with_context(|| format!("reading migration {}", path.display()))?;
    info!(version, file = ?path, "applying migration");
    let mut tx = pool.begin().await?;
    sqlx::raw_sql(&sql)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("migration {version} failed"))?;
    sqlx::query("INSERT INTO _sqlx_migrations (version, description) VALUES ($1, $2)")
        .bind(version)
        .bind(desc)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// `0001_cqc_all_gps.sql` -> `(1, "cqc_all_gps")`.
fn parse_migration_name(fname: &str) -> Option<(i64, String)> {
    let stem = fname.strip_suffix(".sql")?;
    let digits: String = stem.chars().take_while(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    let desc = stem[digits.len()..].strip_prefix('_')?;
    Some((digits.parse().ok()?, desc.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_names() {
        assert_eq!(
            parse_migration_name("0001_cqc_all_gps.sql"),
            Some((1, "cqc_all_gps".to_string()))
        );
        assert_eq!(parse_migration_name("database_settings.sql"), None);
        assert_eq!(parse_migration_name("0002_notes.txt"), None);
        assert_eq!(parse_migration_name("0003.sql"), None);
    }
}
