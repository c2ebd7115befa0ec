//! Runtime configuration assembled from the environment at process start.
//!
//! Every credential is injected (`CQC_API_KEY`, `NHS_ODS_SUBSCRIPTION_KEY`,
//! `API_SECRET`); nothing sensitive is compiled in. `Debug` output redacts them.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::util::env::{env_flag, env_opt, env_parse, env_req, init_env};

pub const DEFAULT_CQC_BASE_URL: &str = "https://api.service.cqc.org.uk/public/v1";
pub const DEFAULT_USER_AGENT: &str = "cqc-gp-sync/0.1 (+https://github.com/cqc-gp-sync)";
pub const DEFAULT_FACILITY_CATEGORY: &str = "GP Practices";
pub const DEFAULT_GP_TABLE: &str = "CQC All GPs";

pub const DEFAULT_ODS_PRIMARY_URL: &str = "https://api.nhs.uk/organisation-api/organisations";
pub const DEFAULT_ODS_DIRECTORY_URL: &str = "https://directory-api.nhs.uk/ord/2-0-0/organisations";
pub const DEFAULT_ODS_SPINE_URL: &str =
    "https://directory.spineservices.nhs.uk/ORD/2-0-0/organisations";
pub const DEFAULT_OPENPRESCRIBING_URL: &str = "https://openprescribing.net/api/1.0";

/// Connection and retry settings for the CQC public API.
#[derive(Clone)]
pub struct CqcConfig {
    pub base_url: String,
    pub api_key: String,
    pub user_agent: String,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub page_size: u32,
    pub facility_category: String,
    /// Optional `partnerCode` query parameter for the provider assessment endpoint.
    pub partner_code: Option<String>,
    pub timeout: Duration,
}

impl CqcConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_retries: 5,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
            page_size: 500,
            facility_category: DEFAULT_FACILITY_CATEGORY.to_string(),
            partner_code: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn from_env() -> Result<Self> {
        let base_url = env_opt("CQC_BASE_URL").unwrap_or_else(|| DEFAULT_CQC_BASE_URL.into());
        let api_key = env_req("CQC_API_KEY")?;
        let mut cfg = Self::new(base_url, api_key);
        if let Some(ua) = env_opt("CQC_USER_AGENT") {
            cfg.user_agent = ua;
        }
        cfg.max_retries = env_parse("CQC_MAX_RETRIES", cfg.max_retries);
        cfg.retry_base_delay = Duration::from_millis(env_parse("CQC_RETRY_BASE_MS", 500u64));
        cfg.retry_max_delay = Duration::from_millis(env_parse("CQC_RETRY_MAX_MS", 30_000u64));
        cfg.page_size = env_parse("CQC_PAGE_SIZE", cfg.page_size).max(1);
        if let Some(cat) = env_opt("CQC_FACILITY_CATEGORY") {
            cfg.facility_category = cat;
        }
        cfg.partner_code = env_opt("CQC_PARTNER_CODE");
        cfg.timeout = Duration::from_secs(env_parse("HTTP_TIMEOUT_SECS", 30u64));
        Ok(cfg)
    }
}

impl fmt::Debug for CqcConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CqcConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"***")
            .field("max_retries", &self.max_retries)
            .field("retry_base_delay", &self.retry_base_delay)
            .field("retry_max_delay", &self.retry_max_delay)
            .field("page_size", &self.page_size)
            .field("facility_category", &self.facility_category)
            .finish_non_exhaustive()
    }
}

/// NHS ODS and OpenPrescribing endpoints.
#[derive(Clone)]
pub struct NhsConfig {
    pub ods_primary_url: String,
    pub ods_directory_url: String,
    pub ods_spine_url: String,
    pub ods_subscription_key: Option<String>,
    pub openprescribing_url: String,
    pub timeout: Duration,
}

impl Default for NhsConfig {
    fn default() -> Self {
        Self {
            ods_primary_url: DEFAULT_ODS_PRIMARY_URL.into(),
            ods_directory_url: DEFAULT_ODS_DIRECTORY_URL.into(),
            ods_spine_url: DEFAULT_ODS_SPINE_URL.into(),
            ods_subscription_key: None,
            openprescribing_url: DEFAULT_OPENPRESCRIBING_URL.into(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl NhsConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            ods_primary_url: env_opt("NHS_ODS_PRIMARY_URL").unwrap_or(d.ods_primary_url),
            ods_directory_url: env_opt("NHS_ODS_DIRECTORY_URL").unwrap_or(d.ods_directory_url),
            ods_spine_url: env_opt("NHS_ODS_SPINE_URL").unwrap_or(d.ods_spine_url),
            ods_subscription_key: env_opt("NHS_ODS_SUBSCRIPTION_KEY"),
            openprescribing_url: env_opt("OPENPRESCRIBING_URL").unwrap_or(d.openprescribing_url),
            timeout: Duration::from_secs(env_parse("HTTP_TIMEOUT_SECS", 30u64)),
        }
    }
}

impl fmt::Debug for NhsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NhsConfig")
            .field("ods_primary_url", &self.ods_primary_url)
            .field("ods_directory_url", &self.ods_directory_url)
            .field("ods_spine_url", &self.ods_spine_url)
            .field(
                "ods_subscription_key",
                &self.ods_subscription_key.as_ref().map(|_| "***"),
            )
            .field("openprescribing_url", &self.openprescribing_url)
            .finish_non_exhaustive()
    }
}

/// Destination table and write behaviour.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub table: String,
    pub upsert_chunk_size: usize,
    /// Retry a rejected write with the basic column set when the table lacks a column.
    pub schema_fallback: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            table: DEFAULT_GP_TABLE.into(),
            upsert_chunk_size: 100,
            schema_fallback: true,
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            table: env_opt("GP_TABLE").unwrap_or(d.table),
            upsert_chunk_size: env_parse("UPSERT_CHUNK_SIZE", d.upsert_chunk_size).max(1),
            schema_fallback: env_flag("SCHEMA_FALLBACK", d.schema_fallback),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Facilities fetched and processed before each bulk upsert in a full sync.
    pub batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { batch_size: 50 }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            batch_size: env_parse("SYNC_BATCH_SIZE", 50usize).max(1),
        }
    }
}

#[derive(Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub api_secret: String,
    pub allowed_origins: String,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let host = env_opt("API_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = env_opt("API_PORT")
            .unwrap_or_else(|| "8080".to_string())
            .parse()
            .context("Invalid API_PORT")?;
        let api_secret = env_req("API_SECRET").context("API_SECRET is required")?;
        let allowed_origins = env_opt("ALLOWED_ORIGINS")
            .unwrap_or_else(|| "http://localhost:3000,http://localhost:8000".to_string());
        Ok(Self {
            host,
            port,
            api_secret,
            allowed_origins,
        })
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("api_secret", &"***")
            .field("allowed_origins", &self.allowed_origins)
            .finish()
    }
}

/// Everything a request handler or CLI run needs besides the database pool.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub cqc: CqcConfig,
    pub nhs: NhsConfig,
    pub store: StoreConfig,
    pub sync: SyncConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        init_env();
        Ok(Self {
            cqc: CqcConfig::from_env()?,
            nhs: NhsConfig::from_env(),
            store: StoreConfig::from_env(),
            sync: SyncConfig::from_env(),
        })
    }

    /// Configuration pointing every upstream at `base` (used with in-process fakes).
    #[cfg(test)]
    pub(crate) fn for_upstream(base: &str) -> Self {
        let mut cqc = CqcConfig::new(format!("{base}/public/v1"), "test-key");
        cqc.retry_base_delay = Duration::from_millis(1);
        cqc.retry_max_delay = Duration::from_millis(5);
        cqc.timeout = Duration::from_secs(5);
        Self {
            cqc,
            nhs: NhsConfig {
                ods_primary_url: format!("{base}/organisation-api/organisations"),
                ods_directory_url: format!("{base}/ord/2-0-0/organisations"),
                ods_spine_url: format!("{base}/ORD/2-0-0/organisations"),
                ods_subscription_key: None,
                openprescribing_url: format!("{base}/api/1.0"),
                timeout: Duration::from_secs(5),
            },
            store: StoreConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_redacts_credentials() {
        let cfg = CqcConfig::new("https://api.example/public/v1/", "super-secret-key");
        let shown = format!("{cfg:?}");
        assert!(!shown.contains("super-secret-key"));
        assert_eq!(cfg.base_url, "https://api.example/public/v1");
    }
}
