use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexSet;
use rand::Rng;
use reqwest::header::{HeaderValue, ACCEPT};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use super::models::{change_ids, CqcLocation, CqcProvider, CqcReport};
use super::CqcError;
use crate::config::CqcConfig;

const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";

/// Result of walking the paginated location listing.
#[derive(Debug, Clone, Default)]
pub struct LocationListing {
    pub locations: Vec<CqcLocation>,
    pub pages: u32,
    /// Entries that could not be read as a location, as `(entry key, reason)`.
    pub malformed: Vec<(String, String)>,
}

/// Read access to the regulator API. The sync orchestrator only talks to this
/// trait so runs can be exercised against in-memory fakes.
#[async_trait]
pub trait RegulatorApi: Send + Sync {
    /// Every location in the configured inspection category, in listing order.
    async fn fetch_all_locations(&self) -> Result<LocationListing, CqcError>;
    async fn fetch_location_by_id(&self, location_id: &str) -> Result<CqcLocation, CqcError>;
    async fn fetch_provider_by_id(&self, provider_id: &str) -> Result<CqcProvider, CqcError>;
    /// Assessment data is optional upstream; a non-2xx answer is `Ok(None)`.
    async fn fetch_provider_assessment(&self, provider_id: &str)
        -> Result<Option<Value>, CqcError>;
    async fn fetch_report_by_id(&self, report_link_id: &str) -> Result<CqcReport, CqcError>;
    async fn fetch_location_changes(
        &self,
        start: &str,
        end: Option<&str>,
    ) -> Result<Vec<String>, CqcError>;
    async fn fetch_provider_changes(
        &self,
        start: &str,
        end: Option<&str>,
    ) -> Result<Vec<String>, CqcError>;
    /// Number of retried requests issued so far by this client.
    fn retry_attempts(&self) -> u32;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocationPage {
    #[serde(default)]
    locations: Vec<Value>,
    #[serde(default)]
    next_page_uri: Option<String>,
}

/// HTTP client for the CQC public API with bounded exponential backoff.
///
/// Built per request/run; the retry counter is not shared across instances.
pub struct CqcApiClient {
    http: Client,
    cfg: CqcConfig,
    retries: AtomicU32,
}

impl CqcApiClient {
    pub fn new(cfg: CqcConfig) -> Result<Self, CqcError> {
        let http = Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(cfg.timeout)
            .build()?;
        Ok(Self {
            http,
            cfg,
            retries: AtomicU32::new(0),
        })
    }

    pub fn config(&self) -> &CqcConfig {
        &self.cfg
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.cfg.base_url, path)
    }

    /// GET with retry on 429/5xx/transport errors. Any other status is handed
    /// back untouched so the caller decides what a 4xx means.
    async fn send_with_retry(&self, url: &str) -> Result<Response, CqcError> {
        let max_retries = self.cfg.max_retries;
        let mut attempt: u32 = 0;
        loop {
            if attempt > 0 {
                let jitter: f64 = rand::thread_rng().gen();
                let delay = backoff_delay(
                    self.cfg.retry_base_delay,
                    self.cfg.retry_max_delay,
                    attempt,
                    jitter,
                );
                debug!(attempt, delay_ms = delay.as_millis() as u64, url, "cqc retry backoff");
                tokio::time::sleep(delay).await;
                self.retries.fetch_add(1, Ordering::Relaxed);
            }

            let sent = self
                .http
                .get(url)
                .header(ACCEPT, HeaderValue::from_static("application/json"))
                .header(SUBSCRIPTION_KEY_HEADER, self.cfg.api_key.as_str())
                .send()
                .await;

            match sent {
                Ok(resp) => {
                    let status = resp.status();
                    if !is_retryable(status) {
                        return Ok(resp);
                    }
                    if attempt >= max_retries {
                        let body = truncate_for_log(resp.text().await.unwrap_or_default(), 500);
                        warn!(status = status.as_u16(), attempt, url, "cqc retries exhausted");
                        return Err(CqcError::Http {
                            status: status.as_u16(),
                            url: url.to_string(),
                            body,
                        });
                    }
                    warn!(status = status.as_u16(), attempt, url, "cqc transient status; will retry");
                }
                Err(e) => {
                    if attempt >= max_retries {
                        warn!(error = %e, attempt, url, "cqc network error; retries exhausted");
                        return Err(CqcError::Net(e));
                    }
                    warn!(error = %e, attempt, url, "cqc network error; will retry");
                }
            }
            attempt += 1;
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, CqcError> {
        let resp = self.send_with_retry(url).await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(CqcError::Http {
                status: status.as_u16(),
                url: url.to_string(),
                body: truncate_for_log(body, 500),
            });
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn fetch_changes(
        &self,
        kind: &str,
        start: &str,
        end: Option<&str>,
    ) -> Result<Vec<String>, CqcError> {
        let mut url = self.url(&format!(
            "/changes/{kind}?startTimestamp={}",
            urlencoding::encode(start)
        ));
        if let Some(end) = end {
            url.push_str(&format!("&endTimestamp={}", urlencoding::encode(end)));
        }
        let body: Value = self.get_json(&url).await?;
        let ids: IndexSet<String> = change_ids(&body).into_iter().collect();
        info!(kind, changed = ids.len(), start, end = ?end, "cqc change feed fetched");
        Ok(ids.into_iter().collect())
    }
}

#[async_trait]
impl RegulatorApi for CqcApiClient {
    async fn fetch_all_locations(&self) -> Result<LocationListing, CqcError> {
        let mut next = Some(self.url(&format!(
            "/locations?inspectionCategoryName={}&perPage={}",
            urlencoding::encode(&self.cfg.facility_category),
            self.cfg.page_size
        )));
        let mut listing = LocationListing::default();
        let mut visited: HashSet<String> = HashSet::new();

        while let Some(url) = next.take() {
            visited.insert(url.clone());
            listing.pages += 1;
            let page: LocationPage = self.get_json(&url).await?;
            debug!(page = listing.pages, count = page.locations.len(), "cqc location page");
            for (idx, entry) in page.locations.into_iter().enumerate() {
                match serde_json::from_value::<CqcLocation>(entry) {
                    Ok(loc) => listing.locations.push(loc),
                    Err(e) => {
                        let key = format!("page-{}-entry-{idx}", listing.pages);
                        warn!(key, error = %e, "skipping unreadable listing entry");
                        listing.malformed.push((key, e.to_string()));
                    }
                }
            }

            if let Some(raw) = page.next_page_uri.filter(|u| !u.trim().is_empty()) {
                let resolved = resolve_next_page(&self.cfg.base_url, &raw)?;
                if visited.contains(&resolved) {
                    warn!(next = %resolved, "listing cursor revisits a page; stopping");
                } else {
                    next = Some(resolved);
                }
            }
        }

        info!(
            pages = listing.pages,
            locations = listing.locations.len(),
            "cqc location listing complete"
        );
        Ok(listing)
    }

    async fn fetch_location_by_id(&self, location_id: &str) -> Result<CqcLocation, CqcError> {
        let url = self.url(&format!("/locations/{}", urlencoding::encode(location_id)));
        self.get_json(&url).await
    }

    async fn fetch_provider_by_id(&self, provider_id: &str) -> Result<CqcProvider, CqcError> {
        let url = self.url(&format!("/providers/{}", urlencoding::encode(provider_id)));
        self.get_json(&url).await
    }

    async fn fetch_provider_assessment(
        &self,
        provider_id: &str,
    ) -> Result<Option<Value>, CqcError> {
        let mut url = self.url(&format!(
            "/providers/{}/assessment",
            urlencoding::encode(provider_id)
        ));
        if let Some(code) = &self.cfg.partner_code {
            url.push_str(&format!("?partnerCode={}", urlencoding::encode(code)));
        }
        match self.get_json::<Value>(&url).await {
            Ok(v) => Ok(Some(v)),
            Err(CqcError::Http { status, .. }) => {
                info!(provider_id, status, "provider assessment not available");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_report_by_id(&self, report_link_id: &str) -> Result<CqcReport, CqcError> {
        let url = self.url(&format!("/reports/{}", urlencoding::encode(report_link_id)));
        self.get_json(&url).await
    }

    async fn fetch_location_changes(
        &self,
        start: &str,
        end: Option<&str>,
    ) -> Result<Vec<String>, CqcError> {
        self.fetch_changes("location", start, end).await
    }

    async fn fetch_provider_changes(
        &self,
        start: &str,
        end: Option<&str>,
    ) -> Result<Vec<String>, CqcError> {
        self.fetch_changes("provider", start, end).await
    }

    fn retry_attempts(&self) -> u32 {
        self.retries.load(Ordering::Relaxed)
    }
}

/// 429 and every 5xx are transient.
pub fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// `base * 2^(attempt-1) * (0.5 + jitter)`, capped at `max`. `jitter` is in `[0, 1)`.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32, jitter: f64) -> Duration {
    let exp = 2f64.powi(attempt.saturating_sub(1).min(30) as i32);
    let ms = base.as_millis() as f64 * exp * (0.5 + jitter.clamp(0.0, 1.0));
    Duration::from_millis(ms as u64).min(max)
}

/// Turn a `nextPageUri` (absolute, or relative with/without the API base path)
/// into an absolute URL.
pub(crate) fn resolve_next_page(base_url: &str, next: &str) -> Result<String, CqcError> {
    let next = next.trim();
    if next.starts_with("http://") || next.starts_with("https://") {
        return Ok(next.to_string());
    }
    let base =
        Url::parse(base_url).map_err(|e| CqcError::InvalidUrl(format!("{base_url}: {e}")))?;
    let base_path = base.path().trim_end_matches('/');
    let rel = if next.starts_with('/') {
        next.to_string()
    } else {
        format!("/{next}")
    };
    if !base_path.is_empty() && rel.starts_with(base_path) {
        let mut origin = base.clone();
        origin.set_path("");
        origin.set_query(None);
        Ok(format!("{}{}", origin.as_str().trim_end_matches('/'), rel))
    } else {
        Ok(format!("{}{}", base_url.trim_end_matches('/'), rel))
    }
}

fn truncate_for_log(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        let mut cut = max_len;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push('…');
    }
    s
}
