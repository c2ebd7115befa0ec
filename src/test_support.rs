//! In-process fakes shared by the unit tests: an actix-web server standing in
//! for the upstream HTTP APIs, and an in-memory regulator API.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::cqc::{CqcError, CqcLocation, CqcProvider, CqcReport, LocationListing, RegulatorApi};

pub(crate) struct Upstream {
    pub base: String,
    hits: Arc<Mutex<Vec<String>>>,
}

impl Upstream {
    /// Request URIs (path + query) seen so far, in arrival order.
    pub fn hits(&self) -> Vec<String> {
        self.hits.lock().unwrap().clone()
    }

    pub fn hit_count(&self, path_prefix: &str) -> usize {
        self.hits()
            .iter()
            .filter(|h| h.starts_with(path_prefix))
            .count()
    }
}

/// Start a fake upstream on an ephemeral port. Must run inside an actix system
/// (`#[actix_web::test]`).
pub(crate) async fn spawn_upstream<F>(handler: F) -> Upstream
where
    F: Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
{
    let hits = Arc::new(Mutex::new(Vec::new()));
    let handler = Arc::new(handler);
    let hits_c = hits.clone();
    let server = HttpServer::new(move || {
        let handler = handler.clone();
        let hits = hits_c.clone();
        App::new().default_service(web::to(move |req: HttpRequest| {
            let handler = handler.clone();
            let hits = hits.clone();
            async move {
                hits.lock().unwrap().push(req.uri().to_string());
                handler(&req)
            }
        }))
    })
    .workers(1)
    .bind(("127.0.0.1", 0))
    .expect("bind fake upstream");
    let addr = server.addrs()[0];
    actix_web::rt::spawn(server.run());
    Upstream {
        base: format!("http://{addr}"),
        hits,
    }
}

/// Query parameter lookup for fake handlers.
pub(crate) fn query_param(req: &HttpRequest, key: &str) -> Option<String> {
    url::form_urlencoded::parse(req.query_string().as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

/// In-memory [`RegulatorApi`] with per-endpoint call counters.
#[derive(Default)]
pub(crate) struct FakeRegulator {
    pub locations: HashMap<String, Value>,
    pub providers: HashMap<String, Value>,
    pub reports: HashMap<String, Value>,
    pub listing: Vec<String>,
    pub page_size: usize,
    pub location_changes: Vec<String>,
    pub provider_changes: Vec<String>,
    pub fail_listing: bool,
    /// Listing entries reported as unreadable, `(entry key, reason)`.
    pub malformed_listing: Vec<(String, String)>,
    calls: Mutex<HashMap<String, usize>>,
}

impl FakeRegulator {
    pub fn new() -> Self {
        Self {
            page_size: 500,
            ..Self::default()
        }
    }

    /// A GP location listed in the category, optionally under a provider.
    pub fn add_gp(&mut self, id: &str, provider_id: Option<&str>) -> &mut Value {
        self.add_location(id, provider_id, "GP Practices", true)
    }

    pub fn add_location(
        &mut self,
        id: &str,
        provider_id: Option<&str>,
        category: &str,
        listed: bool,
    ) -> &mut Value {
        let mut loc = json!({
            "locationId": id,
            "name": format!("Location {id}"),
            "inspectionCategories": [{"code": "P", "name": category}],
            "postalAddressElements": {"addressLine1": "1 Test Street", "postalCode": "AB1 2CD"},
        });
        if let Some(pid) = provider_id {
            loc["providerId"] = json!(pid);
        }
        if listed {
            self.listing.push(id.to_string());
        }
        self.locations.entry(id.to_string()).or_insert(loc)
    }

    pub fn add_provider(&mut self, id: &str, location_ids: &[&str]) -> &mut Value {
        self.providers.entry(id.to_string()).or_insert(json!({
            "providerId": id,
            "name": format!("Provider {id}"),
            "locationIds": location_ids,
        }))
    }

    pub fn calls(&self, key: &str) -> usize {
        self.calls.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    fn record(&self, key: String) {
        *self.calls.lock().unwrap().entry(key).or_default() += 1;
    }

    fn lookup<T: serde::de::DeserializeOwned>(
        map: &HashMap<String, Value>,
        id: &str,
        path: &str,
    ) -> Result<T, CqcError> {
        match map.get(id) {
            Some(v) => Ok(serde_json::from_value(v.clone())?),
            None => Err(CqcError::Http {
                status: 404,
                url: format!("fake://{path}/{id}"),
                body: String::new(),
            }),
        }
    }
}

#[async_trait]
impl RegulatorApi for FakeRegulator {
    async fn fetch_all_locations(&self) -> Result<LocationListing, CqcError> {
        self.record("listing".into());
        if self.fail_listing {
            return Err(CqcError::Http {
                status: 503,
                url: "fake://locations".into(),
                body: "unavailable".into(),
            });
        }
        // Listing entries are summaries; details come from `fetch_location_by_id`.
        let locations = self
            .listing
            .iter()
            .map(|id| serde_json::from_value(json!({ "locationId": id })))
            .collect::<Result<Vec<CqcLocation>, _>>()?;
        let pages = locations.len().div_ceil(self.page_size.max(1)).max(1) as u32;
        Ok(LocationListing {
            locations,
            pages,
            malformed: self.malformed_listing.clone(),
        })
    }

    async fn fetch_location_by_id(&self, location_id: &str) -> Result<CqcLocation, CqcError> {
        self.record(format!("location:{location_id}"));
        Self::lookup(&self.locations, location_id, "locations")
    }

    async fn fetch_provider_by_id(&self, provider_id: &str) -> Result<CqcProvider, CqcError> {
        self.record(format!("provider:{provider_id}"));
        Self::lookup(&self.providers, provider_id, "providers")
    }

    async fn fetch_provider_assessment(
        &self,
        provider_id: &str,
    ) -> Result<Option<Value>, CqcError> {
        self.record(format!("assessment:{provider_id}"));
        Ok(None)
    }

    async fn fetch_report_by_id(&self, report_link_id: &str) -> Result<CqcReport, CqcError> {
        self.record(format!("report:{report_link_id}"));
        Self::lookup(&self.reports, report_link_id, "reports")
    }

    async fn fetch_location_changes(
        &self,
        _start: &str,
        _end: Option<&str>,
    ) -> Result<Vec<String>, CqcError> {
        self.record("changes:location".into());
        Ok(self.location_changes.clone())
    }

    async fn fetch_provider_changes(
        &self,
        _start: &str,
        _end: Option<&str>,
    ) -> Result<Vec<String>, CqcError> {
        self.record("changes:provider".into());
        Ok(self.provider_changes.clone())
    }

    fn retry_attempts(&self) -> u32 {
        0
    }
}
