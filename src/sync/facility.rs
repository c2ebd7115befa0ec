//! On-demand refresh of a single facility from CQC and the NHS sources.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::StoreConfig;
use crate::cqc::{CqcError, RegulatorApi};
use crate::database_ops::{write_with_fallback, FacilityStore, StoreError, UpdateType};
use crate::nhs::{NhsError, OdsClient, PrescribingClient};
use crate::normalization::fields::{
    cqc_details_fields, cqc_location_fields, cqc_provider_fields, merge_ods_fields, stamp,
};
use crate::normalization::FieldMap;

#[derive(Error, Debug)]
pub enum FacilityError {
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Cqc(#[from] CqcError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct CqcDetailsRequest {
    #[serde(default)]
    pub location_id: String,
    #[serde(default)]
    pub provider_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CqcDetailsResponse {
    pub success: bool,
    pub update_type: UpdateType,
    pub message: String,
    pub record_existed: bool,
    pub data: CqcDetailsData,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CqcDetailsData {
    pub location: Value,
    pub provider: Value,
    pub provider_assessment: Value,
}

/// Fetch one location (required) with its provider and provider assessment
/// (both optional), then write every column the table accepts.
pub async fn fetch_cqc_details(
    api: &dyn RegulatorApi,
    store: &dyn FacilityStore,
    store_cfg: &StoreConfig,
    req: &CqcDetailsRequest,
    now: DateTime<Utc>,
) -> Result<CqcDetailsResponse, FacilityError> {
    let location_id = req.location_id.trim();
    if location_id.is_empty() {
        return Err(FacilityError::Invalid("location_id is required".into()));
    }

    let location = api.fetch_location_by_id(location_id).await?;
    let provider_id = req
        .provider_id
        .clone()
        .filter(|p| !p.trim().is_empty())
        .or_else(|| location.provider_id.clone());

    let (provider, assessment) = match provider_id.as_deref() {
        Some(pid) => {
            let provider = match api.fetch_provider_by_id(pid).await {
                Ok(p) => Some(p.to_value()),
                Err(e) => {
                    warn!(provider_id = pid, error = %e, "provider lookup failed");
                    None
                }
            };
            let assessment = api.fetch_provider_assessment(pid).await.unwrap_or_else(|e| {
                warn!(provider_id = pid, error = %e, "provider assessment lookup failed");
                None
            });
            (provider, assessment)
        }
        None => (None, None),
    };

    let location = location.to_value();
    let full = cqc_details_fields(
        location_id,
        &location,
        provider.as_ref(),
        assessment.as_ref(),
        now,
    );
    let record_existed = store.location_exists(location_id).await?;
    let update_type = write_with_fallback(store, &full, store_cfg.schema_fallback).await?;
    info!(location_id, ?update_type, record_existed, "cqc details stored");

    let message = match update_type {
        UpdateType::Full => "All data fetched and stored successfully.",
        UpdateType::Basic => {
            "Data fetched successfully. Note: only basic columns were updated; apply the latest migration for full data capture."
        }
    };
    Ok(CqcDetailsResponse {
        success: true,
        update_type,
        message: message.to_string(),
        record_existed,
        data: CqcDetailsData {
            location,
            provider: provider.unwrap_or(Value::Null),
            provider_assessment: assessment.unwrap_or(Value::Null),
        },
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct NhsDataRequest {
    #[serde(default)]
    pub practice_ods_code: Option<String>,
    #[serde(default)]
    pub ods_code: Option<String>,
    #[serde(default)]
    pub location_id: Option<String>,
    #[serde(default = "default_sources")]
    pub data_sources: Vec<String>,
}

fn default_sources() -> Vec<String> {
    vec!["ods".to_string()]
}

impl NhsDataRequest {
    fn wants(&self, source: &str) -> bool {
        self.data_sources.iter().any(|s| s.eq_ignore_ascii_case(source))
    }

    fn requested_code(&self) -> Option<String> {
        non_blank(self.practice_ods_code.as_deref()).or_else(|| non_blank(self.ods_code.as_deref()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NhsDataResponse {
    pub status: &'static str,
    pub location_id: Option<String>,
    pub ods_code: Option<String>,
    pub data_sources_fetched: Vec<String>,
    pub data: Map<String, Value>,
    pub errors: Option<Map<String, Value>>,
    pub database_updated: bool,
    #[serde(rename = "updateType")]
    pub update_type: Option<UpdateType>,
    pub timestamp: DateTime<Utc>,
}

/// Upstream clients used by [`fetch_nhs_data`].
pub struct NhsSources<'a> {
    pub cqc: &'a dyn RegulatorApi,
    pub ods: &'a OdsClient,
    pub prescribing: &'a PrescribingClient,
}

/// Gather CQC, ODS and prescribing data for one practice and merge it into
/// a single write. Source failures are reported per source; only a request
/// with neither an ODS code nor a location is rejected.
pub async fn fetch_nhs_data(
    sources: NhsSources<'_>,
    store: &dyn FacilityStore,
    store_cfg: &StoreConfig,
    req: &NhsDataRequest,
    now: DateTime<Utc>,
) -> Result<NhsDataResponse, FacilityError> {
    let requested_code = req.requested_code();
    let location_id = non_blank(req.location_id.as_deref());
    if requested_code.is_none() && location_id.is_none() {
        return Err(FacilityError::Invalid(
            "ods_code or location_id is required".into(),
        ));
    }

    let mut data = Map::new();
    let mut errors = Map::new();
    let mut fetched: Vec<String> = Vec::new();
    let mut derived_code = requested_code.clone();
    let mut cqc_location: Option<Value> = None;
    let mut cqc_provider: Option<Value> = None;

    if let (Some(lid), true) = (location_id.as_deref(), req.wants("cqc")) {
        match sources.cqc.fetch_location_by_id(lid).await {
            Ok(loc) => {
                if derived_code.is_none() {
                    derived_code = loc
                        .ods_code()
                        .map(str::to_string)
                        .or_else(|| non_blank(loc.get("odsCcgCode").and_then(Value::as_str)));
                }
                if let Some(pid) = loc.provider_id.as_deref() {
                    match sources.cqc.fetch_provider_by_id(pid).await {
                        Ok(p) => {
                            if derived_code.is_none() {
                                derived_code = p.ods_code().map(str::to_string);
                            }
                            cqc_provider = Some(p.to_value());
                        }
                        Err(e) => warn!(provider_id = pid, error = %e, "provider lookup failed"),
                    }
                }
                cqc_location = Some(loc.to_value());
                fetched.push("cqc".into());
            }
            Err(e) => {
                let msg = match e.status() {
                    Some(status) => format!("CQC API error: {status}"),
                    None => format!("CQC fetch error: {e}"),
                };
                errors.insert("cqc".into(), Value::from(msg));
            }
        }
        if let Some(loc) = &cqc_location {
            data.insert("cqc_location".into(), loc.clone());
        }
        if let Some(p) = &cqc_provider {
            data.insert("cqc_provider".into(), p.clone());
        }
    }

    let final_code = derived_code.clone();
    let mut ods_data: Option<Value> = None;
    if let (Some(code), true) = (final_code.as_deref(), req.wants("ods")) {
        let found = sources.ods.lookup(code).await;
        if found.is_fallback() {
            errors.insert(
                "ods".into(),
                Value::from("ODS API errors: All endpoints failed. Using minimal data."),
            );
        }
        let v = found.data.to_value();
        data.insert("ods_data".into(), v.clone());
        ods_data = Some(v);
        fetched.push("ods".into());
    }

    let mut prescribing: Option<Value> = None;
    if let (Some(code), true) = (final_code.as_deref(), req.wants("prescribing")) {
        match sources.prescribing.fetch(code, now.date_naive()).await {
            Ok(p) => {
                let v = serde_json::to_value(&p).unwrap_or(Value::Null);
                data.insert("prescribing_data".into(), v.clone());
                prescribing = Some(v);
                fetched.push("prescribing".into());
            }
            Err(NhsError::Http { status, .. }) => {
                errors.insert(
                    "prescribing".into(),
                    Value::from(format!("OpenPrescribing API error: {status}")),
                );
            }
            Err(e) => {
                errors.insert(
                    "prescribing".into(),
                    Value::from(format!("Prescribing fetch error: {e}")),
                );
            }
        }
    }

    let mut database_updated = false;
    let mut update_type = None;
    if let (Some(lid), true) = (location_id.as_deref(), cqc_location.is_some() || ods_data.is_some()) {
        let mut update = FieldMap::new();
        update.insert("location_id".into(), Value::from(lid));

        if let Some(loc) = &cqc_location {
            update.extend(cqc_location_fields(loc));
            if cqc_provider.is_some() {
                update.extend(cqc_provider_fields(cqc_provider.as_ref()));
            }
            let extracted = non_blank(loc.get("odsCode").and_then(Value::as_str))
                .or_else(|| non_blank(cqc_provider.as_ref().and_then(|p| p.get("odsCode")).and_then(Value::as_str)))
                .or_else(|| non_blank(loc.get("odsCcgCode").and_then(Value::as_str)));
            match extracted {
                Some(code) => {
                    update.insert("ods_code".into(), Value::from(code.clone()));
                    derived_code = Some(code);
                }
                // Keep whatever code the caller supplied.
                None => {
                    update.remove("ods_code");
                }
            }
        }
        if let Some(ods) = &ods_data {
            merge_ods_fields(&mut update, ods, final_code.as_deref().unwrap_or_default(), now);
        }
        if let Some(p) = prescribing {
            update.insert("nhs_prescribing_data".into(), p);
        }
        stamp(&mut update, now);

        match write_with_fallback(store, &update, store_cfg.schema_fallback).await {
            Ok(kind) => {
                database_updated = true;
                update_type = Some(kind);
                info!(location_id = lid, fields = update.len(), ?kind, "nhs data stored");
            }
            Err(e) => {
                errors.insert(
                    "database".into(),
                    Value::from(format!("Database update failed: {e}")),
                );
            }
        }
    }

    Ok(NhsDataResponse {
        status: if errors.is_empty() { "success" } else { "partial" },
        location_id,
        ods_code: derived_code,
        data_sources_fetched: fetched,
        data,
        errors: (!errors.is_empty()).then_some(errors),
        database_updated,
        update_type,
        timestamp: now,
    })
}

fn non_blank(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::database_ops::MemoryStore;
    use crate::normalization::fields::BASIC_COLUMNS;
    use crate::test_support::{spawn_upstream, FakeRegulator};
    use actix_web::HttpResponse;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 20, 10, 0, 0).unwrap()
    }

    fn details(location_id: &str) -> CqcDetailsRequest {
        CqcDetailsRequest {
            location_id: location_id.into(),
            provider_id: None,
        }
    }

    fn practice_api() -> FakeRegulator {
        let mut api = FakeRegulator::new();
        let loc = api.add_gp("1-A", Some("1-P"));
        loc["brandId"] = json!("BD01");
        loc["postalAddressLine1"] = json!("CQC Street");
        loc["odsCode"] = json!("B81001");
        api.add_provider("1-P", &["1-A"]);
        api
    }

    #[tokio::test]
    async fn cqc_details_falls_back_to_basic_columns() {
        let api = practice_api();
        let store = MemoryStore::with_columns(BASIC_COLUMNS);

        let resp = fetch_cqc_details(&api, &store, &StoreConfig::default(), &details("1-A"), now())
            .await
            .unwrap();
        assert_eq!(resp.update_type, UpdateType::Basic);
        assert!(!resp.record_existed);
        assert!(resp.message.contains("basic columns"));
        assert_eq!(resp.data.provider["providerId"], "1-P");
        assert_eq!(api.calls("assessment:1-P"), 1);

        let row = store.get("1-A").unwrap();
        assert_eq!(row["address_line_1"], "CQC Street");
        assert!(!row.contains_key("brand_id"));

        let body = serde_json::to_value(&resp).unwrap();
        assert_eq!(body["updateType"], "basic");
        assert_eq!(body["recordExisted"], false);
    }

    #[tokio::test]
    async fn cqc_details_full_write_and_existing_record() {
        let api = practice_api();
        let store = MemoryStore::new();
        let cfg = StoreConfig::default();
        fetch_cqc_details(&api, &store, &cfg, &details("1-A"), now()).await.unwrap();
        let resp = fetch_cqc_details(&api, &store, &cfg, &details("1-A"), now())
            .await
            .unwrap();
        assert_eq!(resp.update_type, UpdateType::Full);
        assert!(resp.record_existed);
        assert_eq!(store.get("1-A").unwrap()["brand_id"], "BD01");
    }

    #[tokio::test]
    async fn cqc_details_rejects_schema_drift_when_fallback_is_disabled() {
        let api = practice_api();
        let store = MemoryStore::with_columns(BASIC_COLUMNS);
        let cfg = StoreConfig {
            schema_fallback: false,
            ..StoreConfig::default()
        };
        let err = fetch_cqc_details(&api, &store, &cfg, &details("1-A"), now())
            .await
            .unwrap_err();
        assert!(matches!(err, FacilityError::Store(StoreError::MissingColumn { .. })));
    }

    #[tokio::test]
    async fn cqc_details_requires_a_known_location() {
        let api = FakeRegulator::new();
        let store = MemoryStore::new();
        let cfg = StoreConfig::default();
        let err = fetch_cqc_details(&api, &store, &cfg, &details("  "), now())
            .await
            .unwrap_err();
        assert!(matches!(err, FacilityError::Invalid(_)));

        let err = fetch_cqc_details(&api, &store, &cfg, &details("1-X"), now())
            .await
            .unwrap_err();
        assert!(matches!(err, FacilityError::Cqc(ref e) if e.status() == Some(404)));
        assert!(store.is_empty());
    }

    fn nhs_request(sources: &[&str]) -> NhsDataRequest {
        NhsDataRequest {
            practice_ods_code: None,
            ods_code: None,
            location_id: Some("1-A".into()),
            data_sources: sources.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[actix_web::test]
    async fn nhs_data_uses_spine_when_newer_endpoints_404() {
        let upstream = spawn_upstream(|req| {
            if req.path() == "/ORD/2-0-0/organisations/B81001" {
                HttpResponse::Ok().json(json!({"Organisation": {
                    "Name": "SPINE NAME",
                    "GeoLoc": {"Location": {"AddrLn1": "ODS Street", "Town": "Hull"}},
                    "Contacts": {"Contact": [{"type": "tel", "value": "01482 111111"}]},
                }}))
            } else {
                HttpResponse::NotFound().finish()
            }
        })
        .await;
        let cfg = AppConfig::for_upstream(&upstream.base);
        let api = practice_api();
        let ods = OdsClient::new(&cfg.nhs).unwrap();
        let prescribing = PrescribingClient::new(&cfg.nhs).unwrap();
        let store = MemoryStore::new();
        let sources = NhsSources {
            cqc: &api,
            ods: &ods,
            prescribing: &prescribing,
        };

        let resp = fetch_nhs_data(sources, &store, &cfg.store, &nhs_request(&["cqc", "ods"]), now())
            .await
            .unwrap();
        assert_eq!(resp.status, "success");
        assert!(resp.errors.is_none());
        assert!(resp.database_updated);
        assert_eq!(resp.ods_code.as_deref(), Some("B81001"));
        assert_eq!(resp.data_sources_fetched, vec!["cqc", "ods"]);
        assert!(resp.data["ods_data"].get("fallback").is_none());

        let row = store.get("1-A").unwrap();
        assert_eq!(row["address_line_1"], "CQC Street");
        assert_eq!(row["town_city"], "Hull");
        assert_eq!(row["main_phone_number"], "01482 111111");
        assert_eq!(row["ods_code"], "B81001");
        assert_eq!(row["nhs_ods_data"]["name"], "SPINE NAME");
    }

    #[actix_web::test]
    async fn nhs_data_reports_partial_when_ods_and_prescribing_fail() {
        let upstream = spawn_upstream(|_| HttpResponse::BadGateway().finish()).await;
        let cfg = AppConfig::for_upstream(&upstream.base);
        let api = FakeRegulator::new();
        let ods = OdsClient::new(&cfg.nhs).unwrap();
        let prescribing = PrescribingClient::new(&cfg.nhs).unwrap();
        let store = MemoryStore::new();
        let req = NhsDataRequest {
            practice_ods_code: Some("Y99999".into()),
            ods_code: None,
            location_id: None,
            data_sources: vec!["ods".into(), "prescribing".into()],
        };
        let sources = NhsSources {
            cqc: &api,
            ods: &ods,
            prescribing: &prescribing,
        };

        let resp = fetch_nhs_data(sources, &store, &cfg.store, &req, now()).await.unwrap();
        assert_eq!(resp.status, "partial");
        let errors = resp.errors.unwrap();
        assert_eq!(
            errors["ods"],
            "ODS API errors: All endpoints failed. Using minimal data."
        );
        assert_eq!(errors["prescribing"], "OpenPrescribing API error: 502");
        assert_eq!(resp.data["ods_data"]["fallback"], true);
        assert_eq!(resp.data_sources_fetched, vec!["ods"]);
        // No location to write to.
        assert!(!resp.database_updated);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn nhs_data_needs_a_code_or_location() {
        let cfg = AppConfig::for_upstream("http://127.0.0.1:9");
        let api = FakeRegulator::new();
        let ods = OdsClient::new(&cfg.nhs).unwrap();
        let prescribing = PrescribingClient::new(&cfg.nhs).unwrap();
        let req: NhsDataRequest = serde_json::from_value(json!({"ods_code": " "})).unwrap();
        assert_eq!(req.data_sources, vec!["ods"]);
        let sources = NhsSources {
            cqc: &api,
            ods: &ods,
            prescribing: &prescribing,
        };
        let err = fetch_nhs_data(sources, &MemoryStore::new(), &cfg.store, &req, now())
            .await
            .unwrap_err();
        assert!(matches!(err, FacilityError::Invalid(_)));
    }
}
