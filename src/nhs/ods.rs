use reqwest::header::ACCEPT;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{http_client, NhsError};
use crate::config::{NhsConfig, DEFAULT_USER_AGENT};

const FHIR_JSON: &str = "application/fhir+json";
const ODS_IDENTIFIER_SYSTEM: &str = "https://fhir.nhs.uk/Id/ods-organization-code";

/// One ODS endpoint in the lookup chain.
#[derive(Debug, Clone)]
pub struct OdsStrategy {
    pub label: &'static str,
    pub base_url: String,
    pub subscription_key: Option<String>,
}

/// Normalized ODS organisation data. Both the ORD (`Organisation.GeoLoc..`)
/// and FHIR (`address`, `telecom`) response shapes map onto this.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OdsData {
    pub organisation: Value,
    pub name: Value,
    pub status: Value,
    #[serde(rename = "lastChangeDate", skip_serializing_if = "Option::is_none")]
    pub last_change_date: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addresses: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relationships: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contacts: Option<Value>,
    pub raw_response: Value,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ods_code: Option<String>,
}

impl OdsData {
    pub fn from_response(body: Value) -> Self {
        let org = body.get("Organisation");
        let field = |ord: &[&str], fhir: &str| -> Option<Value> {
            let from_ord = org.and_then(|o| {
                ord.iter()
                    .try_fold(o, |cur, k| cur.get(*k))
                    .filter(|v| !v.is_null())
            });
            from_ord
                .or_else(|| body.get(fhir).filter(|v| !v.is_null()))
                .cloned()
        };
        Self {
            organisation: org.cloned().unwrap_or_else(|| body.clone()),
            name: field(&["Name"], "name").unwrap_or(Value::Null),
            status: field(&["Status"], "status").unwrap_or(Value::Null),
            last_change_date: Some(field(&["LastChangeDate"], "lastUpdated").unwrap_or(Value::Null)),
            addresses: Some(field(&["GeoLoc", "Location"], "address").unwrap_or(json!([]))),
            roles: Some(field(&["Roles", "Role"], "roles").unwrap_or(json!([]))),
            relationships: Some(field(&["Rels", "Rel"], "relationships").unwrap_or(json!([]))),
            contacts: Some(field(&["Contacts", "Contact"], "telecom").unwrap_or(json!([]))),
            raw_response: body,
            fallback: false,
            fallback_reason: None,
            ods_code: None,
        }
    }

    /// Code-only record used when every endpoint failed.
    pub fn minimal(ods_code: &str, reason: &str) -> Self {
        Self {
            organisation: json!({ "OrgId": { "extension": ods_code } }),
            name: Value::Null,
            status: json!("active"),
            last_change_date: None,
            addresses: None,
            roles: None,
            relationships: None,
            contacts: None,
            raw_response: json!({
                "resourceType": "Organization",
                "id": ods_code,
                "identifier": [{ "system": ODS_IDENTIFIER_SYSTEM, "value": ods_code }],
                "active": true,
            }),
            fallback: true,
            fallback_reason: Some(reason.to_string()),
            ods_code: Some(ods_code.to_string()),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Outcome of walking the strategy chain.
#[derive(Debug, Clone)]
pub struct OdsLookup {
    pub data: OdsData,
    /// Label of the endpoint that answered, `None` for the synthesized record.
    pub source: Option<&'static str>,
    pub failures: Vec<String>,
}

impl OdsLookup {
    pub fn is_fallback(&self) -> bool {
        self.data.fallback
    }
}

pub struct OdsClient {
    http: Client,
    strategies: Vec<OdsStrategy>,
}

impl OdsClient {
    pub fn new(cfg: &NhsConfig) -> Result<Self, NhsError> {
        let strategies = vec![
            OdsStrategy {
                label: "primary",
                base_url: cfg.ods_primary_url.clone(),
                subscription_key: cfg.ods_subscription_key.clone(),
            },
            OdsStrategy {
                label: "directory-api",
                base_url: cfg.ods_directory_url.clone(),
                subscription_key: None,
            },
            OdsStrategy {
                label: "spine",
                base_url: cfg.ods_spine_url.clone(),
                subscription_key: None,
            },
        ];
        Ok(Self {
            http: http_client(DEFAULT_USER_AGENT, cfg.timeout)?,
            strategies,
        })
    }

    pub fn strategies(&self) -> &[OdsStrategy] {
        &self.strategies
    }

    /// Try each endpoint in order; the first 2xx wins. Never fails: when every
    /// endpoint is exhausted a minimal record flagged `fallback` is returned.
    pub async fn lookup(&self, ods_code: &str) -> OdsLookup {
        let mut failures = Vec::new();
        for strategy in &self.strategies {
            match self.try_strategy(strategy, ods_code).await {
                Ok(body) => {
                    info!(ods_code, source = strategy.label, "ods organisation fetched");
                    return OdsLookup {
                        data: OdsData::from_response(body),
                        source: Some(strategy.label),
                        failures,
                    };
                }
                Err(e) => {
                    warn!(ods_code, source = strategy.label, error = %e, "ods endpoint failed; trying next");
                    failures.push(format!("{}: {e}", strategy.label));
                }
            }
        }
        warn!(ods_code, "all ods endpoints failed; using minimal record");
        OdsLookup {
            data: OdsData::minimal(ods_code, "All API endpoints failed"),
            source: None,
            failures,
        }
    }

    async fn try_strategy(&self, strategy: &OdsStrategy, ods_code: &str) -> Result<Value, NhsError> {
        let url = format!(
            "{}/{}",
            strategy.base_url.trim_end_matches('/'),
            urlencoding::encode(ods_code)
        );
        let mut req = self.http.get(&url).header(ACCEPT, FHIR_JSON);
        if let Some(key) = &strategy.subscription_key {
            req = req.header("Subscription-Key", key.as_str());
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(NhsError::Http {
                status: status.as_u16(),
                url,
            });
        }
        let text = resp.text().await?;
        Ok(serde_json::from_str(&text)?)
    }
}
