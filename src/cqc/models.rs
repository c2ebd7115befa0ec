use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A CQC location (facility). Fields the pipeline keys on are typed; the rest
/// of the payload is kept verbatim in `extra` so it can be stored as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CqcLocation {
    pub location_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CqcLocation {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    pub fn report_link_ids(&self) -> Vec<String> {
        report_link_ids(&self.extra)
    }

    /// True when any `inspectionCategories[].name` matches `category` (case-insensitive).
    pub fn in_inspection_category(&self, category: &str) -> bool {
        self.extra
            .get("inspectionCategories")
            .and_then(Value::as_array)
            .map(|cats| {
                cats.iter().any(|c| {
                    c.get("name")
                        .and_then(Value::as_str)
                        .is_some_and(|n| n.trim().eq_ignore_ascii_case(category))
                })
            })
            .unwrap_or(false)
    }

    pub fn ods_code(&self) -> Option<&str> {
        non_empty_str(self.extra.get("odsCode"))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// The organisation that operates one or more locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CqcProvider {
    pub provider_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CqcProvider {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    pub fn report_link_ids(&self) -> Vec<String> {
        report_link_ids(&self.extra)
    }

    /// Location IDs operated by this provider. The live API returns
    /// `locationIds: [..]`; older payloads carry `locations: [{locationId}]`.
    pub fn location_ids(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(ids) = self.extra.get("locationIds").and_then(Value::as_array) {
            out.extend(ids.iter().filter_map(Value::as_str).map(str::to_string));
        }
        if let Some(locs) = self.extra.get("locations").and_then(Value::as_array) {
            out.extend(
                locs.iter()
                    .filter_map(|l| l.get("locationId").and_then(Value::as_str))
                    .map(str::to_string),
            );
        }
        out.dedup();
        out
    }

    pub fn ods_code(&self) -> Option<&str> {
        non_empty_str(self.extra.get("odsCode"))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// An inspection report document's metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CqcReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_link_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn report_link_ids(extra: &Map<String, Value>) -> Vec<String> {
    extra
        .get("reports")
        .and_then(Value::as_array)
        .map(|reports| {
            reports
                .iter()
                .filter_map(|r| r.get("reportLinkId").and_then(Value::as_str))
                .filter(|id| !id.trim().is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn non_empty_str(v: Option<&Value>) -> Option<&str> {
    v.and_then(Value::as_str).filter(|s| !s.trim().is_empty())
}

/// IDs from a `/changes/*` response. Accepts `changes: ["1-1", ..]` as well as
/// `changes: [{"id": "1-1"}, ..]`.
pub fn change_ids(body: &Value) -> Vec<String> {
    body.get("changes")
        .and_then(Value::as_array)
        .map(|changes| {
            changes
                .iter()
                .filter_map(|c| match c {
                    Value::String(s) => Some(s.clone()),
                    other => other.get("id").and_then(Value::as_str).map(str::to_string),
                })
                .filter(|id| !id.trim().is_empty())
                .collect()
        })
        .unwrap_or_default()
}
