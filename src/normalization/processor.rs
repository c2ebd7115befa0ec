use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};

use super::fields::{non_empty_string, number, pick, FieldMap};
use crate::cqc::{CqcLocation, CqcProvider, CqcReport};

/// One denormalized row of the GP table, keyed by `location_id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FacilityRecord {
    pub location_id: String,
    pub location_name: Option<String>,
    pub address_line_1: Option<String>,
    pub address_line_2: Option<String>,
    pub town_city: Option<String>,
    pub county: Option<String>,
    pub region: Option<String>,
    pub postcode: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub provider_id: Option<String>,
    pub overall_rating: String,
    pub last_inspection_date: Option<String>,
    pub registration_date: Option<String>,
    pub registration_status: Option<String>,
    pub deregistration_date: Option<String>,
    pub location_source: Value,
    pub provider_source: Value,
    pub ratings: Value,
    pub regulated_activities: Value,
    pub contacts: Value,
    pub inspection_areas: Value,
    pub reports: Value,
    pub last_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FacilityRecord {
    /// Column map suitable for `FacilityStore::upsert_chunk`.
    pub fn into_fields(self) -> FieldMap {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// Turns raw CQC payloads into [`FacilityRecord`]s. Stateless apart from the
/// clock used for the freshness timestamps.
#[derive(Debug, Clone, Default)]
pub struct DataProcessor {
    fixed_now: Option<DateTime<Utc>>,
}

impl DataProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// A processor whose timestamps are pinned to `now`.
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            fixed_now: Some(now),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.fixed_now.unwrap_or_else(Utc::now)
    }

    pub fn process_location(
        &self,
        location: &CqcLocation,
        provider: Option<&CqcProvider>,
        reports: &[CqcReport],
    ) -> FacilityRecord {
        let raw = location.to_value();
        let addr = raw.get("postalAddressElements").unwrap_or(&Value::Null);
        let geo = raw.get("geoLocation").unwrap_or(&Value::Null);
        let provider_raw = provider.map(CqcProvider::to_value);
        let now = self.now();

        let text = |nested: &str, flat: &str| {
            non_empty_string(addr.get(nested)).or_else(|| non_empty_string(raw.get(flat)))
        };

        FacilityRecord {
            location_id: location.location_id.clone(),
            location_name: location
                .name
                .clone()
                .filter(|n| !n.trim().is_empty())
                .or_else(|| non_empty_string(raw.get("locationName"))),
            address_line_1: text("addressLine1", "postalAddressLine1"),
            address_line_2: text("addressLine2", "postalAddressLine2"),
            town_city: text("town", "postalAddressTownCity"),
            county: text("county", "postalAddressCounty"),
            region: text("region", "region"),
            postcode: text("postalCode", "postalCode"),
            latitude: number(geo.get("latitude")).or_else(|| number(raw.get("onspdLatitude"))),
            longitude: number(geo.get("longitude"))
                .or_else(|| number(raw.get("onspdLongitude"))),
            provider_id: location
                .provider_id
                .clone()
                .filter(|p| !p.trim().is_empty()),
            overall_rating: overall_rating(&raw),
            last_inspection_date: last_inspection_date(&raw),
            registration_date: non_empty_string(raw.get("registrationDate")),
            registration_status: non_empty_string(raw.get("registrationStatus")),
            deregistration_date: non_empty_string(raw.get("deregistrationDate")),
            ratings: merge_ratings(&raw, provider_raw.as_ref()),
            regulated_activities: array_or_empty(raw.get("regulatedActivities")),
            contacts: array_or_empty(raw.get("contacts")),
            inspection_areas: array_or_empty(raw.get("inspectionAreas")),
            reports: Value::Array(
                reports
                    .iter()
                    .filter_map(|r| serde_json::to_value(r).ok())
                    .collect(),
            ),
            location_source: raw.clone(),
            provider_source: provider_raw.unwrap_or(Value::Null),
            last_seen_at: now,
            updated_at: now,
        }
    }
}

/// The `rating` of the `currentRatings` entry keyed "overall". Both the list
/// form and the `{overall: {rating}}` object form occur upstream. Empty when absent.
pub fn overall_rating(location: &Value) -> String {
    let current = location.get("currentRatings");
    let from_list = current
        .and_then(Value::as_array)
        .and_then(|list| {
            list.iter().find(|r| {
                r.get("key")
                    .and_then(Value::as_str)
                    .is_some_and(|k| k.eq_ignore_ascii_case("overall"))
            })
        })
        .and_then(|r| non_empty_string(r.get("rating")));
    from_list
        .or_else(|| non_empty_string(current.and_then(|c| pick(c, &["overall", "rating"]))))
        .unwrap_or_default()
}

/// Newest `inspectionAreas[].inspectionDate`, else `lastInspectionDate`, else
/// `lastInspection.date`.
pub fn last_inspection_date(location: &Value) -> Option<String> {
    let mut dates: Vec<String> = location
        .get("inspectionAreas")
        .and_then(Value::as_array)
        .map(|areas| {
            areas
                .iter()
                .filter_map(|a| non_empty_string(a.get("inspectionDate")))
                .collect()
        })
        .unwrap_or_default();
    // Unparseable dates sort last.
    dates.sort_by_key(|d| std::cmp::Reverse(parse_date(d)));
    dates
        .into_iter()
        .next()
        .or_else(|| non_empty_string(location.get("lastInspectionDate")))
        .or_else(|| non_empty_string(pick(location, &["lastInspection", "date"])))
}

fn parse_date(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt);
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// `{current, historic}` built from the location, topped up from the provider.
pub fn merge_ratings(location: &Value, provider: Option<&Value>) -> Value {
    let mut current = location.get("currentRatings").cloned().unwrap_or(json!([]));
    let mut historic: Vec<Value> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    push_historic(&mut historic, &mut seen, location.get("historicRatings"));

    if let Some(provider) = provider {
        if is_empty_ratings(&current) {
            if let Some(pc) = provider.get("currentRatings").filter(|c| !is_empty_ratings(c)) {
                current = pc.clone();
            }
        }
        push_historic(&mut historic, &mut seen, provider.get("historicRatings"));
    }

    json!({ "current": current, "historic": historic })
}

fn push_historic(out: &mut Vec<Value>, seen: &mut HashSet<String>, ratings: Option<&Value>) {
    let Some(list) = ratings.and_then(Value::as_array) else {
        return;
    };
    for r in list {
        match report_date(r) {
            Some(date) => {
                if seen.insert(date) {
                    out.push(r.clone());
                }
            }
            None => out.push(r.clone()),
        }
    }
}

fn report_date(rating: &Value) -> Option<String> {
    non_empty_string(rating.get("reportDate")).or_else(|| non_empty_string(rating.get("date")))
}

fn is_empty_ratings(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn array_or_empty(v: Option<&Value>) -> Value {
    match v {
        Some(Value::Null) | None => json!([]),
        Some(other) => other.clone(),
    }
}
