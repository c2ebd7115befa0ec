//! Column maps written by the single-facility handlers.
//!
//! Values follow a loose "present or null" rule: missing, `null`, `false` and
//! empty strings all become SQL NULL; numbers (including 0) and containers are
//! kept as-is.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use super::processor::{last_inspection_date, overall_rating};

pub type FieldMap = Map<String, Value>;

/// Columns every deployed version of the GP table is known to have.
pub const BASIC_COLUMNS: &[&str] = &[
    "location_id",
    "location_source",
    "provider_source",
    "location_name",
    "address_line_1",
    "address_line_2",
    "town_city",
    "county",
    "region",
    "postcode",
    "latitude",
    "longitude",
    "provider_id",
    "overall_rating",
    "last_inspection_date",
    "registration_date",
    "registration_status",
    "deregistration_date",
    "number_of_beds",
    "ratings",
    "regulated_activities",
    "contacts",
    "inspection_areas",
    "reports",
    "updated_at",
    "last_seen_at",
];

pub(crate) fn pick<'a>(v: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(v, |cur, key| cur.get(*key))
}

pub(crate) fn non_empty_string(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A number, or a string holding one.
pub(crate) fn number(v: Option<&Value>) -> Option<f64> {
    match v? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn or_null(v: Option<&Value>) -> Value {
    match v {
        None | Some(Value::Null) | Some(Value::Bool(false)) => Value::Null,
        Some(Value::String(s)) if s.is_empty() => Value::Null,
        Some(other) => other.clone(),
    }
}

fn num_or_null(v: Option<&Value>) -> Value {
    number(v).map(Value::from).unwrap_or(Value::Null)
}

/// True when `key` is absent, null or an empty string.
pub fn is_unset(map: &FieldMap, key: &str) -> bool {
    match map.get(key) {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        _ => false,
    }
}

fn set_if_unset(map: &mut FieldMap, key: &str, value: Option<Value>) {
    if let Some(v) = value.filter(|v| !v.is_null()) {
        if is_unset(map, key) {
            map.insert(key.to_string(), v);
        }
    }
}

/// Flattened columns of a raw CQC location payload.
pub fn cqc_location_fields(loc: &Value) -> FieldMap {
    let mut m = FieldMap::new();
    let mut put = |k: &str, v: Value| {
        m.insert(k.to_string(), v);
    };
    put("location_source", loc.clone());
    put("location_name", or_null(loc.get("name")));
    put("organisation_type", or_null(loc.get("organisationType")));
    put("location_type", or_null(loc.get("type")));
    put("also_known_as", or_null(loc.get("alsoKnownAs")));
    put("brand_id", or_null(loc.get("brandId")));
    put("brand_name", or_null(loc.get("brandName")));
    put("ods_code", or_null(loc.get("odsCode")));
    put("ods_ccg_code", or_null(loc.get("odsCcgCode")));
    put("ods_ccg_name", or_null(loc.get("odsCcgName")));
    put("website", or_null(loc.get("website")));

    put("address_line_1", or_null(loc.get("postalAddressLine1")));
    put("address_line_2", or_null(loc.get("postalAddressLine2")));
    put("town_city", or_null(loc.get("postalAddressTownCity")));
    put("county", or_null(loc.get("postalAddressCounty")));
    put("region", or_null(loc.get("region")));
    put("postcode", or_null(loc.get("postalCode")));

    put("latitude", num_or_null(loc.get("onspdLatitude")));
    put("longitude", num_or_null(loc.get("onspdLongitude")));
    put("uprn", or_null(loc.get("uprn")));
    put("constituency", or_null(loc.get("constituency")));
    put("local_authority", or_null(loc.get("localAuthority")));
    put("onspd_ccg_code", or_null(loc.get("onspdCcgCode")));
    put("onspd_ccg_name", or_null(loc.get("onspdCcgName")));
    put("onspd_icb_code", or_null(loc.get("onspdIcbCode")));
    put("onspd_icb_name", or_null(loc.get("onspdIcbName")));

    put("registration_date", or_null(loc.get("registrationDate")));
    put("registration_status", or_null(loc.get("registrationStatus")));
    put("deregistration_date", or_null(loc.get("deregistrationDate")));
    put("dormancy", or_null(loc.get("dormancy")));
    put("care_home", or_null(loc.get("careHome")));
    put("inspection_directorate", or_null(loc.get("inspectionDirectorate")));
    put("number_of_beds", loc.get("numberOfBeds").cloned().unwrap_or(Value::Null));
    put("main_phone_number", or_null(loc.get("mainPhoneNumber")));

    put(
        "last_inspection_date",
        last_inspection_date(loc).map(Value::from).unwrap_or(Value::Null),
    );
    put("last_report_date", or_null(pick(loc, &["lastReport", "publicationDate"])));
    put("provider_id", or_null(loc.get("providerId")));

    let overall = overall_rating(loc);
    put(
        "overall_rating",
        if overall.is_empty() { Value::Null } else { Value::from(overall) },
    );
    put("current_ratings", or_null(loc.get("currentRatings")));
    put(
        "key_question_ratings",
        or_null(pick(loc, &["currentRatings", "overall", "keyQuestionRatings"])),
    );
    put("ratings", or_null(loc.get("currentRatings")));
    put("regulated_activities", or_null(loc.get("regulatedActivities")));
    put("relationships", or_null(loc.get("relationships")));
    put("location_types", or_null(loc.get("locationTypes")));
    put("gac_service_types", or_null(loc.get("gacServiceTypes")));
    put("specialisms", or_null(loc.get("specialisms")));
    put("inspection_categories", or_null(loc.get("inspectionCategories")));
    put("inspection_areas", or_null(loc.get("inspectionAreas")));
    put("reports", or_null(loc.get("reports")));
    put("contacts", or_null(loc.get("contacts")));
    m
}

/// `provider_*` columns. With no provider every column is written as null.
pub fn cqc_provider_fields(provider: Option<&Value>) -> FieldMap {
    let p = provider.unwrap_or(&Value::Null);
    let mut m = FieldMap::new();
    m.insert("provider_source".into(), p.clone());
    for (col, key) in [
        ("provider_name", "name"),
        ("provider_type", "type"),
        ("ownership_type", "ownershipType"),
        ("companies_house_number", "companiesHouseNumber"),
        ("provider_registration_date", "registrationDate"),
        ("provider_registration_status", "registrationStatus"),
        ("provider_brand_id", "brandId"),
        ("provider_brand_name", "brandName"),
        ("provider_location_ids", "locationIds"),
        ("provider_address_line_1", "postalAddressLine1"),
        ("provider_address_line_2", "postalAddressLine2"),
        ("provider_town_city", "postalAddressTownCity"),
        ("provider_county", "postalAddressCounty"),
        ("provider_postcode", "postalCode"),
        ("provider_region", "region"),
        ("provider_uprn", "uprn"),
        ("provider_constituency", "constituency"),
        ("provider_local_authority", "localAuthority"),
        ("provider_inspection_directorate", "inspectionDirectorate"),
        ("provider_main_phone_number", "mainPhoneNumber"),
        ("provider_website", "website"),
        ("provider_onspd_icb_code", "onspdIcbCode"),
        ("provider_onspd_icb_name", "onspdIcbName"),
        ("provider_inspection_areas", "inspectionAreas"),
    ] {
        m.insert(col.into(), or_null(p.get(key)));
    }
    m.insert("provider_latitude".into(), num_or_null(p.get("onspdLatitude")));
    m.insert("provider_longitude".into(), num_or_null(p.get("onspdLongitude")));
    m
}

/// Provider assessment columns, including the flattened topic areas and
/// evidence categories of the first assessment group.
pub fn assessment_fields(assessment: Option<&Value>, now: DateTime<Utc>) -> FieldMap {
    let a = assessment.unwrap_or(&Value::Null);
    let first = a
        .get("assessment")
        .and_then(Value::as_array)
        .and_then(|l| l.first())
        .unwrap_or(&Value::Null);
    let group = first
        .get("ratings")
        .and_then(|r| r.get("asgRatings"))
        .and_then(Value::as_array)
        .and_then(|l| l.first())
        .unwrap_or(&Value::Null);
    let key_questions = group.get("keyQuestionRatings").and_then(Value::as_array);

    let mut m = FieldMap::new();
    let mut put = |k: &str, v: Value| {
        m.insert(k.to_string(), v);
    };
    put("provider_assessment_source", or_null(assessment));
    put("provider_current_ratings", or_null(a.get("currentRatings")));
    put("provider_historic_ratings", or_null(a.get("historicRatings")));
    put("provider_reports", or_null(a.get("reports")));
    put(
        "provider_last_report_date",
        or_null(pick(a, &["lastReport", "publicationDate"])),
    );
    put(
        "provider_overall_rating",
        or_null(pick(a, &["currentRatings", "overall", "rating"])),
    );
    put(
        "provider_key_question_ratings",
        or_null(pick(a, &["currentRatings", "overall", "keyQuestionRatings"])),
    );

    put("assessment_plan_id", or_null(group.get("assessmentPlanId")));
    put(
        "assessment_plan_published_date",
        or_null(first.get("assessmentPlanPublishedDateTime")),
    );
    put("assessment_plan_status", or_null(group.get("assessmentPlanStatus")));
    put("assessment_title", or_null(group.get("title")));
    put("assessment_date", or_null(group.get("assessmentDate")));
    put("assessment_commentary", or_null(group.get("commentary")));
    put("assessment_commentary_date", or_null(group.get("commentaryDate")));
    put("assessment_narrative", or_null(group.get("narrative")));
    put(
        "assessment_people_experience",
        or_null(group.get("overallPeopleExperience")),
    );
    put(
        "assessment_people_experience_date",
        or_null(group.get("overallPeopleExperienceDate")),
    );
    put("assessment_service_groups", or_null(a.get("assessmentServiceGroup")));
    put("assessment_ratings", or_null(first.get("ratings")));
    put("assessment_key_questions", or_null(group.get("keyQuestionRatings")));

    put(
        "assessment_topic_areas",
        key_questions
            .map(|kqs| {
                Value::Array(
                    kqs.iter()
                        .map(|kq| {
                            json!({
                                "name": kq.get("name"),
                                "percentageScore": kq.get("percentageScore"),
                                "topicAreas": kq.get("topicareas"),
                            })
                        })
                        .collect(),
                )
            })
            .unwrap_or(Value::Null),
    );
    put(
        "assessment_evidence_categories",
        key_questions
            .map(|kqs| Value::Array(evidence_categories(kqs)))
            .unwrap_or(Value::Null),
    );
    put(
        "assessment_fetched_at",
        if assessment.is_some() { json!(now) } else { Value::Null },
    );
    m
}

fn evidence_categories(key_questions: &[Value]) -> Vec<Value> {
    let mut out = Vec::new();
    for kq in key_questions {
        let topics = kq.get("topicareas").and_then(Value::as_array);
        for topic in topics.into_iter().flatten() {
            let cats = topic.get("evidenceCategory").and_then(Value::as_array);
            for ec in cats.into_iter().flatten() {
                out.push(json!({
                    "keyQuestion": kq.get("name"),
                    "topicArea": topic.get("name"),
                    "evidenceCategoryId": ec.get("evidenceCategoryId"),
                    "commentary": ec.get("commentary"),
                    "commentaryDate": ec.get("commentaryDate"),
                }));
            }
        }
    }
    out
}

/// Full column map for a `fetch-cqc-details` write.
pub fn cqc_details_fields(
    location_id: &str,
    location: &Value,
    provider: Option<&Value>,
    assessment: Option<&Value>,
    now: DateTime<Utc>,
) -> FieldMap {
    let mut m = FieldMap::new();
    m.insert("location_id".into(), Value::from(location_id));
    m.extend(cqc_location_fields(location));
    m.extend(cqc_provider_fields(provider));
    m.extend(assessment_fields(assessment, now));
    stamp(&mut m, now);
    m
}

/// `updated_at` / `last_seen_at` set to `now`.
pub fn stamp(m: &mut FieldMap, now: DateTime<Utc>) {
    m.insert("updated_at".into(), json!(now));
    m.insert("last_seen_at".into(), json!(now));
}

/// `full` restricted to [`BASIC_COLUMNS`].
pub fn basic_subset(full: &FieldMap) -> FieldMap {
    full.iter()
        .filter(|(k, _)| BASIC_COLUMNS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Fold normalized ODS data into `update`. Columns already populated (by CQC)
/// are left alone; the raw ODS blob and refresh timestamps are always written.
pub fn merge_ods_fields(update: &mut FieldMap, ods: &Value, ods_code: &str, now: DateTime<Utc>) {
    update.insert("nhs_ods_data".into(), ods.clone());
    update.insert("last_nhs_update".into(), json!(now));
    update.insert("nhs_last_updated".into(), json!(now));
    if !ods_code.trim().is_empty() {
        set_if_unset(update, "ods_code", Some(Value::from(ods_code)));
    }

    let contacts: Vec<&Value> = ods
        .get("contacts")
        .and_then(Value::as_array)
        .map(|c| c.iter().collect())
        .unwrap_or_default();

    if is_unset(update, "main_phone_number") {
        let phone = contacts.iter().find(|c| is_phone_contact(c)).and_then(|c| {
            non_empty_string(c.get("value"))
                .or_else(|| non_empty_string(c.get("valueString")))
                .or_else(|| non_empty_string(c.get("valueUrl")))
        });
        set_if_unset(update, "main_phone_number", phone.map(Value::from));
    }
    if is_unset(update, "website") {
        let web = contacts.iter().find(|c| is_web_contact(c)).and_then(|c| {
            non_empty_string(c.get("value")).or_else(|| non_empty_string(c.get("valueUrl")))
        });
        set_if_unset(update, "website", web.map(Value::from));
    }

    let primary = match ods.get("addresses") {
        Some(Value::Array(list)) => list.first(),
        Some(obj @ Value::Object(_)) => Some(obj),
        _ => None,
    };
    match primary {
        Some(addr) => merge_address(update, addr, true),
        None => {
            let raw = pick(ods, &["raw_response", "address"]);
            let raw = match raw {
                Some(Value::Array(list)) => list.first(),
                other => other,
            };
            if let Some(addr) = raw.filter(|a| a.is_object()) {
                merge_address(update, addr, false);
            }
        }
    }

    set_if_unset(update, "location_name", non_empty_string(ods.get("name")).map(Value::from));
    set_if_unset(
        update,
        "region",
        non_empty_string(pick(ods, &["organisation", "GeoLoc", "Region"])).map(Value::from),
    );
}

fn merge_address(update: &mut FieldMap, addr: &Value, with_coords: bool) {
    let s = |k: &str| non_empty_string(addr.get(k)).map(Value::from);
    // ORD shape
    set_if_unset(update, "address_line_1", s("AddrLn1"));
    set_if_unset(update, "address_line_2", s("AddrLn2"));
    set_if_unset(update, "town_city", s("Town"));
    set_if_unset(update, "county", s("County"));
    set_if_unset(update, "postcode", s("PostCode"));
    // FHIR shape
    if let Some(lines) = addr.get("line").and_then(Value::as_array) {
        set_if_unset(update, "address_line_1", non_empty_string(lines.first()).map(Value::from));
        set_if_unset(update, "address_line_2", non_empty_string(lines.get(1)).map(Value::from));
    }
    set_if_unset(update, "town_city", s("city"));
    set_if_unset(update, "county", s("district"));
    set_if_unset(update, "postcode", s("postalCode"));

    if with_coords {
        let lat = number(addr.get("Latitude")).or_else(|| number(pick(addr, &["position", "latitude"])));
        let lon =
            number(addr.get("Longitude")).or_else(|| number(pick(addr, &["position", "longitude"])));
        set_if_unset(update, "latitude", lat.map(Value::from));
        set_if_unset(update, "longitude", lon.map(Value::from));
    }
}

fn contact_attr(c: &Value, key: &str) -> String {
    c.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_ascii_lowercase()
}

fn is_phone_contact(c: &Value) -> bool {
    let value = c.get("value").and_then(Value::as_str).unwrap_or_default();
    contact_attr(c, "type") == "tel"
        || contact_attr(c, "system") == "phone"
        || value.starts_with('0')
        || value.starts_with("+44")
}

fn is_web_contact(c: &Value) -> bool {
    let value = c.get("value").and_then(Value::as_str).unwrap_or_default();
    let value_url = c.get("valueUrl").and_then(Value::as_str).unwrap_or_default();
    contact_attr(c, "type") == "url"
        || contact_attr(c, "system") == "url"
        || value.starts_with("http")
        || value.contains("www.")
        || value_url.starts_with("http")
}
