use chrono::{Datelike, Months, NaiveDate};
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{http_client, NhsError};
use crate::config::{NhsConfig, DEFAULT_USER_AGENT};

const TOP_MEDICATIONS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrescribingData {
    pub spending: Value,
    pub practice_details: Value,
    pub data_month: String,
    pub top_medications: Vec<Value>,
}

/// First day of the month three months before `today`. Published spend data
/// lags by roughly a quarter.
pub fn data_month(today: NaiveDate) -> NaiveDate {
    let first = today.with_day(1).unwrap_or(today);
    first.checked_sub_months(Months::new(3)).unwrap_or(first)
}

pub struct PrescribingClient {
    http: Client,
    base_url: String,
}

impl PrescribingClient {
    pub fn new(cfg: &NhsConfig) -> Result<Self, NhsError> {
        Ok(Self {
            http: http_client(DEFAULT_USER_AGENT, cfg.timeout)?,
            base_url: cfg.openprescribing_url.trim_end_matches('/').to_string(),
        })
    }

    /// Spend by practice for the lagged month plus the practice details. The
    /// details call is best-effort and yields `null` on failure.
    pub async fn fetch(&self, ods_code: &str, today: NaiveDate) -> Result<PrescribingData, NhsError> {
        let month = data_month(today).format("%Y-%m-%d").to_string();
        let code = urlencoding::encode(ods_code);
        let spending_url = format!(
            "{}/spending_by_practice/?format=json&code={code}&date={month}",
            self.base_url
        );
        let spending = self.get_json(&spending_url).await?;

        let details_url = format!(
            "{}/org_details/?format=json&org_type=practice&org={code}",
            self.base_url
        );
        let practice_details = match self.get_json(&details_url).await {
            Ok(v) => v,
            Err(e) => {
                warn!(ods_code, error = %e, "practice details unavailable");
                Value::Null
            }
        };

        let top_medications = spending
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .take(TOP_MEDICATIONS)
                    .map(|item| {
                        json!({
                            "name": item.get("name"),
                            "quantity": item.get("quantity"),
                            "items": item.get("items"),
                            "actual_cost": item.get("actual_cost"),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        info!(ods_code, month, "prescribing data fetched");
        Ok(PrescribingData {
            spending,
            practice_details,
            data_month: month,
            top_medications,
        })
    }

    async fn get_json(&self, url: &str) -> Result<Value, NhsError> {
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(NhsError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let text = resp.text().await?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::test_support::{query_param, spawn_upstream};
    use actix_web::HttpResponse;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn data_month_is_three_months_back_on_the_first() {
        assert_eq!(data_month(ymd(2024, 5, 31)), ymd(2024, 2, 1));
        assert_eq!(data_month(ymd(2024, 2, 15)), ymd(2023, 11, 1));
        assert_eq!(data_month(ymd(2024, 3, 1)), ymd(2023, 12, 1));
    }

    #[actix_web::test]
    async fn keeps_the_ten_largest_lines_and_tolerates_missing_details() {
        let upstream = spawn_upstream(|req| {
            if req.path().ends_with("/spending_by_practice/") {
                assert_eq!(query_param(req, "date").as_deref(), Some("2024-02-01"));
                let rows: Vec<_> = (0..15)
                    .map(|i| json!({"name": format!("Drug {i}"), "quantity": i, "items": 1, "actual_cost": 2.5, "bnf_code": "x"}))
                    .collect();
                HttpResponse::Ok().json(rows)
            } else {
                HttpResponse::NotFound().finish()
            }
        })
        .await;
        let cfg = AppConfig::for_upstream(&upstream.base);
        let client = PrescribingClient::new(&cfg.nhs).unwrap();

        let data = client.fetch("B81001", ymd(2024, 5, 10)).await.unwrap();
        assert_eq!(data.data_month, "2024-02-01");
        assert_eq!(data.top_medications.len(), 10);
        assert_eq!(data.top_medications[9]["name"], "Drug 9");
        assert!(data.top_medications[0].get("bnf_code").is_none());
        assert_eq!(data.practice_details, Value::Null);
        assert_eq!(data.spending.as_array().unwrap().len(), 15);
    }
}
