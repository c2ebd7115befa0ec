// HTTP request handlers for API endpoints

use std::time::Instant;

use crate::api::models::{ApiError, ApiResponse, HealthResponse, SyncQuery};
use crate::api::server::AppState;
use crate::cqc::CqcApiClient;
use crate::nhs::{OdsClient, PrescribingClient};
use crate::sync::facility::{self, CqcDetailsRequest, NhsDataRequest, NhsSources};
use crate::sync::{change_window_timestamp, SyncMode, SyncOptions, SyncService};
use actix_web::{web, HttpResponse};
use chrono::Utc;

/// Health check endpoint
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let database = match &state.pool {
        Some(pool) => match sqlx::query_scalar::<_, bool>("SELECT true")
            .fetch_one(pool)
            .await
        {
            Ok(_) => "connected",
            Err(_) => "disconnected",
        },
        None => "not configured",
    };

    HttpResponse::Ok().json(ApiResponse::success(HealthResponse {
        status: "healthy".to_string(),
        database: database.to_string(),
        uptime_seconds: state.started.elapsed().as_secs(),
    }))
}

/// Validated form of [`SyncQuery`].
#[derive(Debug, PartialEq)]
struct SyncRequest {
    mode: SyncMode,
    start: Option<String>,
    end: Option<String>,
}

impl TryFrom<SyncQuery> for SyncRequest {
    type Error = ApiError;

    fn try_from(q: SyncQuery) -> Result<Self, ApiError> {
        let mode = match q.mode.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
            None => SyncMode::Full,
            Some(raw) => raw.parse::<SyncMode>().map_err(|_| {
                ApiError::BadRequest(r#"Invalid mode parameter. Use "full" or "delta"."#.into())
            })?,
        };
        if mode == SyncMode::Full {
            return Ok(Self {
                mode,
                start: None,
                end: None,
            });
        }

        let start = q
            .start_timestamp
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| {
                ApiError::BadRequest("Delta mode requires startTimestamp parameter".into())
            })?;
        let start = change_window_timestamp(&start)
            .map_err(|e| ApiError::BadRequest(format!("Invalid startTimestamp: {e}")))?;
        let end = q
            .end_timestamp
            .filter(|s| !s.trim().is_empty())
            .map(|raw| change_window_timestamp(&raw))
            .transpose()
            .map_err(|e| ApiError::BadRequest(format!("Invalid endTimestamp: {e}")))?;

        Ok(Self {
            mode,
            start: Some(start),
            end,
        })
    }
}

/// Run a full or delta sync and answer with the run summary.
pub async fn sync_cqc_all_gps(
    state: web::Data<AppState>,
    query: web::Query<SyncQuery>,
) -> Result<HttpResponse, ApiError> {
    let req = SyncRequest::try_from(query.into_inner())?;
    tracing::info!(mode = ?req.mode, start = ?req.start, end = ?req.end, "sync requested");

    let started = Instant::now();
    let client = CqcApiClient::new(state.config.cqc.clone())
        .map_err(|e| ApiError::internal("Sync failed", e))?;
    let service = SyncService::new(
        &client,
        state.store.as_ref(),
        SyncOptions::from_config(&state.config),
    );

    let outcome = match (req.mode, req.start.as_deref()) {
        (SyncMode::Delta, Some(start)) => service.delta_sync(start, req.end.as_deref()).await,
        _ => service.full_sync().await,
    };
    let stats = outcome.map_err(|e| {
        tracing::error!(error = %e, mode = ?req.mode, "sync aborted");
        ApiError::internal("Sync failed", e)
    })?;

    Ok(HttpResponse::Ok().json(stats.summary(req.mode, started.elapsed())))
}

pub async fn fetch_cqc_details(
    state: web::Data<AppState>,
    payload: web::Json<CqcDetailsRequest>,
) -> Result<HttpResponse, ApiError> {
    let client = CqcApiClient::new(state.config.cqc.clone())
        .map_err(|e| ApiError::internal("Facility refresh failed", e))?;
    let response = facility::fetch_cqc_details(
        &client,
        state.store.as_ref(),
        &state.config.store,
        &payload,
        Utc::now(),
    )
    .await?;
    Ok(HttpResponse::Ok().json(response))
}

pub async fn fetch_nhs_data_complete(
    state: web::Data<AppState>,
    payload: web::Json<NhsDataRequest>,
) -> Result<HttpResponse, ApiError> {
    let cqc = CqcApiClient::new(state.config.cqc.clone())
        .map_err(|e| ApiError::internal("NHS data fetch failed", e))?;
    let ods = OdsClient::new(&state.config.nhs)
        .map_err(|e| ApiError::internal("NHS data fetch failed", e))?;
    let prescribing = PrescribingClient::new(&state.config.nhs)
        .map_err(|e| ApiError::internal("NHS data fetch failed", e))?;

    let response = facility::fetch_nhs_data(
        NhsSources {
            cqc: &cqc,
            ods: &ods,
            prescribing: &prescribing,
        },
        state.store.as_ref(),
        &state.config.store,
        &payload,
        Utc::now(),
    )
    .await?;
    Ok(HttpResponse::Ok().json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{auth::Auth, middleware, routes};
    use crate::config::AppConfig;
    use crate::database_ops::MemoryStore;
    use crate::test_support::spawn_upstream;
    use actix_web::{http::StatusCode, test, App};
    use serde_json::{json, Value};
    use std::sync::Arc;

    const SECRET: &str = "test-secret";

    macro_rules! init_app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($state))
                    .app_data(middleware::json_config())
                    .wrap(Auth::new(SECRET))
                    .configure(routes::configure_routes),
            )
            .await
        };
    }

    fn state_with(config: AppConfig, store: Arc<MemoryStore>) -> AppState {
        AppState::new(config, store, None)
    }

    fn offline_state() -> AppState {
        state_with(
            AppConfig::for_upstream("http://127.0.0.1:9"),
            Arc::new(MemoryStore::new()),
        )
    }

    fn authed(req: test::TestRequest) -> test::TestRequest {
        req.insert_header(("Authorization", format!("Bearer {SECRET}")))
    }

    #[actix_web::test]
    async fn health_is_public() {
        let app = init_app!(offline_state());
        let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["database"], "not configured");
    }

    #[actix_web::test]
    async fn api_routes_require_the_bearer_secret() {
        let app = init_app!(offline_state());

        let missing = test::TestRequest::get()
            .uri("/api/v1/sync-cqc-all-gps?mode=full")
            .to_request();
        let resp = test::call_service(&app, missing).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "error");

        let wrong = test::TestRequest::post()
            .uri("/api/v1/fetch-cqc-details")
            .insert_header(("Authorization", "Bearer nope"))
            .set_json(json!({"location_id": "1-A"}))
            .to_request();
        assert_eq!(test::call_service(&app, wrong).await.status(), StatusCode::UNAUTHORIZED);
    }

    #[actix_web::test]
    async fn sync_parameters_are_validated() {
        let app = init_app!(offline_state());
        let cases = [
            ("mode=weekly", r#"Invalid mode parameter. Use "full" or "delta"."#),
            ("mode=delta", "Delta mode requires startTimestamp parameter"),
            ("mode=delta&startTimestamp=", "Delta mode requires startTimestamp parameter"),
        ];
        for (query, message) in cases {
            let req = authed(test::TestRequest::get().uri(&format!("/api/v1/sync-cqc-all-gps?{query}")))
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{query}");
            let body: Value = test::read_body_json(resp).await;
            assert_eq!(body["message"], message);
        }

        let req = authed(
            test::TestRequest::post().uri("/api/v1/sync-cqc-all-gps?mode=delta&startTimestamp=last-week"),
        )
        .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn full_mode_ignores_the_window() {
        let req = SyncRequest::try_from(SyncQuery {
            mode: None,
            start_timestamp: Some("garbage".into()),
            end_timestamp: None,
        })
        .unwrap();
        assert_eq!(
            req,
            SyncRequest {
                mode: SyncMode::Full,
                start: None,
                end: None
            }
        );
    }

    #[actix_web::test]
    async fn delta_sync_runs_over_the_normalized_window() {
        let upstream = spawn_upstream(|req| match req.path() {
            "/public/v1/changes/location" => HttpResponse::Ok().json(json!({"changes": ["1-A"]})),
            "/public/v1/changes/provider" => HttpResponse::Ok().json(json!({"changes": []})),
            "/public/v1/locations/1-A" => HttpResponse::Ok().json(json!({
                "locationId": "1-A",
                "name": "Valley Surgery",
                "inspectionCategories": [{"code": "P", "name": "GP Practices"}],
            })),
            _ => HttpResponse::NotFound().finish(),
        })
        .await;
        let store = Arc::new(MemoryStore::new());
        let app = init_app!(state_with(AppConfig::for_upstream(&upstream.base), store.clone()));

        let req = authed(test::TestRequest::get().uri(
            "/api/v1/sync-cqc-all-gps?mode=delta&startTimestamp=2024-03-01T10:15:30%2B01:00",
        ))
        .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["mode"], "delta");
        assert_eq!(body["recordsUpserted"], 1);
        assert!(store.get("1-A").is_some());
        assert!(upstream
            .hits()
            .iter()
            .any(|h| h.contains("startTimestamp=2024-03-01T09%3A15%3A30Z")));
    }

    #[actix_web::test]
    async fn failed_listing_answers_500() {
        let upstream = spawn_upstream(|_| HttpResponse::ServiceUnavailable().finish()).await;
        let mut config = AppConfig::for_upstream(&upstream.base);
        config.cqc.max_retries = 0;
        let app = init_app!(state_with(config, Arc::new(MemoryStore::new())));

        let req = authed(test::TestRequest::post().uri("/api/v1/sync-cqc-all-gps")).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["message"], "Sync failed");
        assert!(body["details"].as_str().unwrap().contains("503"));
    }

    #[actix_web::test]
    async fn cqc_details_rejects_blank_location_and_bad_json() {
        let app = init_app!(offline_state());

        let blank = authed(test::TestRequest::post().uri("/api/v1/fetch-cqc-details"))
            .set_json(json!({"location_id": "  "}))
            .to_request();
        assert_eq!(test::call_service(&app, blank).await.status(), StatusCode::BAD_REQUEST);

        let garbled = authed(test::TestRequest::post().uri("/api/v1/fetch-cqc-details"))
            .insert_header(("Content-Type", "application/json"))
            .set_payload("{not json")
            .to_request();
        let resp = test::call_service(&app, garbled).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "error");
    }

    #[actix_web::test]
    async fn cqc_details_upstream_failure_answers_400() {
        let upstream = spawn_upstream(|_| HttpResponse::NotFound().finish()).await;
        let app = init_app!(state_with(
            AppConfig::for_upstream(&upstream.base),
            Arc::new(MemoryStore::new())
        ));

        let req = authed(test::TestRequest::post().uri("/api/v1/fetch-cqc-details"))
            .set_json(json!({"location_id": "1-UNKNOWN"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "error");
        assert!(body["message"].as_str().unwrap().contains("404"));
        assert!(body["details"].is_string());
    }

    #[actix_web::test]
    async fn nhs_data_falls_back_to_spine_and_writes_the_row() {
        let upstream = spawn_upstream(|req| {
            if req.path() == "/ORD/2-0-0/organisations/B81001" {
                HttpResponse::Ok().json(json!({"Organisation": {"Name": "SPINE PRACTICE"}}))
            } else {
                HttpResponse::NotFound().finish()
            }
        })
        .await;
        let store = Arc::new(MemoryStore::new());
        let app = init_app!(state_with(AppConfig::for_upstream(&upstream.base), store.clone()));

        let req = authed(test::TestRequest::post().uri("/api/v1/fetch-nhs-data-complete"))
            .set_json(json!({"ods_code": "B81001", "location_id": "1-A"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["database_updated"], true);
        assert_eq!(body["errors"], Value::Null);
        assert!(store.get("1-A").is_some());
    }
}
