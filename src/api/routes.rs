// API route configuration

use crate::api::handlers;
use actix_web::web;

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg
        // Health check (no auth required)
        .route("/health", web::get().to(handlers::health_check))
        .route("/", web::get().to(handlers::health_check))
        .service(
            web::scope("/api/v1")
                .service(
                    web::resource("/sync-cqc-all-gps")
                        .route(web::get().to(handlers::sync_cqc_all_gps))
                        .route(web::post().to(handlers::sync_cqc_all_gps)),
                )
                .route(
                    "/fetch-cqc-details",
                    web::post().to(handlers::fetch_cqc_details),
                )
                .route(
                    "/fetch-nhs-data-complete",
                    web::post().to(handlers::fetch_nhs_data_complete),
                ),
        );
}
