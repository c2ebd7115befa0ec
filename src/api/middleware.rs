// Logging, compression, CORS and JSON body handling

use actix_cors::Cors;
use actix_web::http::header::{self, HeaderName};
use actix_web::middleware::{Compress, Logger};
use actix_web::web;

use crate::api::models::ApiError;

pub fn setup_middleware() -> (Logger, Compress) {
    (Logger::default(), Compress::default())
}

pub fn setup_cors(allowed_origins: &str) -> Cors {
    let mut cors = Cors::default()
        .allowed_methods(vec!["GET", "POST", "OPTIONS"])
        .allowed_headers(vec![
            header::AUTHORIZATION,
            header::ACCEPT,
            header::CONTENT_TYPE,
            HeaderName::from_static("x-client-info"),
            HeaderName::from_static("apikey"),
        ])
        .max_age(3600);

    for origin in allowed_origins.split(',').map(str::trim) {
        if origin == "*" {
            cors = cors.allow_any_origin();
        } else if !origin.is_empty() {
            cors = cors.allowed_origin(origin);
        }
    }
    cors
}

/// Malformed request bodies answer with the regular error envelope.
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(64 * 1024)
        .error_handler(|err, _req| ApiError::BadRequest(format!("Invalid request body: {err}")).into())
}
