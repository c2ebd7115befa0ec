// API request/response models (DTOs)

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sync::facility::FacilityError;

/// Standard wrapper for service endpoints (health).
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            meta: Some(Meta::now()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Meta {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub version: String,
}

impl Meta {
    pub fn now() -> Self {
        Self {
            timestamp: Utc::now(),
            request_id: uuid::Uuid::new_v4().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub database: String,
    pub uptime_seconds: u64,
}

/// Query string of `sync-cqc-all-gps`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQuery {
    pub mode: Option<String>,
    pub start_timestamp: Option<String>,
    pub end_timestamp: Option<String>,
}

/// Error body shared by every non-2xx answer.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub status: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    /// A single-facility refresh that failed upstream or in the store.
    #[error("{message}")]
    Rejected { message: String, details: String },
    #[error("{message}")]
    Internal { message: String, details: String },
}

impl ApiError {
    pub fn internal(message: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Internal {
            message: message.into(),
            details: err.to_string(),
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::Rejected { .. } => StatusCode::BAD_REQUEST,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let body = match self {
            Self::BadRequest(message) => ErrorBody {
                status: "error".into(),
                message: message.clone(),
                details: None,
            },
            Self::Rejected { message, details } | Self::Internal { message, details } => ErrorBody {
                status: "error".into(),
                message: message.clone(),
                details: Some(details.clone()),
            },
        };
        HttpResponse::build(self.status_code()).json(body)
    }
}

impl From<FacilityError> for ApiError {
    fn from(err: FacilityError) -> Self {
        match err {
            FacilityError::Invalid(msg) => Self::BadRequest(msg),
            other => Self::Rejected {
                message: other.to_string(),
                details: format!("{other:?}"),
            },
        }
    }
}
