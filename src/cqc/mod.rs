//! CQC public API access: typed payloads and a retrying HTTP client.

pub mod client;
pub mod models;

use thiserror::Error;

pub use client::{CqcApiClient, LocationListing, RegulatorApi};
pub use models::{CqcLocation, CqcProvider, CqcReport};

#[derive(Error, Debug)]
pub enum CqcError {
    #[error("http {status} from {url}: {body}")]
    Http {
        status: u16,
        url: String,
        body: String,
    },
    #[error("network: {0}")]
    Net(#[from] reqwest::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

impl CqcError {
    /// HTTP status of the failed response, if the failure was a response at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            CqcError::Http { status, .. } => Some(*status),
            CqcError::Net(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
