//! NHS data sources: the ODS organisation directory and OpenPrescribing.

pub mod ods;
pub mod prescribing;

use std::time::Duration;

use reqwest::Client;
use thiserror::Error;

pub use ods::{OdsClient, OdsData, OdsLookup};
pub use prescribing::{PrescribingClient, PrescribingData};

#[derive(Error, Debug)]
pub enum NhsError {
    #[error("http {status} from {url}")]
    Http { status: u16, url: String },
    #[error("network error: {0}")]
    Net(#[from] reqwest::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

fn http_client(user_agent: &str, timeout: Duration) -> Result<Client, NhsError> {
    Ok(Client::builder()
        .user_agent(user_agent.to_string())
        .timeout(timeout)
        .build()?)
}
