use std::time::Duration;

use crate::config::HTTP_TIMEOUT_SECS;
use crate::error::{AppError, Result};

/// Client for the CLOB REST API (`/books`).
pub struct ClobClient {
    base_url: String,
    http: reqwest::Client,
}

impl ClobClient {
    pub fn new(base_url: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self { base_url, http })
    }

    /// Fetch order books for a batch of tokens. Each element of the response
    /// carries `asset_id`, `bids` and `asks` with string-typed price levels.
    pub async fn books(&self, token_ids: &[String]) -> Result<Vec<serde_json::Value>> {
        let body: Vec<serde_json::Value> = token_ids
            .iter()
            .map(|id| serde_json::json!({ "token_id": id }))
            .collect();

        let url = format!("{}/books", self.base_url);
        let resp: serde_json::Value = self.http.post(&url).json(&body).send().await?.json().await?;
        match resp {
            serde_json::Value::Array(items) => Ok(items),
            _ => Err(AppError::Upstream(
                "CLOB /books response was not an array".to_string(),
            )),
        }
    }
}
