use std::time::Duration;

use crate::config::HTTP_TIMEOUT_SECS;
use crate::error::{AppError, Result};

/// Client for the Gamma metadata API (`/markets`).
pub struct GammaClient {
    base_url: String,
    http: reqwest::Client,
}

impl GammaClient {
    pub fn new(base_url: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self { base_url, http })
    }

    /// Fetch one page of markets. `order` is a Gamma sort field
    /// (e.g. "volume24hr", "updatedAt").
    pub async fn markets_page(
        &self,
        closed: bool,
        order: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<serde_json::Value>> {
        let url = format!(
            "{}/markets?closed={}&limit={}&offset={}&order={}&ascending=false",
            self.base_url, closed, limit, offset, order
        );

        let resp: serde_json::Value = self.http.get(&url).send().await?.json().await?;
        match resp {
            serde_json::Value::Array(items) => Ok(items),
            _ => Err(AppError::Upstream(
                "Gamma /markets response was not an array".to_string(),
            )),
        }
    }
}
