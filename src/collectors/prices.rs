use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::clients::GammaClient;
use crate::collectors::{normalize, Collector};
use crate::config::{GAMMA_MAX_PAGES, GAMMA_PAGE_SIZE};
use crate::error::Result;
use crate::rate_limit::{EndpointClass, RateLimiter};
use crate::storage::Storage;
use crate::types::PriceSnapshot;

/// Samples one price per token per cycle from Gamma's `outcomePrices`
/// (index-aligned with `clobTokenIds`), tagging each row with the market's
/// 24h volume when present.
pub struct PriceCollector {
    gamma: Arc<GammaClient>,
    storage: Arc<Storage>,
    limiter: Arc<RateLimiter>,
    interval: Duration,
}

impl PriceCollector {
    pub fn new(
        gamma: Arc<GammaClient>,
        storage: Arc<Storage>,
        limiter: Arc<RateLimiter>,
        interval: Duration,
    ) -> Self {
        Self { gamma, storage, limiter, interval }
    }
}

/// Extract per-token price rows from one market record. None when the
/// record's token or price lists are unreadable or misaligned.
fn snapshot_rows(item: &serde_json::Value) -> Option<Vec<PriceSnapshot>> {
    let token_ids = normalize::string_list(item.get("clobTokenIds"))?;
    let prices = normalize::f64_list(item.get("outcomePrices"))?;
    if token_ids.is_empty() || token_ids.len() != prices.len() {
        return None;
    }
    let volume_24h = normalize::flexible_f64(item.get("volume24hr"));
    let ts = Utc::now();

    Some(
        token_ids
            .into_iter()
            .zip(prices)
            .map(|(token_id, price)| PriceSnapshot { ts, token_id, price, volume_24h })
            .collect(),
    )
}

#[async_trait]
impl Collector for PriceCollector {
    fn name(&self) -> &'static str {
        "prices"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn collect_once(&self) -> Result<usize> {
        let mut rows: Vec<PriceSnapshot> = Vec::new();
        let mut skipped = 0usize;

        let mut offset = 0usize;
        for _ in 0..GAMMA_MAX_PAGES {
            self.limiter.acquire(EndpointClass::Gamma).await;
            let page = self
                .gamma
                .markets_page(false, "volume24hr", GAMMA_PAGE_SIZE, offset)
                .await?;
            if page.is_empty() {
                break;
            }
            let page_len = page.len();
            for item in &page {
                match snapshot_rows(item) {
                    Some(mut market_rows) => rows.append(&mut market_rows),
                    None => {
                        skipped += 1;
                        debug!("skipping market without readable prices");
                    }
                }
            }
            if page_len < GAMMA_PAGE_SIZE {
                break;
            }
            offset += GAMMA_PAGE_SIZE;
        }

        if skipped > 0 {
            warn!(skipped, "price cycle skipped unreadable market records");
        }
        let inserted = self.storage.bulk_insert_price_snapshots(&rows).await?;
        info!(inserted, "price cycle complete");
        Ok(inserted as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rows_align_tokens_with_prices() {
        let item = json!({
            "clobTokenIds": "[\"tok-yes\", \"tok-no\"]",
            "outcomePrices": "[\"0.62\", \"0.38\"]",
            "volume24hr": "12345.5"
        });
        let rows = snapshot_rows(&item).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].token_id, "tok-yes");
        assert!((rows[0].price - 0.62).abs() < 1e-9);
        assert_eq!(rows[1].token_id, "tok-no");
        assert!((rows[1].price - 0.38).abs() < 1e-9);
        assert!((rows[0].volume_24h.unwrap() - 12345.5).abs() < 1e-9);
    }

    #[test]
    fn missing_volume_is_none_not_fatal() {
        let item = json!({
            "clobTokenIds": ["tok-yes", "tok-no"],
            "outcomePrices": [0.5, 0.5]
        });
        let rows = snapshot_rows(&item).unwrap();
        assert!(rows[0].volume_24h.is_none());
    }

    #[test]
    fn misaligned_lists_skip_the_record() {
        let item = json!({
            "clobTokenIds": ["tok-yes", "tok-no"],
            "outcomePrices": ["0.5"]
        });
        assert!(snapshot_rows(&item).is_none());
    }

    #[test]
    fn unreadable_prices_skip_the_record() {
        let item = json!({
            "clobTokenIds": ["tok-yes", "tok-no"],
            "outcomePrices": {"yes": 0.5}
        });
        assert!(snapshot_rows(&item).is_none());
    }
}
