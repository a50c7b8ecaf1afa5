use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::clients::GammaClient;
use crate::collectors::{normalize, Collector};
use crate::config::{GAMMA_MAX_PAGES, GAMMA_PAGE_SIZE};
use crate::error::Result;
use crate::rate_limit::{EndpointClass, RateLimiter};
use crate::storage::Storage;

/// Refreshes market metadata every cycle: paginates the open markets and one
/// page of recently-updated closed ones (to observe closures), upserting each.
pub struct MetadataCollector {
    gamma: Arc<GammaClient>,
    storage: Arc<Storage>,
    limiter: Arc<RateLimiter>,
    interval: Duration,
}

impl MetadataCollector {
    pub fn new(
        gamma: Arc<GammaClient>,
        storage: Arc<Storage>,
        limiter: Arc<RateLimiter>,
        interval: Duration,
    ) -> Self {
        Self { gamma, storage, limiter, interval }
    }

    async fn upsert_page(&self, items: &[serde_json::Value]) -> Result<(usize, usize)> {
        let mut upserted = 0usize;
        let mut skipped = 0usize;
        for item in items {
            match normalize::parse_market(item) {
                Some(market) => {
                    self.storage.upsert_market(&market).await?;
                    upserted += 1;
                }
                None => {
                    skipped += 1;
                    let q = item.get("question").and_then(|q| q.as_str()).unwrap_or("?");
                    warn!(question = %q, "skipping unparseable market record");
                }
            }
        }
        Ok((upserted, skipped))
    }
}

#[async_trait]
impl Collector for MetadataCollector {
    fn name(&self) -> &'static str {
        "metadata"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn collect_once(&self) -> Result<usize> {
        let mut upserted = 0usize;
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
            let (up, skip) = self.upsert_page(&page).await?;
            upserted += up;
            skipped += skip;
            if page_len < GAMMA_PAGE_SIZE {
                break;
            }
            offset += GAMMA_PAGE_SIZE;
        }

        // Recently-updated closed markets, so closures flip the stored flag.
        self.limiter.acquire(EndpointClass::Gamma).await;
        let closed_page = self
            .gamma
            .markets_page(true, "updatedAt", GAMMA_PAGE_SIZE, 0)
            .await?;
        let (up, skip) = self.upsert_page(&closed_page).await?;
        upserted += up;
        skipped += skip;

        info!(upserted, skipped, "metadata cycle complete");
        Ok(upserted)
    }
}
