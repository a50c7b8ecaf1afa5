use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::clients::ClobClient;
use crate::collectors::Collector;
use crate::config::CLOB_BOOKS_BATCH_SIZE;
use crate::error::Result;
use crate::rate_limit::{EndpointClass, RateLimiter};
use crate::storage::Storage;
use crate::types::{BookLevel, OrderbookSnapshot};

/// Snapshots the order book of every tracked token each cycle, batching the
/// CLOB `/books` endpoint. A failed batch is logged and skipped; the
/// remaining batches still run (partial count).
pub struct BookCollector {
    clob: Arc<ClobClient>,
    storage: Arc<Storage>,
    limiter: Arc<RateLimiter>,
    interval: Duration,
    markets_limit: i64,
}

impl BookCollector {
    pub fn new(
        clob: Arc<ClobClient>,
        storage: Arc<Storage>,
        limiter: Arc<RateLimiter>,
        interval: Duration,
        markets_limit: i64,
    ) -> Self {
        Self { clob, storage, limiter, interval, markets_limit }
    }
}

/// CLOB levels arrive as `{"price": "0.40", "size": "100"}` with string
/// values; unparseable levels are dropped individually.
fn parse_levels(v: Option<&serde_json::Value>) -> Vec<BookLevel> {
    v.and_then(|v| v.as_array())
        .map(|levels| {
            levels
                .iter()
                .filter_map(|l| {
                    let price = l.get("price")?.as_str()?.parse::<f64>().ok()?;
                    let size = l.get("size")?.as_str()?.parse::<f64>().ok()?;
                    Some(BookLevel { price, size })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_book(item: &serde_json::Value) -> Option<OrderbookSnapshot> {
    let token_id = item.get("asset_id")?.as_str()?.to_string();
    let bids = parse_levels(item.get("bids"));
    let asks = parse_levels(item.get("asks"));
    Some(OrderbookSnapshot::from_levels(Utc::now(), token_id, bids, asks))
}

#[async_trait]
impl Collector for BookCollector {
    fn name(&self) -> &'static str {
        "books"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn collect_once(&self) -> Result<usize> {
        let markets = self.storage.get_active_markets(self.markets_limit).await?;
        let token_ids: Vec<String> = markets
            .iter()
            .flat_map(|m| m.clob_token_ids.iter().cloned())
            .collect();

        let mut snapshots: Vec<OrderbookSnapshot> = Vec::with_capacity(token_ids.len());
        let mut failed_batches = 0usize;

        for chunk in token_ids.chunks(CLOB_BOOKS_BATCH_SIZE) {
            self.limiter.acquire(EndpointClass::ClobBook).await;
            match self.clob.books(chunk).await {
                Ok(items) => {
                    for item in &items {
                        match parse_book(item) {
                            Some(snap) => snapshots.push(snap),
                            None => warn!("skipping book response without asset_id"),
                        }
                    }
                }
                Err(e) => {
                    failed_batches += 1;
                    warn!(batch_size = chunk.len(), "book batch fetch failed: {e}");
                }
            }
        }

        let inserted = self.storage.bulk_insert_orderbook_snapshots(&snapshots).await?;
        info!(inserted, failed_batches, "book cycle complete");
        Ok(inserted as usize)
    }
}
