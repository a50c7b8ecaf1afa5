use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use crate::collectors::Collector;
use crate::config::{LOSER_MAX_PRICE, WINNER_MIN_PRICE};
use crate::error::Result;
use crate::storage::Storage;
use crate::types::Resolution;

/// Markets examined per cycle for resolution inference.
const RESOLUTION_BATCH_LIMIT: i64 = 200;

pub const DETECTION_METHOD_PRICE_INFERENCE: &str = "price_inference";

/// Infers winners for closed markets from their final observed prices and
/// writes each resolution exactly once. A market with ambiguous prices stays
/// unresolved and is re-examined next cycle.
pub struct ResolutionCollector {
    storage: Arc<Storage>,
    interval: Duration,
}

impl ResolutionCollector {
    pub fn new(storage: Arc<Storage>, interval: Duration) -> Self {
        Self { storage, interval }
    }
}

/// Index of the winning outcome, given the latest observed price per outcome
/// (None where no price was ever recorded).
///
/// A winner exists only when exactly one price is at the high extreme and
/// every other price is at the low extreme. Ties, ambiguity, and missing
/// data all return None; this function is total and never panics, whatever
/// the input shape.
pub fn infer_winner(prices: &[Option<f64>]) -> Option<usize> {
    if prices.is_empty() || prices.iter().any(Option::is_none) {
        return None;
    }

    let mut winner: Option<usize> = None;
    for (i, price) in prices.iter().enumerate() {
        let p = (*price)?;
        if p >= WINNER_MIN_PRICE {
            if winner.is_some() {
                return None; // two outcomes at the high extreme
            }
            winner = Some(i);
        } else if p > LOSER_MAX_PRICE {
            return None; // an outcome stuck in the ambiguous middle
        }
    }
    winner
}

#[async_trait]
impl Collector for ResolutionCollector {
    fn name(&self) -> &'static str {
        "resolutions"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn collect_once(&self) -> Result<usize> {
        let markets = self
            .storage
            .get_unresolved_closed_markets(RESOLUTION_BATCH_LIMIT)
            .await?;

        let mut resolved = 0usize;
        for market in &markets {
            let latest = self.storage.get_latest_prices(&market.clob_token_ids).await?;
            let prices: Vec<Option<f64>> = market
                .clob_token_ids
                .iter()
                .map(|t| latest.get(t).copied())
                .collect();

            let Some(idx) = infer_winner(&prices) else {
                continue;
            };
            // parse_market guarantees outcomes and tokens are index-aligned.
            let (Some(outcome), Some(token_id)) =
                (market.outcomes.get(idx), market.clob_token_ids.get(idx))
            else {
                continue;
            };

            let resolution = Resolution {
                condition_id: market.condition_id.clone(),
                outcome: outcome.clone(),
                winner_token_id: token_id.clone(),
                resolved_at: market.end_date.unwrap_or_else(Utc::now),
                payout_price: prices[idx].unwrap_or_default(),
                detection_method: DETECTION_METHOD_PRICE_INFERENCE.to_string(),
            };
            if self.storage.upsert_resolution(&resolution).await? {
                resolved += 1;
                info!(
                    condition_id = %resolution.condition_id,
                    outcome = %resolution.outcome,
                    "market resolved"
                );
            }
        }

        info!(examined = markets.len(), resolved, "resolution cycle complete");
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_winner_is_detected() {
        assert_eq!(infer_winner(&[Some(0.98), Some(0.02)]), Some(0));
        assert_eq!(infer_winner(&[Some(0.01), Some(0.99)]), Some(1));
    }

    #[test]
    fn ambiguous_prices_yield_no_winner() {
        assert_eq!(infer_winner(&[Some(0.55), Some(0.45)]), None);
        assert_eq!(infer_winner(&[Some(0.98), Some(0.30)]), None);
    }

    #[test]
    fn two_high_extremes_yield_no_winner() {
        assert_eq!(infer_winner(&[Some(0.97), Some(0.96)]), None);
    }

    #[test]
    fn missing_data_yields_no_winner() {
        assert_eq!(infer_winner(&[Some(0.98), None]), None);
        assert_eq!(infer_winner(&[None, None]), None);
        assert_eq!(infer_winner(&[]), None);
    }

    #[test]
    fn multi_outcome_market_resolves() {
        assert_eq!(
            infer_winner(&[Some(0.01), Some(0.97), Some(0.02), Some(0.0)]),
            Some(1)
        );
    }
}
