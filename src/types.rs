use chrono::{DateTime, Utc};
use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ---------------------------------------------------------------------------
// Market
// ---------------------------------------------------------------------------

/// Market metadata as upserted by the metadata collector. `outcomes` and
/// `clob_token_ids` are index-aligned: `clob_token_ids[i]` is the tradable
/// token for `outcomes[i]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub condition_id: String,
    pub question: String,
    pub outcomes: Vec<String>,
    pub clob_token_ids: Vec<String>,
    pub active: bool,
    pub closed: bool,
    pub end_date: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Price snapshots
// ---------------------------------------------------------------------------

/// One row per token per poll cycle. Append-only, never mutated after insert.
#[derive(Debug, Clone, Serialize)]
pub struct PriceSnapshot {
    pub ts: DateTime<Utc>,
    pub token_id: String,
    pub price: f64,
    pub volume_24h: Option<f64>,
}

// ---------------------------------------------------------------------------
// Order book snapshots
// ---------------------------------------------------------------------------

/// A single price level. Serialized as a `[price, size]` pair so book
/// columns stay compact JSON arrays.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

impl Serialize for BookLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(2))?;
        seq.serialize_element(&self.price)?;
        seq.serialize_element(&self.size)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for BookLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct PairVisitor;

        impl<'de> Visitor<'de> for PairVisitor {
            type Value = BookLevel;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a [price, size] pair")
            }

            fn visit_seq<A: SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<BookLevel, A::Error> {
                let price = seq
                    .next_element()?
                    .ok_or_else(|| serde::de::Error::invalid_length(0, &self))?;
                let size = seq
                    .next_element()?
                    .ok_or_else(|| serde::de::Error::invalid_length(1, &self))?;
                Ok(BookLevel { price, size })
            }
        }

        deserializer.deserialize_seq(PairVisitor)
    }
}

/// Immutable point-in-time view of one token's book. Bids and asks are
/// ordered best price first. `spread` and `midpoint` are derived from the
/// top of book and are None whenever either side is empty.
#[derive(Debug, Clone, Serialize)]
pub struct OrderbookSnapshot {
    pub ts: DateTime<Utc>,
    pub token_id: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub spread: Option<f64>,
    pub midpoint: Option<f64>,
}

impl OrderbookSnapshot {
    /// Build a snapshot from raw levels, sorting each side best-first and
    /// computing the derived fields.
    pub fn from_levels(
        ts: DateTime<Utc>,
        token_id: String,
        mut bids: Vec<BookLevel>,
        mut asks: Vec<BookLevel>,
    ) -> Self {
        bids.sort_by(|a, b| b.price.total_cmp(&a.price));
        asks.sort_by(|a, b| a.price.total_cmp(&b.price));

        let best_bid = bids.first().map(|l| l.price);
        let best_ask = asks.first().map(|l| l.price);
        let (spread, midpoint) = match (best_bid, best_ask) {
            (Some(bid), Some(ask)) => (Some(ask - bid), Some((ask + bid) / 2.0)),
            _ => (None, None),
        };

        Self { ts, token_id, bids, asks, spread, midpoint }
    }
}

// ---------------------------------------------------------------------------
// Trades
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    /// Polymarket sends sides as "BUY"/"SELL". Anything else is unknown.
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("buy") {
            Some(TradeSide::Buy)
        } else if s.eq_ignore_ascii_case("sell") {
            Some(TradeSide::Sell)
        } else {
            None
        }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeSide::Buy => write!(f, "buy"),
            TradeSide::Sell => write!(f, "sell"),
        }
    }
}

/// A single executed trade. `trade_id` is absent for stream-sourced events
/// (the feed carries no stable identifier), so duplicates are tolerated there.
#[derive(Debug, Clone, Serialize)]
pub struct Trade {
    pub ts: DateTime<Utc>,
    pub token_id: String,
    pub side: TradeSide,
    pub price: f64,
    pub size: f64,
    pub trade_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolutions
// ---------------------------------------------------------------------------

/// Written once per resolved market, never updated after insert.
#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub condition_id: String,
    pub outcome: String,
    pub winner_token_id: String,
    pub resolved_at: DateTime<Utc>,
    pub payout_price: f64,
    pub detection_method: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn snapshot_derives_spread_and_midpoint() {
        let snap = OrderbookSnapshot::from_levels(
            ts(),
            "tok1".to_string(),
            vec![BookLevel { price: 0.40, size: 100.0 }],
            vec![BookLevel { price: 0.42, size: 50.0 }],
        );
        assert!((snap.spread.unwrap() - 0.02).abs() < 1e-9);
        assert!((snap.midpoint.unwrap() - 0.41).abs() < 1e-9);
    }

    #[test]
    fn one_sided_book_has_no_derived_fields() {
        let snap = OrderbookSnapshot::from_levels(
            ts(),
            "tok1".to_string(),
            vec![BookLevel { price: 0.40, size: 100.0 }],
            vec![],
        );
        assert!(snap.spread.is_none());
        assert!(snap.midpoint.is_none());

        let empty = OrderbookSnapshot::from_levels(ts(), "tok1".to_string(), vec![], vec![]);
        assert!(empty.spread.is_none());
        assert!(empty.midpoint.is_none());
    }

    #[test]
    fn levels_sorted_best_first() {
        let snap = OrderbookSnapshot::from_levels(
            ts(),
            "tok1".to_string(),
            vec![
                BookLevel { price: 0.38, size: 10.0 },
                BookLevel { price: 0.40, size: 100.0 },
            ],
            vec![
                BookLevel { price: 0.45, size: 5.0 },
                BookLevel { price: 0.42, size: 50.0 },
            ],
        );
        assert!((snap.bids[0].price - 0.40).abs() < 1e-9);
        assert!((snap.asks[0].price - 0.42).abs() < 1e-9);
        assert!((snap.spread.unwrap() - 0.02).abs() < 1e-9);
    }

    #[test]
    fn book_level_serializes_as_pair() {
        let level = BookLevel { price: 0.40, size: 100.0 };
        let json = serde_json::to_string(&level).unwrap();
        assert_eq!(json, "[0.4,100.0]");
        let back: BookLevel = serde_json::from_str(&json).unwrap();
        assert_eq!(back, level);
    }

    #[test]
    fn trade_side_parses_case_insensitively() {
        assert_eq!(TradeSide::parse("BUY"), Some(TradeSide::Buy));
        assert_eq!(TradeSide::parse("sell"), Some(TradeSide::Sell));
        assert_eq!(TradeSide::parse("hold"), None);
    }
}
