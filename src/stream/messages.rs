use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::warn;

use crate::types::{Trade, TradeSide};

static PARSE_FAILURES: AtomicU64 = AtomicU64::new(0);

/// Raw deserializable shape covering market-channel WS messages. Fields are
/// optional because different event types carry different subsets; only
/// `last_trade_price` events matter to the listener.
#[derive(Debug, Deserialize)]
struct RawMarketMsg {
    event_type: Option<String>,
    asset_id: Option<String>,
    price: Option<String>,
    size: Option<String>,
    side: Option<String>,
    /// Epoch milliseconds as a string.
    timestamp: Option<String>,
}

/// Parse a raw WebSocket text frame into zero or more trades.
///
/// Frames arrive as a single JSON object or an array of objects. Events
/// other than `last_trade_price` are ignored; a trade event missing any of
/// price/size/side/asset_id is skipped. The feed carries no stable trade
/// identifier, so `trade_id` is always None here.
pub fn parse_trade_frames(raw: &str) -> Vec<Trade> {
    let msgs: Vec<RawMarketMsg> = if raw.trim_start().starts_with('[') {
        serde_json::from_str(raw).unwrap_or_default()
    } else {
        match serde_json::from_str::<RawMarketMsg>(raw) {
            Ok(m) => vec![m],
            Err(_) => vec![],
        }
    };

    if msgs.is_empty() {
        let count = PARSE_FAILURES.fetch_add(1, Ordering::Relaxed) + 1;
        if count <= 10 || count % 1000 == 0 {
            let sample = &raw[..500.min(raw.len())];
            warn!(count, "unrecognized WS frame: {sample}");
        }
        return vec![];
    }

    msgs.into_iter().filter_map(trade_from_msg).collect()
}

fn trade_from_msg(msg: RawMarketMsg) -> Option<Trade> {
    if msg.event_type.as_deref() != Some("last_trade_price") {
        return None;
    }
    let token_id = msg.asset_id?;
    let price = msg.price.as_deref()?.parse::<f64>().ok()?;
    let size = msg.size.as_deref()?.parse::<f64>().ok()?;
    let side = TradeSide::parse(msg.side.as_deref()?)?;
    let ts = msg
        .timestamp
        .as_deref()
        .and_then(parse_epoch_millis)
        .unwrap_or_else(Utc::now);

    Some(Trade { ts, token_id, side, price, size, trade_id: None })
}

fn parse_epoch_millis(s: &str) -> Option<DateTime<Utc>> {
    let ms = s.trim().parse::<i64>().ok()?;
    DateTime::<Utc>::from_timestamp_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_trade_event() {
        let raw = r#"{"event_type":"last_trade_price","asset_id":"tok1","price":"0.57","size":"120.5","side":"BUY","timestamp":"1757908892351"}"#;
        let trades = parse_trade_frames(raw);
        assert_eq!(trades.len(), 1);
        let t = &trades[0];
        assert_eq!(t.token_id, "tok1");
        assert!((t.price - 0.57).abs() < 1e-9);
        assert!((t.size - 120.5).abs() < 1e-9);
        assert_eq!(t.side, TradeSide::Buy);
        assert!(t.trade_id.is_none());
        assert_eq!(t.ts.timestamp_millis(), 1_757_908_892_351);
    }

    #[test]
    fn parses_array_of_events() {
        let raw = r#"[
            {"event_type":"last_trade_price","asset_id":"tok1","price":"0.57","size":"10","side":"SELL"},
            {"event_type":"book","asset_id":"tok1","asks":[],"bids":[]},
            {"event_type":"last_trade_price","asset_id":"tok2","price":"0.43","size":"5","side":"BUY"}
        ]"#;
        let trades = parse_trade_frames(raw);
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].side, TradeSide::Sell);
        assert_eq!(trades[1].token_id, "tok2");
    }

    #[test]
    fn missing_timestamp_defaults_to_now() {
        let raw = r#"{"event_type":"last_trade_price","asset_id":"tok1","price":"0.5","size":"1","side":"BUY"}"#;
        let trades = parse_trade_frames(raw);
        assert_eq!(trades.len(), 1);
        let age = Utc::now() - trades[0].ts;
        assert!(age.num_seconds() < 5);
    }

    #[test]
    fn incomplete_trade_event_is_skipped() {
        let raw = r#"{"event_type":"last_trade_price","asset_id":"tok1","price":"0.5"}"#;
        assert!(parse_trade_frames(raw).is_empty());

        let raw = r#"{"event_type":"last_trade_price","asset_id":"tok1","price":"0.5","size":"1","side":"HOLD"}"#;
        assert!(parse_trade_frames(raw).is_empty());
    }

    #[test]
    fn non_trade_events_ignored() {
        let raw = r#"{"event_type":"price_change","price_changes":[]}"#;
        assert!(parse_trade_frames(raw).is_empty());
    }

    #[test]
    fn garbage_returns_empty() {
        assert!(parse_trade_frames("not json at all").is_empty());
        assert!(parse_trade_frames(r#"{"totally":"unrelated"}"#).is_empty());
    }
}
