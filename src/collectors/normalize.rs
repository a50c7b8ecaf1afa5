//! Tolerant parsing of Gamma market records.
//!
//! Upstream list fields (`outcomes`, `clobTokenIds`, `outcomePrices`) arrive
//! either as native JSON arrays or as strings containing a serialized array;
//! numeric fields arrive as numbers or numeric strings. Each function here
//! accepts exactly those shapes and returns None for anything else, so a
//! malformed record skips cleanly instead of failing the batch.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;

use crate::types::Market;

/// A list of strings, given either natively or as a JSON-encoded string.
pub fn string_list(v: Option<&Value>) -> Option<Vec<String>> {
    match v? {
        Value::Array(items) => items
            .iter()
            .map(|i| i.as_str().map(str::to_string))
            .collect(),
        Value::String(s) => serde_json::from_str::<Vec<String>>(s).ok(),
        _ => None,
    }
}

/// A list of floats; elements may themselves be numbers or numeric strings.
pub fn f64_list(v: Option<&Value>) -> Option<Vec<f64>> {
    match v? {
        Value::Array(items) => items.iter().map(|i| flexible_f64(Some(i))).collect(),
        Value::String(s) => {
            let items: Vec<Value> = serde_json::from_str(s).ok()?;
            items.iter().map(|i| flexible_f64(Some(i))).collect()
        }
        _ => None,
    }
}

/// A float, given as a number or a numeric string.
pub fn flexible_f64(v: Option<&Value>) -> Option<f64> {
    match v? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// RFC 3339 timestamp or bare `YYYY-MM-DD` date.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s.trim()) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ndt| ndt.and_utc())
}

/// Parse one Gamma market record into a `Market`.
///
/// Returns None when the record is structurally unusable: missing
/// condition id, unreadable outcome/token lists, or lists that are not
/// index-aligned (every outcome must have exactly one token).
pub fn parse_market(v: &Value) -> Option<Market> {
    let condition_id = v.get("conditionId")?.as_str()?.to_string();
    if condition_id.is_empty() {
        return None;
    }

    let outcomes = string_list(v.get("outcomes"))?;
    let clob_token_ids = string_list(v.get("clobTokenIds"))?;
    if outcomes.len() < 2 || outcomes.len() != clob_token_ids.len() {
        return None;
    }

    let question = v
        .get("question")
        .and_then(|q| q.as_str())
        .unwrap_or("")
        .to_string();

    let active = v.get("active").and_then(|a| a.as_bool()).unwrap_or(true);
    let closed = v.get("closed").and_then(|c| c.as_bool()).unwrap_or(false);

    let end_date = v
        .get("endDate")
        .or_else(|| v.get("endDateIso"))
        .and_then(|e| e.as_str())
        .and_then(parse_timestamp);

    Some(Market {
        condition_id,
        question,
        outcomes,
        clob_token_ids,
        active,
        closed,
        end_date,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn string_list_accepts_native_array() {
        let v = json!(["Yes", "No"]);
        assert_eq!(
            string_list(Some(&v)),
            Some(vec!["Yes".to_string(), "No".to_string()])
        );
    }

    #[test]
    fn string_list_accepts_encoded_string() {
        let v = json!("[\"Yes\", \"No\"]");
        assert_eq!(
            string_list(Some(&v)),
            Some(vec!["Yes".to_string(), "No".to_string()])
        );
    }

    #[test]
    fn string_list_rejects_other_shapes() {
        assert_eq!(string_list(Some(&json!(42))), None);
        assert_eq!(string_list(Some(&json!([1, 2]))), None);
        assert_eq!(string_list(Some(&json!("not json"))), None);
        assert_eq!(string_list(None), None);
    }

    #[test]
    fn f64_list_accepts_mixed_element_shapes() {
        let v = json!(["0.55", 0.45]);
        let parsed = f64_list(Some(&v)).unwrap();
        assert!((parsed[0] - 0.55).abs() < 1e-9);
        assert!((parsed[1] - 0.45).abs() < 1e-9);

        let encoded = json!("[\"0.995\", \"0.005\"]");
        let parsed = f64_list(Some(&encoded)).unwrap();
        assert!((parsed[0] - 0.995).abs() < 1e-9);
    }

    #[test]
    fn flexible_f64_accepts_number_or_string() {
        assert_eq!(flexible_f64(Some(&json!(1.5))), Some(1.5));
        assert_eq!(flexible_f64(Some(&json!("1.5"))), Some(1.5));
        assert_eq!(flexible_f64(Some(&json!("abc"))), None);
        assert_eq!(flexible_f64(Some(&json!(null))), None);
    }

    #[test]
    fn parse_timestamp_handles_both_formats() {
        assert!(parse_timestamp("2026-03-01T12:00:00Z").is_some());
        assert!(parse_timestamp("2026-03-01").is_some());
        assert!(parse_timestamp("soon").is_none());
    }

    #[test]
    fn parse_market_full_record() {
        let v = json!({
            "conditionId": "0xabc",
            "question": "Will it rain?",
            "outcomes": "[\"Yes\", \"No\"]",
            "clobTokenIds": ["tok-yes", "tok-no"],
            "active": true,
            "closed": false,
            "endDate": "2026-03-01T12:00:00Z"
        });
        let market = parse_market(&v).unwrap();
        assert_eq!(market.condition_id, "0xabc");
        assert_eq!(market.outcomes, vec!["Yes", "No"]);
        assert_eq!(market.clob_token_ids, vec!["tok-yes", "tok-no"]);
        assert!(market.active);
        assert!(!market.closed);
        assert!(market.end_date.is_some());
    }

    #[test]
    fn parse_market_rejects_misaligned_lists() {
        let v = json!({
            "conditionId": "0xabc",
            "outcomes": ["Yes", "No"],
            "clobTokenIds": ["only-one"]
        });
        assert!(parse_market(&v).is_none());
    }

    #[test]
    fn parse_market_rejects_missing_condition_id() {
        let v = json!({
            "outcomes": ["Yes", "No"],
            "clobTokenIds": ["a", "b"]
        });
        assert!(parse_market(&v).is_none());
    }

    #[test]
    fn parse_market_rejects_garbage_token_field() {
        let v = json!({
            "conditionId": "0xabc",
            "outcomes": ["Yes", "No"],
            "clobTokenIds": 17
        });
        assert!(parse_market(&v).is_none());
    }
}
