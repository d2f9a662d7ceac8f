//! Lenient coercion of `ai_data` fields into the physicalized numeric and
//! timestamp columns.
//!
//! The AI may put `amount` / `value` / `occurred_at` at the top level or
//! under `entities`. Numbers may arrive as strings. Anything that does not
//! coerce cleanly leaves the column NULL; the open JSONB document is the
//! source of truth either way.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

/// `amount` from `ai_data.amount` or `ai_data.entities.amount`.
pub fn coerce_amount(ai_data: &Value) -> Option<f64> {
    coerce_number(field(ai_data, "amount")?)
}

/// `value` (generic numeric metric) from the same two locations.
pub fn coerce_value(ai_data: &Value) -> Option<f64> {
    coerce_number(field(ai_data, "value")?)
}

/// `occurred_at` as a UTC timestamp.
pub fn coerce_occurred_at(ai_data: &Value) -> Option<DateTime<Utc>> {
    let raw = field(ai_data, "occurred_at")?.as_str()?;
    parse_timestamp(raw)
}

fn field<'a>(ai_data: &'a Value, name: &str) -> Option<&'a Value> {
    ai_data
        .get(name)
        .or_else(|| ai_data.get("entities").and_then(|e| e.get(name)))
}

fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Accepts RFC 3339, a naive `YYYY-MM-DDTHH:MM:SS`, or a bare date
/// (midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let cleaned = raw.trim();
    if cleaned.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(cleaned) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(cleaned, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(cleaned, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(cleaned, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_amount_from_top_level_number() {
        assert_eq!(coerce_amount(&json!({"amount": 80})), Some(80.0));
        assert_eq!(coerce_amount(&json!({"amount": 80.5})), Some(80.5));
    }

    #[test]
    fn test_amount_from_string() {
        assert_eq!(coerce_amount(&json!({"amount": "80"})), Some(80.0));
        assert_eq!(coerce_amount(&json!({"amount": " 12.50 "})), Some(12.5));
    }

    #[test]
    fn test_amount_from_entities() {
        assert_eq!(
            coerce_amount(&json!({"entities": {"amount": 100}})),
            Some(100.0)
        );
        // Top level wins over entities.
        assert_eq!(
            coerce_amount(&json!({"amount": 1, "entities": {"amount": 2}})),
            Some(1.0)
        );
    }

    #[test]
    fn test_bad_amount_is_none() {
        assert_eq!(coerce_amount(&json!({"amount": "八十"})), None);
        assert_eq!(coerce_amount(&json!({"amount": null})), None);
        assert_eq!(coerce_amount(&json!({})), None);
        assert_eq!(coerce_amount(&json!({"amount": [80]})), None);
    }

    #[test]
    fn test_occurred_at_rfc3339() {
        let dt = coerce_occurred_at(&json!({"occurred_at": "2025-10-17T08:00:00+08:00"})).unwrap();
        assert_eq!(dt.to_rfc3339(), "2025-10-17T00:00:00+00:00");
    }

    #[test]
    fn test_occurred_at_naive_and_date_only() {
        let dt = coerce_occurred_at(&json!({"occurred_at": "2025-10-17T09:30:00"})).unwrap();
        assert_eq!(dt.to_rfc3339(), "2025-10-17T09:30:00+00:00");

        let dt = coerce_occurred_at(&json!({"occurred_at": "2025-10-17"})).unwrap();
        assert_eq!(dt.to_rfc3339(), "2025-10-17T00:00:00+00:00");
    }

    #[test]
    fn test_occurred_at_invalid_is_none() {
        assert_eq!(coerce_occurred_at(&json!({"occurred_at": "昨天"})), None);
        assert_eq!(coerce_occurred_at(&json!({"occurred_at": 20251017})), None);
        assert_eq!(coerce_occurred_at(&json!({})), None);
    }

    #[test]
    fn test_value_coercion() {
        assert_eq!(coerce_value(&json!({"value": 36.5})), Some(36.5));
        assert_eq!(coerce_value(&json!({"entities": {"value": "120"}})), Some(120.0));
        assert_eq!(coerce_value(&json!({"value": "n/a"})), None);
    }
}
