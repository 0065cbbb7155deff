//! Reading api-field values out of raw provider responses.

use chrono::{DateTime, NaiveDate};
use metrics_core::stats::finite;
use metrics_core::{ApiCallDefinition, MetricValue, SeriesPoint};
use serde_json::Value;

/// Value found at a response key, with the dates it represents
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub value: MetricValue,
    pub dates: Vec<NaiveDate>,
}

/// Walk a dot-separated path. Numeric segments index into arrays.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|seg| !seg.is_empty())
        .try_fold(value, |current, seg| match current {
            Value::Object(map) => map.get(seg),
            Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Numeric leaf; numeric strings are accepted, anything else is missing.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().and_then(finite),
        Value::String(s) => s.trim().parse::<f64>().ok().and_then(finite),
        _ => None,
    }
}

/// ISO date (optionally with a time part) or epoch seconds/millis.
pub fn parse_date(value: &Value) -> Option<NaiveDate> {
    match value {
        Value::String(s) => {
            let head = s.get(..10).unwrap_or(s.as_str());
            NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
        }
        Value::Number(n) => {
            let raw = n.as_i64()?;
            let millis = if raw.abs() >= 100_000_000_000 { raw } else { raw * 1000 };
            DateTime::from_timestamp_millis(millis).map(|dt| dt.date_naive())
        }
        _ => None,
    }
}

/// Extract `response_key` from a call's response as of `event_date`.
///
/// Row lists become series (most recent first) with rows after the event
/// date dropped. Snapshot calls collapse to the latest row at the event date.
/// Missing keys and non-numeric leaves yield `None`.
pub fn extract(
    body: &Value,
    call: &ApiCallDefinition,
    response_key: &str,
    event_date: NaiveDate,
) -> Option<Extracted> {
    let root = match &call.results_key {
        Some(key) => lookup(body, key)?,
        None => body,
    };

    match root {
        Value::Array(rows) => {
            let mut points: Vec<SeriesPoint> = rows
                .iter()
                .filter_map(|row| {
                    let date = match &call.date_field {
                        Some(field) => Some(lookup(row, field).and_then(parse_date)?),
                        None => None,
                    };
                    if date.map(|d| d > event_date).unwrap_or(false) {
                        return None;
                    }
                    let value = lookup(row, response_key).and_then(as_number)?;
                    Some(SeriesPoint::new(date, value))
                })
                .collect();

            // Stable: undated rows keep provider order after dated ones
            points.sort_by(|a, b| match (a.date, b.date) {
                (Some(x), Some(y)) => y.cmp(&x),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            });

            if call.single_date {
                let latest = points.into_iter().next()?;
                return Some(Extracted {
                    dates: vec![latest.date.unwrap_or(event_date)],
                    value: MetricValue::Scalar(latest.value),
                });
            }
            if points.is_empty() {
                return None;
            }
            Some(Extracted {
                dates: points.iter().filter_map(|p| p.date).collect(),
                value: MetricValue::Series(points),
            })
        }
        _ => {
            let date = call
                .date_field
                .as_deref()
                .and_then(|field| lookup(root, field))
                .and_then(parse_date);
            if date.map(|d| d > event_date).unwrap_or(false) {
                return None;
            }

            match lookup(root, response_key)? {
                Value::Array(items) => {
                    let points: Vec<SeriesPoint> = items
                        .iter()
                        .filter_map(as_number)
                        .map(|v| SeriesPoint::new(None, v))
                        .collect();
                    if points.is_empty() {
                        return None;
                    }
                    if call.single_date {
                        return Some(Extracted {
                            value: MetricValue::Scalar(points[0].value),
                            dates: vec![date.unwrap_or(event_date)],
                        });
                    }
                    Some(Extracted {
                        value: MetricValue::Series(points),
                        dates: date.into_iter().collect(),
                    })
                }
                leaf => {
                    let value = as_number(leaf)?;
                    let dates = match (date, call.single_date) {
                        (Some(d), _) => vec![d],
                        (None, true) => vec![event_date],
                        (None, false) => Vec::new(),
                    };
                    Some(Extracted {
                        value: MetricValue::Scalar(value),
                        dates,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn financials_call() -> ApiCallDefinition {
        ApiCallDefinition {
            id: "financials".to_string(),
            endpoint: "/vX/reference/financials".to_string(),
            query: BTreeMap::new(),
            results_key: Some("results".to_string()),
            date_field: Some("end_date".to_string()),
            single_date: false,
        }
    }

    fn financials_body() -> Value {
        json!({
            "results": [
                {"end_date": "2024-03-31", "financials": {"income_statement": {"eps": {"value": 1.5}}}},
                {"end_date": "2024-09-30", "financials": {"income_statement": {"eps": {"value": 2.0}}}},
                {"end_date": "2024-06-30", "financials": {"income_statement": {"eps": {"value": "1.75"}}}},
                {"end_date": "2023-12-31", "financials": {"income_statement": {"eps": {"value": "n/a"}}}}
            ]
        })
    }

    #[test]
    fn test_rows_become_series_most_recent_first() {
        let out = extract(
            &financials_body(),
            &financials_call(),
            "financials.income_statement.eps.value",
            date("2024-12-31"),
        )
        .unwrap();

        match out.value {
            MetricValue::Series(points) => {
                let values: Vec<f64> = points.iter().map(|p| p.value).collect();
                assert_eq!(values, vec![2.0, 1.75, 1.5]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(out.dates[0], date("2024-09-30"));
    }

    #[test]
    fn test_rows_after_event_date_dropped() {
        let out = extract(
            &financials_body(),
            &financials_call(),
            "financials.income_statement.eps.value",
            date("2024-07-15"),
        )
        .unwrap();
        assert_eq!(out.value.as_scalar(), Some(1.75));
        assert_eq!(out.dates.len(), 2);
    }

    #[test]
    fn test_missing_key_is_none() {
        let out = extract(&financials_body(), &financials_call(), "financials.balance_sheet.equity.value", date("2024-12-31"));
        assert!(out.is_none());
        assert!(extract(&json!({"status": "OK"}), &financials_call(), "eps", date("2024-12-31")).is_none());
    }

    #[test]
    fn test_snapshot_call_uses_latest_row_at_event_date() {
        let call = ApiCallDefinition {
            id: "daily_bars".to_string(),
            endpoint: "/v2/aggs".to_string(),
            query: BTreeMap::new(),
            results_key: Some("results".to_string()),
            date_field: Some("t".to_string()),
            single_date: true,
        };
        // 2024-01-02, 2024-01-03, 2024-01-04 (UTC millis)
        let body = json!({"results": [
            {"t": 1704153600000i64, "c": 100.0},
            {"t": 1704240000000i64, "c": 101.0},
            {"t": 1704326400000i64, "c": 102.0}
        ]});

        let out = extract(&body, &call, "c", date("2024-01-03")).unwrap();
        assert_eq!(out.value, MetricValue::Scalar(101.0));
        assert_eq!(out.dates, vec![date("2024-01-03")]);
    }

    #[test]
    fn test_object_leaf_snapshot_dated_at_event() {
        let call = ApiCallDefinition {
            id: "ticker_details".to_string(),
            endpoint: "/v3/reference/tickers/{ticker}".to_string(),
            query: BTreeMap::new(),
            results_key: Some("results".to_string()),
            date_field: None,
            single_date: true,
        };
        let body = json!({"results": {"market_cap": 2.5e12}});
        let out = extract(&body, &call, "market_cap", date("2024-05-01")).unwrap();
        assert_eq!(out.value, MetricValue::Scalar(2.5e12));
        assert_eq!(out.dates, vec![date("2024-05-01")]);
    }

    #[test]
    fn test_parse_date_formats() {
        assert_eq!(parse_date(&json!("2024-06-30T00:00:00Z")), Some(date("2024-06-30")));
        assert_eq!(parse_date(&json!(1704153600)), Some(date("2024-01-02")));
        assert_eq!(parse_date(&json!(true)), None);
    }
}
