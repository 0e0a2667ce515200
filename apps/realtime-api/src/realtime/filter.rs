//! PostgREST-style single-column filters: `column=operator.value`.
//!
//! Supported operators: `eq`, `neq`, `gt`, `gte`, `lt`, `lte`, `in`.
//! Malformed filters never match.

use serde_json::Value;

use super::events::Row;

/// Whether `filter` holds for the change. The new image is preferred; the old
/// image is used when there is no new one (deletes).
pub fn matches_filter(filter: &str, new_row: Option<&Row>, old_row: Option<&Row>) -> bool {
    let Some((column, expr)) = filter.split_once('=') else {
        return false;
    };
    let Some((op, expected)) = expr.split_once('.') else {
        return false;
    };
    let column = column.trim();
    if column.is_empty() {
        return false;
    }

    let Some(row) = new_row.or(old_row) else {
        return false;
    };
    let Some(actual) = row.get(column) else {
        return false;
    };
    let actual = as_text(actual);

    match op {
        "eq" => values_equal(&actual, expected),
        "neq" => !values_equal(&actual, expected),
        "gt" => compare(&actual, expected, |a, b| a > b),
        "gte" => compare(&actual, expected, |a, b| a >= b),
        "lt" => compare(&actual, expected, |a, b| a < b),
        "lte" => compare(&actual, expected, |a, b| a <= b),
        "in" => parse_list(expected)
            .map(|items| items.iter().any(|item| values_equal(&actual, item)))
            .unwrap_or(false),
        _ => false,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn values_equal(actual: &str, expected: &str) -> bool {
    match (actual.parse::<f64>(), expected.parse::<f64>()) {
        (Ok(a), Ok(b)) => a == b,
        _ => actual == expected,
    }
}

/// Numeric comparison; when either side is not a number the comparison
/// degrades to equality.
fn compare(actual: &str, expected: &str, op: impl Fn(f64, f64) -> bool) -> bool {
    match (actual.parse::<f64>(), expected.parse::<f64>()) {
        (Ok(a), Ok(b)) => op(a, b),
        _ => actual == expected,
    }
}

/// `(a,b,c)` → `["a", "b", "c"]`.
fn parse_list(expected: &str) -> Option<Vec<&str>> {
    let inner = expected.strip_prefix('(')?.strip_suffix(')')?;
    Some(
        inner
            .split(',')
            .map(|item| item.trim().trim_matches('"'))
            .collect(),
    )
}
