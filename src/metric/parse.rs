//! Parsing of RouterOS field values.
//!
//! The binary API returns every attribute as a string; REST returns JSON
//! strings too, with the occasional number or bool. These helpers accept both.

use serde_json::Value;

/// Parse a RouterOS duration such as `1w2d3h4m5s` into seconds.
///
/// Also accepts `hh:mm:ss` and bare seconds. Millisecond and microsecond
/// parts (`10ms`, `350us`) are ignored. Unparseable input yields 0.
pub fn parse_uptime(s: &str) -> u64 {
    let s = s.trim();
    if s.is_empty() {
        return 0;
    }
    if let Ok(secs) = s.parse::<u64>() {
        return secs;
    }
    if s.contains(':') {
        return s
            .split(':')
            .try_fold(0u64, |acc, part| part.parse::<u64>().ok().map(|v| acc * 60 + v))
            .unwrap_or(0);
    }

    let mut total = 0u64;
    let mut digits = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let value: u64 = digits.parse().unwrap_or(0);
        digits.clear();
        let factor = match c {
            'w' => 604_800,
            'd' => 86_400,
            'h' => 3_600,
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                0
            }
            'u' if chars.peek() == Some(&'s') => {
                chars.next();
                0
            }
            'm' => 60,
            's' => 1,
            _ => 0,
        };
        total += value * factor;
    }
    total
}

/// Interpret a RouterOS boolean (`true`/`yes`, JSON bools, non-zero numbers).
pub fn parse_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_f64().map(|v| v != 0.0),
        _ => None,
    }
}

/// Interpret a numeric field, tolerating string encoding and `%` suffixes.
pub fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Interpret a text field; numbers and bools are rendered, null is absent.
pub fn parse_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::String(_) | Value::Null => None,
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_uptime_units() {
        assert_eq!(parse_uptime("1w2d3h4m5s"), 604_800 + 2 * 86_400 + 3 * 3_600 + 4 * 60 + 5);
        assert_eq!(parse_uptime("3h"), 10_800);
        assert_eq!(parse_uptime("45s"), 45);
        assert_eq!(parse_uptime("2m10s350ms"), 130);
    }

    #[test]
    fn test_parse_uptime_other_forms() {
        assert_eq!(parse_uptime(""), 0);
        assert_eq!(parse_uptime("3600"), 3600);
        assert_eq!(parse_uptime("01:02:03"), 3723);
        assert_eq!(parse_uptime("garbage"), 0);
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool(&json!("true")), Some(true));
        assert_eq!(parse_bool(&json!("no")), Some(false));
        assert_eq!(parse_bool(&json!(true)), Some(true));
        assert_eq!(parse_bool(&json!(0)), Some(false));
        assert_eq!(parse_bool(&json!("maybe")), None);
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number(&json!("1500")), Some(1500.0));
        assert_eq!(parse_number(&json!("12%")), Some(12.0));
        assert_eq!(parse_number(&json!(7.5)), Some(7.5));
        assert_eq!(parse_number(&json!("n/a")), None);
    }

    #[test]
    fn test_parse_text() {
        assert_eq!(parse_text(&json!("x")), Some("x".to_string()));
        assert_eq!(parse_text(&json!("")), None);
        assert_eq!(parse_text(&json!(1500)), Some("1500".to_string()));
        assert_eq!(parse_text(&Value::Null), None);
    }
}
