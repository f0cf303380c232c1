//! Parsers for the string formats field types accept.
//!
//! Every parser returns the normalized value, or `None` if the input does not
//! match the format.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};

const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d.%m.%Y"];

const DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

/// Parse an email address; returns it trimmed and lowercased.
pub fn parse_email(input: &str) -> Option<String> {
    let candidate = input.trim();
    let (local, domain) = candidate.split_once('@')?;
    if local.is_empty()
        || domain.len() < 3
        || domain.contains('@')
        || !domain.contains('.')
        || domain.starts_with('.')
        || domain.ends_with('.')
        || candidate.chars().any(char::is_whitespace)
    {
        return None;
    }
    Some(candidate.to_lowercase())
}

/// Parse an absolute http(s) URL; returns it trimmed.
pub fn parse_url(input: &str) -> Option<String> {
    let candidate = input.trim();
    let rest = candidate
        .strip_prefix("https://")
        .or_else(|| candidate.strip_prefix("http://"))?;
    let host = rest.split(['/', '?', '#']).next()?;
    let host_name = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);
    if host_name.is_empty()
        || candidate.chars().any(char::is_whitespace)
        || !(host_name.contains('.') || host_name == "localhost")
    {
        return None;
    }
    Some(candidate.to_string())
}

/// Parse a phone number: an optional leading `+` and 7 to 15 digits, with
/// spaces, dashes, dots, and parentheses allowed as separators. Returns the
/// input trimmed.
pub fn parse_phone(input: &str) -> Option<String> {
    let candidate = input.trim();
    let body = candidate.strip_prefix('+').unwrap_or(candidate);
    let mut digits = 0usize;
    for ch in body.chars() {
        match ch {
            '0'..='9' => digits += 1,
            ' ' | '-' | '.' | '(' | ')' => {}
            _ => return None,
        }
    }
    (7..=15).contains(&digits).then(|| candidate.to_string())
}

/// Parse a calendar date; returns `YYYY-MM-DD`. Timestamps are accepted and
/// reduced to their date.
pub fn parse_date(input: &str) -> Option<String> {
    let candidate = input.trim();
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(candidate, format) {
            return Some(date.format("%Y-%m-%d").to_string());
        }
    }
    parse_timestamp(candidate).map(|ts| ts.date_naive().format("%Y-%m-%d").to_string())
}

/// Parse a timestamp; returns RFC 3339 in UTC. A bare date is read as
/// midnight UTC.
pub fn parse_datetime(input: &str) -> Option<String> {
    let candidate = input.trim();
    let timestamp = parse_timestamp(candidate).or_else(|| {
        DATE_FORMATS.iter().find_map(|format| {
            NaiveDate::parse_from_str(candidate, format)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|naive| naive.and_utc())
        })
    })?;
    Some(timestamp.to_rfc3339_opts(SecondsFormat::Secs, true))
}

fn parse_timestamp(candidate: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(candidate) {
        return Some(ts.with_timezone(&Utc));
    }
    DATETIME_FORMATS.iter().find_map(|format| {
        NaiveDateTime::parse_from_str(candidate, format)
            .ok()
            .map(|naive| naive.and_utc())
    })
}

/// Parse a boolean word.
pub fn parse_bool(input: &str) -> Option<bool> {
    match input.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "y" | "1" | "on" => Some(true),
        "false" | "no" | "n" | "0" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a number, ignoring surrounding whitespace and thousands separators.
pub fn parse_number(input: &str) -> Option<f64> {
    let cleaned: String = input.trim().chars().filter(|c| *c != ',' && *c != '_').collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Convert a finite float to a JSON number, using an integer when the value
/// is whole.
pub fn number_value(n: f64) -> Option<serde_json::Value> {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        return Some(serde_json::Value::from(n as i64));
    }
    serde_json::Number::from_f64(n).map(serde_json::Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_email() {
        assert_eq!(parse_email(" Ann@Example.COM "), Some("ann@example.com".to_string()));
        assert_eq!(parse_email("no-at-sign"), None);
        assert_eq!(parse_email("a@b"), None);
        assert_eq!(parse_email("a b@example.com"), None);
    }

    #[test]
    fn test_parse_url() {
        assert!(parse_url("https://example.com/path?q=1").is_some());
        assert!(parse_url("http://localhost:8080").is_some());
        assert_eq!(parse_url("example.com"), None);
        assert_eq!(parse_url("ftp://example.com"), None);
    }

    #[test]
    fn test_parse_phone() {
        assert!(parse_phone("+1 (555) 123-4567").is_some());
        assert_eq!(parse_phone("12345"), None);
        assert_eq!(parse_phone("call me"), None);
    }

    #[test]
    fn test_parse_dates() {
        assert_eq!(parse_date("2024-03-05"), Some("2024-03-05".to_string()));
        assert_eq!(parse_date("03/05/2024"), Some("2024-03-05".to_string()));
        assert_eq!(parse_date("2024-03-05T10:00:00Z"), Some("2024-03-05".to_string()));
        assert_eq!(parse_date("tomorrow"), None);
        assert_eq!(parse_datetime("2024-03-05"), Some("2024-03-05T00:00:00Z".to_string()));
        assert_eq!(
            parse_datetime("2024-03-05T10:30:00+02:00"),
            Some("2024-03-05T08:30:00Z".to_string())
        );
    }

    #[test]
    fn test_parse_number_and_bool() {
        assert_eq!(parse_number(" 1,234.5 "), Some(1234.5));
        assert_eq!(parse_number("abc"), None);
        assert_eq!(parse_number("NaN"), None);
        assert_eq!(number_value(42.0), Some(json!(42)));
        assert_eq!(number_value(2.5), Some(json!(2.5)));
        assert_eq!(parse_bool("Yes"), Some(true));
        assert_eq!(parse_bool("maybe"), None);
    }
}
