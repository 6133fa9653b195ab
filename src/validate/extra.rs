//! Composite validators attachable via a prop's `validators` list.
//!
//! Each validator inspects an already-coerced value and returns `None` on
//! success or a [`FieldError`] bound to the field. Null values pass - the
//! `required` check owns presence.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::error::FieldError;
use crate::types::Timestamp;

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("static regex"));

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https?://[^\s/$.?#][^\s]*$").expect("static regex"));

static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?[0-9][0-9 ().-]{5,18}[0-9]$").expect("static regex"));

/// Runs the named composite validator against a value.
///
/// Unknown names log a warning and pass - a schema typo must not block
/// data writes.
pub(crate) fn run(name: &str, field: &str, value: &Value) -> Option<FieldError> {
    if value.is_null() {
        return None;
    }
    match name {
        "email" => check_regex(&EMAIL_RE, "a valid email address", field, value),
        "url" => check_regex(&URL_RE, "a valid http(s) URL", field, value),
        "phone" => check_regex(&PHONE_RE, "a valid phone number", field, value),
        "json" => check_json(field, value),
        "date_range" => check_date_range(field, value),
        other => {
            warn!(validator = other, field, "Unknown composite validator, skipping");
            None
        }
    }
}

fn check_regex(re: &Regex, expected: &str, field: &str, value: &Value) -> Option<FieldError> {
    match value.as_str() {
        Some(s) if re.is_match(s) => None,
        _ => Some(FieldError::new(
            field,
            "format",
            format!("{} must be {}", field, expected),
        )),
    }
}

fn check_json(field: &str, value: &Value) -> Option<FieldError> {
    match value.as_str() {
        Some(s) if serde_json::from_str::<Value>(s).is_ok() => None,
        _ => Some(FieldError::new(
            field,
            "json",
            format!("{} must be a parseable JSON string", field),
        )),
    }
}

/// Expects `{"start": <rfc3339>, "end": <rfc3339>}` with start <= end.
fn check_date_range(field: &str, value: &Value) -> Option<FieldError> {
    let invalid = || {
        Some(FieldError::new(
            field,
            "date_range",
            format!(
                "{} must be an object with RFC 3339 'start' <= 'end'",
                field
            ),
        ))
    };

    let Some(map) = value.as_object() else {
        return invalid();
    };
    let (Some(start), Some(end)) = (
        map.get("start").and_then(Value::as_str),
        map.get("end").and_then(Value::as_str),
    ) else {
        return invalid();
    };
    match (Timestamp::parse(start), Timestamp::parse(end)) {
        (Some(start), Some(end)) if start <= end => None,
        _ => invalid(),
    }
}
