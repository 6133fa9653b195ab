//! Core type definitions for ElementStore identifiers and timestamps.
//!
//! Object and class identifiers are plain strings at the storage boundary
//! (classes such as `@class` or `book` carry human-chosen ids). This module
//! defines the typed pieces around them: minted object ids, hub connection
//! ids, the acting principal, and RFC 3339 timestamps.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Mints a new object id.
///
/// Ids are UUID v7 strings: time-ordered, unique, and URL-safe, so they can
/// appear directly in REST paths and filenames.
///
/// # Example
/// ```
/// let id = elementstore::mint_object_id();
/// assert_eq!(id.len(), 36);
/// ```
#[inline]
pub fn mint_object_id() -> String {
    Uuid::now_v7().to_string()
}

/// Hub connection identifier (UUID v7 for time-ordering).
///
/// Assigned by the hub when a WebSocket connection is accepted and echoed
/// back to the client in the `hello` frame. Writers pass it along with
/// commits so the hub can suppress the echo to the originator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Creates a new ConnectionId.
    #[inline]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a nil (all zeros) ConnectionId.
    /// Useful for testing or sentinel values.
    #[inline]
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }
}

impl Default for ConnectionId {
    /// Returns a nil (all zeros) ConnectionId.
    ///
    /// For a new unique ID, use [`ConnectionId::new()`].
    fn default() -> Self {
        Self::nil()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque principal (acting user) identifier.
///
/// ElementStore doesn't handle authentication - the shell supplies the
/// principal from a request header. This allows integration with any auth
/// system (OAuth, API keys, etc.).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal(pub String);

impl Principal {
    /// Creates a new Principal from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the principal as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// UTC timestamp serialized as an RFC 3339 string.
///
/// `created_at` and `updated_at` are stored as strings so that
/// lexicographic comparison equals chronological comparison, which keeps
/// query sorting on date fields a plain string compare.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub DateTime<Utc>);

impl Timestamp {
    /// Creates a timestamp for the current moment.
    #[inline]
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Renders the timestamp as an RFC 3339 string with millisecond
    /// precision (e.g. `2024-05-01T12:30:00.123Z`).
    #[inline]
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Parses an RFC 3339 string back into a timestamp.
    ///
    /// Returns `None` on malformed input.
    pub fn parse(s: &str) -> Option<Self> {
        DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| Self(dt.with_timezone(&Utc)))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minted_ids_are_unique() {
        let a = mint_object_id();
        let b = mint_object_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_minted_ids_are_time_ordered() {
        let a = mint_object_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = mint_object_id();
        // UUID v7 leads with a big-endian millisecond timestamp, so the
        // string forms sort chronologically.
        assert!(a < b);
    }

    #[test]
    fn test_minted_ids_are_url_safe() {
        let id = mint_object_id();
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
    }

    #[test]
    fn test_connection_id_new_is_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_connection_id_nil() {
        let id = ConnectionId::nil();
        assert_eq!(id.0, Uuid::nil());
    }

    #[test]
    fn test_principal() {
        let p = Principal::new("user-123");
        assert_eq!(p.as_str(), "user-123");
        assert_eq!(format!("{}", p), "user-123");
    }

    #[test]
    fn test_timestamp_rfc3339_roundtrip() {
        let t = Timestamp::now();
        let s = t.to_rfc3339();
        let parsed = Timestamp::parse(&s).unwrap();
        assert_eq!(parsed.to_rfc3339(), s);
    }

    #[test]
    fn test_timestamp_lexicographic_order_matches_time() {
        let t1 = Timestamp::now();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let t2 = Timestamp::now();
        assert!(t1 < t2);
        assert!(t1.to_rfc3339() < t2.to_rfc3339());
    }

    #[test]
    fn test_timestamp_parse_rejects_garbage() {
        assert!(Timestamp::parse("not-a-date").is_none());
    }
}
