//! Storage bindings - the `@storage` meta-class façade.
//!
//! A storage record names a backend type and its connection details. The
//! engine itself is opened with one concrete provider; `@storage` records
//! let classes declare where their data is meant to live so operators can
//! route classes to backends.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::object::ObjectMap;

/// A storage binding - the typed façade over an `@storage` object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StorageDef {
    /// Binding identity.
    pub id: String,

    /// Backend type: `local`, `json`, `couchdb`, `mongo` or `rest`.
    #[serde(rename = "type")]
    pub storage_type: String,

    /// Backend base URL where applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Backend account name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Backend account secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl StorageDef {
    /// Deserializes a storage binding from a stored map.
    pub fn from_map(map: &ObjectMap) -> Result<Self> {
        serde_json::from_value(Value::Object(map.clone())).map_err(|e| {
            StoreError::validation(crate::error::FieldError::new(
                map.get("id").and_then(Value::as_str).unwrap_or("?"),
                "invalid_storage",
                format!("malformed @storage record: {}", e),
            ))
        })
    }

    /// Serializes the binding back to a map.
    pub fn to_map(&self) -> ObjectMap {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => ObjectMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_storage_def_roundtrip() {
        let map = match json!({
            "id": "main",
            "type": "couchdb",
            "url": "http://localhost:5984",
            "username": "admin"
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let def = StorageDef::from_map(&map).unwrap();
        assert_eq!(def.storage_type, "couchdb");
        assert_eq!(def.url.as_deref(), Some("http://localhost:5984"));
        assert!(def.password.is_none());

        let out = def.to_map();
        assert_eq!(out["type"], json!("couchdb"));
    }

    #[test]
    fn test_missing_type_rejected() {
        let map = match json!({"id": "main"}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        assert!(StorageDef::from_map(&map).is_err());
    }
}
