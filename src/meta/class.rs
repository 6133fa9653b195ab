//! Class definitions - the `@class` meta-class façade.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::object::ObjectMap;

/// A class definition - the typed façade over an `@class` object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassDef {
    /// Stable class identity (also the storage container name).
    pub id: String,

    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Parent class id; `None` for roots. Forms a forest, cycles refused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends_id: Option<String>,

    /// Optional `@storage` binding id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_id: Option<String>,

    /// Reserved/system class marker. System classes are skipped by
    /// cross-class lookup and kept by reset.
    #[serde(default)]
    pub is_system: bool,

    /// Composite uniqueness constraints over instance fields.
    #[serde(default)]
    pub unique: Vec<UniqueConstraint>,

    /// Monotonic version stamped by the engine (genesis drift detection).
    #[serde(default, rename = "_version")]
    pub version: i64,
}

impl ClassDef {
    /// Creates a minimal class definition.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            description: None,
            extends_id: None,
            storage_id: None,
            is_system: false,
            unique: Vec::new(),
            version: 0,
        }
    }

    /// Deserializes a class definition from a stored map.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the map has no usable `id` or a
    /// malformed attribute.
    pub fn from_map(map: &ObjectMap) -> Result<Self> {
        serde_json::from_value(Value::Object(map.clone())).map_err(|e| {
            StoreError::validation(crate::error::FieldError::new(
                map.get("id").and_then(Value::as_str).unwrap_or("?"),
                "invalid_class",
                format!("malformed @class record: {}", e),
            ))
        })
    }

    /// Serializes the definition back to a map (normalized shape).
    pub fn to_map(&self) -> ObjectMap {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => ObjectMap::new(),
        }
    }
}

/// A uniqueness constraint descriptor.
///
/// Written as a list of field keys; a bare string is accepted as shorthand
/// for a single-key constraint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UniqueConstraint {
    /// Single-key shorthand: `"email"`.
    Single(String),
    /// Composite constraint: `["last_name", "first_name"]`.
    Keys(Vec<String>),
}

impl UniqueConstraint {
    /// Returns the constraint's field keys in declared order.
    pub fn keys(&self) -> Vec<&str> {
        match self {
            Self::Single(key) => vec![key.as_str()],
            Self::Keys(keys) => keys.iter().map(String::as_str).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> ObjectMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_minimal_class() {
        let class = ClassDef::from_map(&map(json!({"id": "book"}))).unwrap();
        assert_eq!(class.id, "book");
        assert!(class.extends_id.is_none());
        assert!(!class.is_system);
        assert_eq!(class.version, 0);
    }

    #[test]
    fn test_full_class_roundtrip() {
        let class = ClassDef::from_map(&map(json!({
            "id": "dog",
            "name": "Dog",
            "extends_id": "animal",
            "is_system": false,
            "unique": [["name"], "chip_id"],
            "_version": 4
        })))
        .unwrap();
        assert_eq!(class.extends_id.as_deref(), Some("animal"));
        assert_eq!(class.version, 4);
        assert_eq!(class.unique.len(), 2);

        let out = class.to_map();
        assert_eq!(out["_version"], json!(4));
    }

    #[test]
    fn test_unique_constraint_shapes() {
        let single = UniqueConstraint::Single("email".into());
        assert_eq!(single.keys(), vec!["email"]);

        let composite = UniqueConstraint::Keys(vec!["a".into(), "b".into()]);
        assert_eq!(composite.keys(), vec!["a", "b"]);
    }

    #[test]
    fn test_missing_id_rejected() {
        let result = ClassDef::from_map(&map(json!({"name": "Book"})));
        assert!(result.unwrap_err().is_validation());
    }

    #[test]
    fn test_engine_fields_tolerated() {
        let class = ClassDef::from_map(&map(json!({
            "id": "book",
            "class_id": "@class",
            "owner_id": null,
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z"
        })));
        assert!(class.is_ok());
    }
}
