//! Property definitions - the `@prop` meta-class façade.
//!
//! A prop record describes one field of a class: its data type, cardinality,
//! constraints and relation targets. Prop identity follows the
//! `<owning_class_id>.<key>` convention, which is how the registry finds a
//! class's own props without a secondary index.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::object::ObjectMap;

/// The data types a prop can declare.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// UTF-8 text.
    String,
    /// true / false.
    Boolean,
    /// 64-bit signed integer.
    Integer,
    /// 64-bit float.
    Float,
    /// Nested JSON map, optionally validated against a declared class.
    Object,
    /// Id reference(s) to objects in the declared target classes.
    Relation,
    /// Opaque code payload. Stored verbatim, never executed server-side.
    Function,
}

impl DataType {
    /// Returns the lowercase wire name of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Object => "object",
            Self::Relation => "relation",
            Self::Function => "function",
        }
    }
}

/// What happens to referrers when the target of a relation is deleted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnOrphan {
    /// Leave the dangling reference in place.
    #[default]
    Keep,
    /// Delete the referring object (recursive, bounded).
    Delete,
    /// Null out the referring field.
    Nullify,
}

/// Constraint container for scalar checks.
///
/// All fields are optional; absent means unconstrained. Numeric bounds
/// apply to integer/float props, length bounds and `pattern` to strings,
/// `values` is the enum whitelist for string and integer props.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PropOptions {
    /// Enum whitelist; a value must equal one of these.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<Value>>,

    /// Inclusive numeric lower bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,

    /// Inclusive numeric upper bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,

    /// Minimum string length in characters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,

    /// Maximum string length in characters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,

    /// Regex the full string value must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

/// A property definition - the typed façade over an `@prop` object.
///
/// Deserialized from the stored map on demand; the map stays the source of
/// truth. Unknown keys in the map are ignored here but preserved in
/// storage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PropDef {
    /// Prop identity, `<owning_class_id>.<key>` by convention.
    pub id: String,

    /// Field key within instances of the owning class.
    pub key: String,

    /// Display label for admin surfaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Declared value type.
    pub data_type: DataType,

    /// Whether the value is a list of `data_type` elements.
    #[serde(default)]
    pub is_array: bool,

    /// Target class ids for relation/object props.
    ///
    /// Accepts a scalar or an array on input; always an array in memory
    /// and on write.
    #[serde(default, deserialize_with = "scalar_or_vec")]
    pub object_class_id: Vec<String>,

    /// When true, relation targets must live exactly in a declared class;
    /// subclass instances do not match.
    #[serde(default)]
    pub object_class_strict: bool,

    /// Referrer policy when a relation target is deleted.
    #[serde(default)]
    pub on_orphan: OnOrphan,

    /// The field must be present and non-null.
    #[serde(default)]
    pub required: bool,

    /// The field can never be set by clients.
    #[serde(default)]
    pub readonly: bool,

    /// The field can be set on create but not changed afterwards.
    #[serde(default)]
    pub create_only: bool,

    /// Inserted on create when the field is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,

    /// Ordering hint for admin surfaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_order: Option<i64>,

    /// Grouping hint for admin surfaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,

    /// Hidden from admin surfaces (still validated and stored).
    #[serde(default)]
    pub hidden: bool,

    /// Scalar constraint container.
    #[serde(default)]
    pub options: PropOptions,

    /// Ordered list of composite validators (`email`, `url`, `phone`,
    /// `json`, `date_range`).
    #[serde(default)]
    pub validators: Vec<String>,

    /// Advisory UI hint, opaque to the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editor: Option<String>,
}

impl PropDef {
    /// Builds the conventional prop id for a class/key pair.
    pub fn make_id(class_id: &str, key: &str) -> String {
        format!("{}.{}", class_id, key)
    }

    /// Deserializes a prop definition from a stored map.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the map is missing `id`, `key` or
    /// `data_type`, or when the id violates the `<class>.<key>` convention.
    pub fn from_map(map: &ObjectMap) -> Result<Self> {
        let prop: PropDef = serde_json::from_value(Value::Object(map.clone())).map_err(|e| {
            StoreError::validation(crate::error::FieldError::new(
                map.get("id").and_then(Value::as_str).unwrap_or("?"),
                "invalid_prop",
                format!("malformed @prop record: {}", e),
            ))
        })?;
        prop.check_id_convention()?;
        Ok(prop)
    }

    /// Serializes the definition back to a map (normalized shape).
    pub fn to_map(&self) -> ObjectMap {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => ObjectMap::new(),
        }
    }

    /// The owning class id, derived from the id prefix.
    ///
    /// Keys themselves never contain dots, so everything before the last
    /// dot is the class id (class ids like `ns.thing` stay intact).
    pub fn owning_class(&self) -> &str {
        match self.id.rfind('.') {
            Some(idx) => &self.id[..idx],
            None => &self.id,
        }
    }

    /// Enforces the `<owning_class_id>.<key>` identity convention.
    pub fn check_id_convention(&self) -> Result<()> {
        let expected_suffix = format!(".{}", self.key);
        if self.key.is_empty()
            || self.key.contains('.')
            || !self.id.ends_with(&expected_suffix)
            || self.id.len() == expected_suffix.len()
        {
            return Err(StoreError::validation(crate::error::FieldError::new(
                "id",
                "prop_id_convention",
                format!(
                    "prop id '{}' must be '<class_id>.{}'",
                    self.id,
                    if self.key.is_empty() { "<key>" } else { &self.key }
                ),
            )));
        }
        Ok(())
    }
}

/// Accepts `"x"`, `["x", "y"]` or `null` for `object_class_id`.
fn scalar_or_vec<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(de::Error::custom(format!(
                    "object_class_id entries must be strings, got {}",
                    other
                ))),
            })
            .collect(),
        other => Err(de::Error::custom(format!(
            "object_class_id must be a string or array, got {}",
            other
        ))),
    }
}
