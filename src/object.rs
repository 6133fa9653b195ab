//! The stored object wrapper and engine-managed attributes.
//!
//! Every persisted record is a schemaless JSON map. [`StoredObject`] wraps
//! that map with typed accessors for the attributes the engine owns:
//! `id`, `class_id`, `owner_id`, `created_at`, `updated_at` and
//! `_version`. Clients cannot forge these - the write pipeline strips them
//! from input and re-stamps them on every commit.
//!
//! Typed façades over the same map (class, prop and storage definitions)
//! live in [`crate::meta`]; they deserialize from a `StoredObject` and
//! never replace it as the stored representation.

use serde_json::{Map, Value};

use crate::types::{Principal, Timestamp};

/// The raw persisted form of an object: a JSON map keyed by field name.
pub type ObjectMap = Map<String, Value>;

/// Engine-managed field: unique object id within its class.
pub const FIELD_ID: &str = "id";

/// Engine-managed field: the id of the `@class` this object belongs to.
pub const FIELD_CLASS_ID: &str = "class_id";

/// Engine-managed field: owning principal, or null.
pub const FIELD_OWNER_ID: &str = "owner_id";

/// Engine-managed field: ISO-8601 creation stamp, never changes.
pub const FIELD_CREATED_AT: &str = "created_at";

/// Engine-managed field: ISO-8601 stamp of the latest successful write.
pub const FIELD_UPDATED_AT: &str = "updated_at";

/// Engine-managed field: strictly monotonic per-object version counter.
pub const FIELD_VERSION: &str = "_version";

/// All engine-managed field names, in stamp order.
pub const ENGINE_FIELDS: [&str; 6] = [
    FIELD_ID,
    FIELD_CLASS_ID,
    FIELD_OWNER_ID,
    FIELD_CREATED_AT,
    FIELD_UPDATED_AT,
    FIELD_VERSION,
];

/// A stored object: a JSON map plus typed access to engine-managed fields.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StoredObject(ObjectMap);

impl StoredObject {
    /// Wraps an existing map.
    #[inline]
    pub fn from_map(map: ObjectMap) -> Self {
        Self(map)
    }

    /// Creates an empty object.
    #[inline]
    pub fn new() -> Self {
        Self(ObjectMap::new())
    }

    /// Returns the underlying map.
    #[inline]
    pub fn as_map(&self) -> &ObjectMap {
        &self.0
    }

    /// Returns the underlying map mutably.
    #[inline]
    pub fn as_map_mut(&mut self) -> &mut ObjectMap {
        &mut self.0
    }

    /// Consumes the wrapper, returning the map.
    #[inline]
    pub fn into_map(self) -> ObjectMap {
        self.0
    }

    /// Returns a field value.
    #[inline]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Sets a field value.
    #[inline]
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    /// Returns a string field, treating null/absent/non-string as `None`.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    // =========================================================================
    // Engine-managed accessors
    // =========================================================================

    /// The object id, if stamped.
    pub fn id(&self) -> Option<&str> {
        self.get_str(FIELD_ID)
    }

    /// The owning class id, if stamped.
    pub fn class_id(&self) -> Option<&str> {
        self.get_str(FIELD_CLASS_ID)
    }

    /// The owning principal, if any.
    pub fn owner_id(&self) -> Option<&str> {
        self.get_str(FIELD_OWNER_ID)
    }

    /// The monotonic version counter; 0 when never stamped.
    pub fn version(&self) -> i64 {
        self.0
            .get(FIELD_VERSION)
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }

    /// The creation stamp, if present.
    pub fn created_at(&self) -> Option<&str> {
        self.get_str(FIELD_CREATED_AT)
    }

    /// The latest write stamp, if present.
    pub fn updated_at(&self) -> Option<&str> {
        self.get_str(FIELD_UPDATED_AT)
    }

    /// Returns true if the object is owned by the given principal.
    pub fn is_owned_by(&self, principal: &Principal) -> bool {
        self.owner_id() == Some(principal.as_str())
    }

    // =========================================================================
    // Stamping (write pipeline only)
    // =========================================================================

    /// Stamps creation metadata: identity, class, owner, timestamps and
    /// version 1. Used on the create path after the merge.
    pub fn stamp_created(
        &mut self,
        id: &str,
        class_id: &str,
        owner: Option<&Principal>,
        now: Timestamp,
    ) {
        let stamp = now.to_rfc3339();
        self.set(FIELD_ID, Value::String(id.to_string()));
        self.set(FIELD_CLASS_ID, Value::String(class_id.to_string()));
        self.set(
            FIELD_OWNER_ID,
            match owner {
                Some(p) => Value::String(p.as_str().to_string()),
                None => Value::Null,
            },
        );
        self.set(FIELD_CREATED_AT, Value::String(stamp.clone()));
        self.set(FIELD_UPDATED_AT, Value::String(stamp));
        self.set(FIELD_VERSION, Value::from(1i64));
    }

    /// Stamps update metadata: bumps `_version` past the previous record's
    /// and refreshes `updated_at`. Identity fields are re-asserted from the
    /// previous record so merged input can never shift them.
    pub fn stamp_updated(&mut self, previous: &StoredObject, now: Timestamp) {
        for key in [FIELD_ID, FIELD_CLASS_ID, FIELD_OWNER_ID, FIELD_CREATED_AT] {
            if let Some(value) = previous.get(key) {
                self.set(key, value.clone());
            }
        }
        self.set(FIELD_UPDATED_AT, Value::String(now.to_rfc3339()));
        self.set(FIELD_VERSION, Value::from(previous.version() + 1));
    }

    // =========================================================================
    // Merge
    // =========================================================================

    /// Shallow-merges `input` into this object.
    ///
    /// Engine-managed fields in the input are ignored; every other key
    /// replaces the persisted value. Keys absent from the input are
    /// retained, which is what gives `setObject` its partial-update
    /// semantics.
    pub fn merge_input(&mut self, input: &ObjectMap) {
        for (key, value) in input {
            if ENGINE_FIELDS.contains(&key.as_str()) {
                continue;
            }
            self.0.insert(key.clone(), value.clone());
        }
    }
}

impl From<ObjectMap> for StoredObject {
    fn from(map: ObjectMap) -> Self {
        Self(map)
    }
}

impl From<StoredObject> for Value {
    fn from(obj: StoredObject) -> Self {
        Value::Object(obj.0)
    }
}
