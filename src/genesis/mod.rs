//! Genesis - the canonical initial content of the store.
//!
//! Genesis populates an empty store with the reserved meta-classes
//! (`@class`, `@prop`, `@storage`) and their own property definitions,
//! which is what makes the store self-describing: the schema of schemas is
//! ordinary data.
//!
//! The loader is idempotent and drift-aware. For each seeded definition:
//!
//! - absent in the store → created
//! - present with `_version` older or equal to the seed → updated
//! - present with a newer `_version` → skipped, with a drift note
//!
//! Seed records carry no timestamps, so re-running genesis on a pristine
//! store reproduces it byte for byte. Genesis is the only path permitted
//! to write `_version` directly; it also bypasses ownership and custom-id
//! rules (it is authoritative boot data, not client input).
//!
//! An optional seed directory extends the built-in seed with operator
//! classes and fixture objects; files share one JSON shape:
//! `{"classes": […], "props": […], "objects": {"<class_id>": […]}}`.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use crate::error::{Result, StoreError};
use crate::meta::{CLASS_META, PROP_META, STORAGE_META};
use crate::object::{ObjectMap, FIELD_ID, FIELD_VERSION};
use crate::storage::StorageProvider;

/// Version stamped on the built-in seed definitions.
pub const GENESIS_VERSION: i64 = 1;

/// Outcome of one genesis run.
#[derive(Clone, Debug, Default, Serialize)]
pub struct GenesisReport {
    /// Ids created from scratch (`<container>/<id>`).
    pub created: Vec<String>,

    /// Ids updated to the seed definition.
    pub updated: Vec<String>,

    /// Ids left untouched (already at seed state, or drifted ahead).
    pub skipped: Vec<String>,

    /// Drift notes: store content newer than the seed. Warnings, not
    /// failures.
    pub drift: Vec<String>,

    /// Fixture objects inserted from the seed directory.
    pub objects_loaded: usize,
}

impl GenesisReport {
    /// True when the run saw no drift.
    pub fn is_clean(&self) -> bool {
        self.drift.is_empty()
    }
}

/// The genesis loader.
pub struct Genesis {
    provider: Arc<dyn StorageProvider>,
}

impl Genesis {
    /// Creates a loader over the given provider.
    pub fn new(provider: Arc<dyn StorageProvider>) -> Self {
        Self { provider }
    }

    /// Runs genesis: built-in seed first, then the optional seed directory.
    #[instrument(skip(self, seed_dir))]
    pub fn run(&self, seed_dir: Option<&Path>) -> Result<GenesisReport> {
        let mut report = GenesisReport::default();

        for meta in [CLASS_META, PROP_META, STORAGE_META] {
            self.provider.init(meta)?;
        }

        self.apply_bundle(&builtin_data(), &mut report)?;

        if let Some(dir) = seed_dir {
            self.load_seed_dir(dir, &mut report)?;
        }

        info!(
            created = report.created.len(),
            updated = report.updated.len(),
            skipped = report.skipped.len(),
            drift = report.drift.len(),
            "Genesis complete"
        );
        Ok(report)
    }

    /// Applies one `{classes, props, objects}` bundle.
    fn apply_bundle(&self, bundle: &Value, report: &mut GenesisReport) -> Result<()> {
        for entry in bundle.get("classes").and_then(Value::as_array).into_iter().flatten() {
            self.seed_definition(CLASS_META, entry, report)?;
        }
        for entry in bundle.get("props").and_then(Value::as_array).into_iter().flatten() {
            self.seed_definition(PROP_META, entry, report)?;
        }
        if let Some(by_class) = bundle.get("objects").and_then(Value::as_object) {
            for (class_id, objects) in by_class {
                for entry in objects.as_array().into_iter().flatten() {
                    self.seed_object(class_id, entry, report)?;
                }
            }
        }
        Ok(())
    }

    /// Seeds one definition under a meta container, honoring `_version`.
    fn seed_definition(
        &self,
        container: &str,
        entry: &Value,
        report: &mut GenesisReport,
    ) -> Result<()> {
        let Some(record) = entry.as_object() else {
            warn!(container, "Skipping non-object seed entry");
            return Ok(());
        };
        let Some(id) = record.get(FIELD_ID).and_then(Value::as_str).map(String::from) else {
            warn!(container, "Skipping seed entry without id");
            return Ok(());
        };
        let label = format!("{}/{}", container, id);
        let seed_version = record
            .get(FIELD_VERSION)
            .and_then(Value::as_i64)
            .unwrap_or(GENESIS_VERSION);

        match self.provider.get(container, &id)? {
            None => {
                self.provider.put(container, &id, record)?;
                report.created.push(label);
            }
            Some(existing) => {
                let existing_version = existing
                    .get(FIELD_VERSION)
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                if existing_version > seed_version {
                    report.drift.push(format!(
                        "{}: store _version {} is newer than seed _version {}",
                        label, existing_version, seed_version
                    ));
                    report.skipped.push(label);
                } else if &existing == record {
                    report.skipped.push(label);
                } else {
                    self.provider.put(container, &id, record)?;
                    report.updated.push(label);
                }
            }
        }
        Ok(())
    }

    /// Inserts one fixture object with a direct put.
    fn seed_object(&self, class_id: &str, entry: &Value, report: &mut GenesisReport) -> Result<()> {
        let Some(record) = entry.as_object() else {
            warn!(class = class_id, "Skipping non-object fixture entry");
            return Ok(());
        };
        let Some(id) = record.get(FIELD_ID).and_then(Value::as_str) else {
            warn!(class = class_id, "Skipping fixture object without id");
            return Ok(());
        };
        self.provider.init(class_id)?;
        self.provider.put(class_id, id, record)?;
        report.objects_loaded += 1;
        Ok(())
    }

    /// Loads every `*.json` bundle in the seed directory, sorted by name
    /// for a deterministic order.
    fn load_seed_dir(&self, dir: &Path, report: &mut GenesisReport) -> Result<()> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)
            .map_err(|e| StoreError::io(format!("read seed dir {}: {}", dir.display(), e)))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        for path in paths {
            let bytes = std::fs::read(&path)
                .map_err(|e| StoreError::io(format!("read seed {}: {}", path.display(), e)))?;
            let bundle: Value = serde_json::from_slice(&bytes).map_err(|e| {
                StoreError::io(format!("malformed seed file {}: {}", path.display(), e))
            })?;
            self.apply_bundle(&bundle, report)?;
        }
        Ok(())
    }
}

/// The canonical built-in seed: the three meta-classes and the prop
/// definitions describing them.
///
/// Deterministic by construction - no timestamps, fixed `_version` - so
/// reset can restore the meta containers to exactly this content.
pub fn builtin_data() -> Value {
    json!({
        "classes": [
            {
                "id": CLASS_META,
                "class_id": CLASS_META,
                "name": "Class",
                "description": "A class definition. Instances of this class are schemas.",
                "is_system": true,
                "owner_id": null,
                "_version": GENESIS_VERSION
            },
            {
                "id": PROP_META,
                "class_id": CLASS_META,
                "name": "Property",
                "description": "A property definition, identified as <class_id>.<key>.",
                "is_system": true,
                "owner_id": null,
                "_version": GENESIS_VERSION
            },
            {
                "id": STORAGE_META,
                "class_id": CLASS_META,
                "name": "Storage",
                "description": "A storage binding routing classes to a backend.",
                "is_system": true,
                "owner_id": null,
                "_version": GENESIS_VERSION
            }
        ],
        "props": [
            // ---- @class ------------------------------------------------
            prop_seed(CLASS_META, "name", "string", 1, json!({})),
            prop_seed(CLASS_META, "description", "string", 2, json!({})),
            prop_seed(CLASS_META, "extends_id", "relation", 3,
                      json!({"object_class_id": [CLASS_META]})),
            prop_seed(CLASS_META, "storage_id", "relation", 4,
                      json!({"object_class_id": [STORAGE_META]})),
            prop_seed(CLASS_META, "is_system", "boolean", 5, json!({})),
            prop_seed(CLASS_META, "unique", "object", 6,
                      json!({"is_array": true,
                             "description": "Composite uniqueness constraints (lists of field keys)."})),
            // ---- @prop -------------------------------------------------
            prop_seed(PROP_META, "key", "string", 1,
                      json!({"required": true,
                             "options": {"min_length": 1, "pattern": "^[^.]+$"}})),
            prop_seed(PROP_META, "label", "string", 2, json!({})),
            prop_seed(PROP_META, "description", "string", 3, json!({})),
            prop_seed(PROP_META, "data_type", "string", 4,
                      json!({"required": true,
                             "options": {"values": ["string", "boolean", "integer", "float",
                                                    "object", "relation", "function"]}})),
            prop_seed(PROP_META, "is_array", "boolean", 5, json!({})),
            prop_seed(PROP_META, "object_class_id", "string", 6, json!({"is_array": true})),
            prop_seed(PROP_META, "object_class_strict", "boolean", 7, json!({})),
            prop_seed(PROP_META, "on_orphan", "string", 8,
                      json!({"options": {"values": ["keep", "delete", "nullify"]}})),
            prop_seed(PROP_META, "required", "boolean", 9, json!({})),
            prop_seed(PROP_META, "readonly", "boolean", 10, json!({})),
            prop_seed(PROP_META, "create_only", "boolean", 11, json!({})),
            prop_seed(PROP_META, "default_value", "object", 12,
                      json!({"description": "Inserted on create when the field is absent."})),
            prop_seed(PROP_META, "display_order", "integer", 13, json!({})),
            prop_seed(PROP_META, "group_name", "string", 14, json!({})),
            prop_seed(PROP_META, "hidden", "boolean", 15, json!({})),
            prop_seed(PROP_META, "options", "object", 16,
                      json!({"description": "Enum/range/length/pattern constraint container."})),
            prop_seed(PROP_META, "validators", "string", 17, json!({"is_array": true})),
            prop_seed(PROP_META, "editor", "string", 18,
                      json!({"description": "Advisory UI hint, opaque to the engine."})),
            // ---- @storage ----------------------------------------------
            prop_seed(STORAGE_META, "type", "string", 1,
                      json!({"required": true,
                             "options": {"values": ["local", "json", "couchdb", "mongo", "rest"]}})),
            prop_seed(STORAGE_META, "url", "string", 2, json!({})),
            prop_seed(STORAGE_META, "username", "string", 3, json!({})),
            prop_seed(STORAGE_META, "password", "string", 4, json!({"hidden": true}))
        ]
    })
}

/// Builds one seed prop record; `extras` overlays the common shape.
fn prop_seed(class_id: &str, key: &str, data_type: &str, order: i64, extras: Value) -> Value {
    let mut record = json!({
        "id": format!("{}.{}", class_id, key),
        "class_id": PROP_META,
        "key": key,
        "data_type": data_type,
        "display_order": order,
        "owner_id": null,
        "_version": GENESIS_VERSION
    });
    if let (Value::Object(target), Value::Object(overlay)) = (&mut record, extras) {
        for (k, v) in overlay {
            target.insert(k, v);
        }
    }
    record
}

/// Returns the seeded definition map for direct comparisons in tests and
/// the loader-control surface.
pub fn builtin_seed_ids() -> Vec<(String, String)> {
    let data = builtin_data();
    let mut ids = Vec::new();
    for (container, key) in [(CLASS_META, "classes"), (PROP_META, "props")] {
        for entry in data.get(key).and_then(Value::as_array).into_iter().flatten() {
            if let Some(id) = entry.get(FIELD_ID).and_then(Value::as_str) {
                ids.push((container.to_string(), id.to_string()));
            }
        }
    }
    ids
}

/// The seed entry for one id, as a map. `None` when the id is not part
/// of the built-in seed.
pub fn builtin_record(container: &str, id: &str) -> Option<ObjectMap> {
    let data = builtin_data();
    let key = if container == CLASS_META { "classes" } else { "props" };
    data.get(key)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .find(|entry| entry.get(FIELD_ID).and_then(Value::as_str) == Some(id))
        .and_then(|entry| entry.as_object().cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsJsonProvider;
    use tempfile::tempdir;

    fn provider(dir: &tempfile::TempDir) -> Arc<dyn StorageProvider> {
        Arc::new(FsJsonProvider::open(dir.path()).unwrap())
    }

    #[test]
    fn test_first_run_creates_everything() {
        let dir = tempdir().unwrap();
        let provider = provider(&dir);
        let report = Genesis::new(Arc::clone(&provider)).run(None).unwrap();

        assert!(report.is_clean());
        assert!(report.created.contains(&"@class/@class".to_string()));
        assert!(report.created.contains(&"@prop/@prop.key".to_string()));
        assert!(report.updated.is_empty());

        assert!(provider.get(CLASS_META, "@prop").unwrap().is_some());
        assert!(provider.get(PROP_META, "@storage.type").unwrap().is_some());
    }

    #[test]
    fn test_second_run_is_idempotent() {
        let dir = tempdir().unwrap();
        let provider = provider(&dir);
        let genesis = Genesis::new(Arc::clone(&provider));

        genesis.run(None).unwrap();
        let report = genesis.run(None).unwrap();

        assert!(report.created.is_empty());
        assert!(report.updated.is_empty());
        assert!(report.is_clean());
        assert!(!report.skipped.is_empty());
    }

    #[test]
    fn test_drift_detected_and_preserved() {
        let dir = tempdir().unwrap();
        let provider = provider(&dir);
        let genesis = Genesis::new(Arc::clone(&provider));
        genesis.run(None).unwrap();

        // Operator bumped the stored definition past the seed.
        let mut drifted = provider.get(CLASS_META, "@class").unwrap().unwrap();
        drifted.insert("_version".to_string(), json!(99));
        drifted.insert("description".to_string(), json!("patched"));
        provider.put(CLASS_META, "@class", &drifted).unwrap();

        let report = genesis.run(None).unwrap();
        assert_eq!(report.drift.len(), 1);
        assert!(report.drift[0].contains("@class/@class"));

        // The drifted record wins.
        let kept = provider.get(CLASS_META, "@class").unwrap().unwrap();
        assert_eq!(kept["description"], json!("patched"));
    }

    #[test]
    fn test_older_version_gets_updated() {
        let dir = tempdir().unwrap();
        let provider = provider(&dir);
        let genesis = Genesis::new(Arc::clone(&provider));
        genesis.run(None).unwrap();

        let mut stale = provider.get(PROP_META, "@prop.key").unwrap().unwrap();
        stale.insert("_version".to_string(), json!(0));
        stale.insert("label".to_string(), json!("old label"));
        provider.put(PROP_META, "@prop.key", &stale).unwrap();

        let report = genesis.run(None).unwrap();
        assert!(report.updated.contains(&"@prop/@prop.key".to_string()));

        let restored = provider.get(PROP_META, "@prop.key").unwrap().unwrap();
        assert!(restored.get("label").is_none());
    }

    #[test]
    fn test_seed_dir_classes_and_objects() {
        let dir = tempdir().unwrap();
        let seed_dir = tempdir().unwrap();
        std::fs::write(
            seed_dir.path().join("10-library.json"),
            serde_json::to_vec_pretty(&json!({
                "classes": [{"id": "book", "class_id": "@class", "_version": 1}],
                "props": [{"id": "book.title", "class_id": "@prop", "key": "title",
                           "data_type": "string", "_version": 1}],
                "objects": {
                    "book": [{"id": "b1", "class_id": "book", "title": "Dune", "_version": 1}]
                }
            }))
            .unwrap(),
        )
        .unwrap();

        let provider = provider(&dir);
        let report = Genesis::new(Arc::clone(&provider))
            .run(Some(seed_dir.path()))
            .unwrap();

        assert!(report.created.contains(&"@class/book".to_string()));
        assert_eq!(report.objects_loaded, 1);
        assert!(provider.get("book", "b1").unwrap().is_some());
    }

    #[test]
    fn test_builtin_data_is_deterministic() {
        assert_eq!(builtin_data(), builtin_data());
        assert!(builtin_seed_ids().len() > 25);
    }

    #[test]
    fn test_builtin_record_lookup() {
        let record = builtin_record(PROP_META, "@prop.data_type").unwrap();
        assert_eq!(record["key"], json!("data_type"));
        assert!(builtin_record(CLASS_META, "@ghost").is_none());
    }
}
