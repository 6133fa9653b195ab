//! Content-addressed snapshot bundles.
//!
//! An export captures every class definition plus all non-meta data:
//! `{exported_at, version, classes: […], data: {class_id: […]}}`. The
//! bundle id is a short SHA-256 over the bundle *minus* `exported_at`, so
//! identical content yields an identical id and repeated exports
//! deduplicate to one file. Bundles live as `export_<hash>.json` under
//! the export directory.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::{info, instrument};

use crate::engine::ElementStore;
use crate::error::{Result, StoreError};
use crate::meta::{is_meta_class, CLASS_META};
use crate::object::FIELD_ID;
use crate::types::Timestamp;

/// Bundle format version.
pub const BUNDLE_VERSION: u32 = 1;

/// Hex digits kept from the SHA-256 digest for the bundle id.
const HASH_LENGTH: usize = 12;

/// Metadata of one stored bundle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportMeta {
    /// Content hash - the bundle id and filename stem.
    pub id: String,

    /// When the bundle was written (RFC 3339).
    pub exported_at: String,

    /// Bundle file size.
    pub size_bytes: u64,
}

/// Builds the export bundle for the store's current content.
///
/// Classes and per-class object lists are sorted by id; the data map is
/// key-sorted. The bundle is therefore deterministic for identical store
/// content, which the content hash depends on.
pub(crate) fn build_bundle(store: &ElementStore) -> Result<Value> {
    let mut classes = store.provider().list(CLASS_META)?;
    classes.sort_by(|a, b| id_of(a).cmp(id_of(b)));

    let mut data = Map::new();
    let mut class_ids: Vec<String> = classes
        .iter()
        .map(|c| id_of(c).to_string())
        .filter(|id| !is_meta_class(id))
        .collect();
    class_ids.sort();

    for class_id in class_ids {
        let mut rows = store.provider().list(&class_id)?;
        rows.sort_by(|a, b| id_of(a).cmp(id_of(b)));
        data.insert(
            class_id,
            Value::Array(rows.into_iter().map(Value::Object).collect()),
        );
    }

    Ok(json!({
        "exported_at": Timestamp::now().to_rfc3339(),
        "version": BUNDLE_VERSION,
        "classes": classes.into_iter().map(Value::Object).collect::<Vec<_>>(),
        "data": data,
    }))
}

/// Stores, lists and retrieves bundles on the filesystem.
#[derive(Debug)]
pub struct ExportService {
    dir: PathBuf,
}

impl ExportService {
    /// Creates a service over the given export directory (created lazily).
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn bundle_path(&self, hash: &str) -> PathBuf {
        self.dir.join(format!("export_{}.json", hash))
    }

    /// Persists a bundle; identical content dedups onto the existing file.
    #[instrument(skip(self, bundle))]
    pub fn save(&self, bundle: &Value) -> Result<ExportMeta> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| StoreError::io(format!("create export dir: {}", e)))?;

        let hash = content_hash(bundle);
        let path = self.bundle_path(&hash);
        let exported_at = bundle
            .get("exported_at")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if path.exists() {
            // Same content, same id: keep the original stamp.
            info!(id = %hash, "Export deduplicated");
            let size_bytes = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            let original = self.load(&hash)?;
            return Ok(ExportMeta {
                id: hash,
                exported_at: original
                    .get("exported_at")
                    .and_then(Value::as_str)
                    .unwrap_or(&exported_at)
                    .to_string(),
                size_bytes,
            });
        }

        let bytes = serde_json::to_vec_pretty(bundle)?;
        let tmp = self.dir.join(format!("export_{}.json.tmp", hash));
        fs::write(&tmp, &bytes).map_err(|e| StoreError::io(format!("write export: {}", e)))?;
        fs::rename(&tmp, &path).map_err(|e| StoreError::io(format!("place export: {}", e)))?;

        info!(id = %hash, bytes = bytes.len(), "Export written");
        Ok(ExportMeta {
            id: hash,
            exported_at,
            size_bytes: bytes.len() as u64,
        })
    }

    /// Lists bundle metadata, newest first.
    pub fn list(&self) -> Result<Vec<ExportMeta>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(format!("read export dir: {}", e))),
        };

        let mut bundles = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(hash) = name
                .strip_prefix("export_")
                .and_then(|rest| rest.strip_suffix(".json"))
            else {
                continue;
            };
            let Ok(bundle) = self.load(hash) else {
                continue;
            };
            bundles.push(ExportMeta {
                id: hash.to_string(),
                exported_at: bundle
                    .get("exported_at")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                size_bytes: entry.metadata().map(|m| m.len()).unwrap_or(0),
            });
        }

        bundles.sort_by(|a, b| b.exported_at.cmp(&a.exported_at));
        Ok(bundles)
    }

    /// Loads one bundle by id.
    pub fn load(&self, hash: &str) -> Result<Value> {
        check_hash(hash)?;
        let path = self.bundle_path(hash);
        let bytes = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound {
                    entity: "export",
                    id: hash.to_string(),
                }
            } else {
                StoreError::io(format!("read export {}: {}", hash, e))
            }
        })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::io(format!("corrupt export {}: {}", hash, e)))
    }

    /// Removes one bundle. Returns `true` if it existed.
    pub fn delete(&self, hash: &str) -> Result<bool> {
        check_hash(hash)?;
        match fs::remove_file(self.bundle_path(hash)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(format!("delete export {}: {}", hash, e))),
        }
    }
}

/// Short content hash over the bundle minus its `exported_at` stamp.
fn content_hash(bundle: &Value) -> String {
    let mut hasher = Sha256::new();
    hash_value(&mut hasher, bundle, true);
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(HASH_LENGTH);
    for byte in digest.iter() {
        if hex.len() >= HASH_LENGTH {
            break;
        }
        hex.push_str(&format!("{:02x}", byte));
    }
    hex.truncate(HASH_LENGTH);
    hex
}

/// Feeds a canonical rendering of a value into the hasher: object keys
/// sorted, `exported_at` skipped at the top level. Key-order independence
/// matters because `serde_json` map ordering is a build-time feature.
fn hash_value(hasher: &mut Sha256, value: &Value, top_level: bool) {
    match value {
        Value::Object(map) => {
            hasher.update(b"{");
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                if top_level && key == "exported_at" {
                    continue;
                }
                hasher.update(key.as_bytes());
                hasher.update(b":");
                hash_value(hasher, &map[key], false);
                hasher.update(b",");
            }
            hasher.update(b"}");
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                hash_value(hasher, item, false);
                hasher.update(b",");
            }
            hasher.update(b"]");
        }
        other => hasher.update(other.to_string().as_bytes()),
    }
}

/// Guards bundle ids used in filenames.
fn check_hash(hash: &str) -> Result<()> {
    if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(StoreError::NotFound {
            entity: "export",
            id: hash.to_string(),
        });
    }
    Ok(())
}

fn id_of(map: &Map<String, Value>) -> &str {
    map.get(FIELD_ID).and_then(Value::as_str).unwrap_or("")
}
