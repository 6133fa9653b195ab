//! Storage layer abstractions for ElementStore.
//!
//! This module provides a trait-based abstraction over object persistence,
//! allowing different backends to be used (filesystem JSON, document DB,
//! mock for testing).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ElementStore                             │
//! │                         │                                    │
//! │                         ▼                                    │
//! │              ┌─────────────────────┐                        │
//! │              │  StorageProvider    │  ← Trait               │
//! │              └─────────────────────┘                        │
//! │                    ▲         ▲                              │
//! │                    │         │                              │
//! │       ┌───────────┴──┐   ┌──┴──────────────┐               │
//! │       │FsJsonProvider│   │ CouchDbProvider │               │
//! │       └──────────────┘   └─────────────────┘               │
//! │        (one file/class)    (one db/class)                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Providers store opaque maps keyed by id - no schema coupling. The
//! contract every provider must honor:
//!
//! - a returned-success `put` is durable before the engine broadcasts
//! - concurrent `put` for one id linearizes (last writer wins by arrival)
//! - `list` is a consistent snapshot with respect to concurrent writes on
//!   OTHER ids; no torn object reads
//! - failures surface as the typed error kinds, never panics

mod couch;
mod fs_json;

pub use couch::CouchDbProvider;
pub use fs_json::FsJsonProvider;

use std::path::Path;
use std::sync::Arc;

use crate::config::{Config, StorageKind};
use crate::error::Result;
use crate::object::ObjectMap;

/// Storage provider contract.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the engine shares one provider
/// across all request handlers and serializes per-class writes above it.
pub trait StorageProvider: Send + Sync {
    /// Retrieves an object by id, or `None` when absent.
    fn get(&self, class_id: &str, id: &str) -> Result<Option<ObjectMap>>;

    /// Lists all objects of a class.
    ///
    /// Order is unspecified but stable within a single snapshot. An absent
    /// class lists as empty.
    fn list(&self, class_id: &str) -> Result<Vec<ObjectMap>>;

    /// Atomically creates or replaces the object stored under `id`.
    fn put(&self, class_id: &str, id: &str, object: &ObjectMap) -> Result<()>;

    /// Deletes an object. Returns `true` if it existed.
    fn delete(&self, class_id: &str, id: &str) -> Result<bool>;

    /// Returns true when the class container exists.
    fn exists(&self, class_id: &str) -> Result<bool>;

    /// Removes the whole class container. Returns `true` if it existed.
    fn drop_class(&self, class_id: &str) -> Result<bool>;

    /// Creates the class container lazily (no-op when present).
    fn init(&self, class_id: &str) -> Result<()>;

    /// The filesystem path backing this provider, if any.
    fn data_path(&self) -> Option<&Path> {
        None
    }
}

/// Opens the storage provider selected by the configuration.
///
/// # Errors
///
/// Returns an error if the data root cannot be created or the backend URL
/// is malformed.
pub fn open_provider(config: &Config) -> Result<Arc<dyn StorageProvider>> {
    match &config.storage {
        StorageKind::Json => Ok(Arc::new(FsJsonProvider::open(&config.data_root)?)),
        StorageKind::CouchDb { url } => Ok(Arc::new(CouchDbProvider::open(url)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_provider_json() {
        let dir = tempdir().unwrap();
        let config = Config {
            data_root: dir.path().to_path_buf(),
            ..Default::default()
        };
        let provider = open_provider(&config).unwrap();
        assert!(provider.data_path().is_some());
    }

    #[test]
    fn test_provider_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<FsJsonProvider>();
        assert_send_sync::<CouchDbProvider>();
    }
}
