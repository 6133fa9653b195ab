//! # ElementStore
//!
//! A self-describing object store: classes, properties and storage
//! bindings are themselves stored as objects under a small set of
//! reserved meta-classes (`@class`, `@prop`, `@storage`). One engine
//! serves schema and data alike, and every committed write fans out to
//! subscribed clients through a WebSocket hub.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use elementstore::{Config, ElementStore};
//! use serde_json::json;
//!
//! // Open (or create) a store; genesis seeds the meta-classes.
//! let store = ElementStore::open(Config::default())?;
//! let ctx = store.request().with_principal("u1");
//!
//! // Define a class and a property - they are ordinary objects.
//! store.set_object(&ctx, "@class", obj(json!({"id": "book"})))?;
//! store.set_object(&ctx, "@prop", obj(json!({
//!     "id": "book.title", "key": "title",
//!     "data_type": "string", "required": true,
//! })))?;
//!
//! // Write data against the schema just defined.
//! let book = store.set_object(&ctx, "book", obj(json!({"title": "Dune"})))?;
//! ```
//!
//! ## Key Concepts
//!
//! ### Meta-classes
//!
//! Schema lives in the store itself: a class is a record under `@class`,
//! a property under `@prop` (named `<class>.<key>`), a storage binding
//! under `@storage`. Classes inherit single-parent via `extends_id`; a
//! child property overrides the parent's by key.
//!
//! ### The write pipeline
//!
//! Every write traverses one pipeline: identity resolution, schema
//! lookup, ownership check, shallow merge, defaults, coercion and
//! validation, relation-target existence, uniqueness, stamping, persist,
//! broadcast. Engine-managed fields (`id`, `class_id`, `owner_id`,
//! `created_at`, `updated_at`, `_version`) cannot be forged by clients.
//!
//! ### Change fan-out
//!
//! Committed writes post fire-and-forget events to the hub, which pushes
//! `changes` frames to subscribers by class or object id, suppressing the
//! echo to the originating connection.
//!
//! ## Thread Safety
//!
//! [`ElementStore`] is `Send + Sync`; share it across request handlers
//! with `Arc`. Writes serialize per class; schema reads are served from a
//! memoized, invalidation-aware resolver cache.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

// ============================================================================
// Module declarations
// ============================================================================

mod config;
mod engine;
mod error;
mod object;
mod types;

pub mod broadcast;
pub mod export;
pub mod genesis;
pub mod hub;
pub mod meta;
pub mod storage;
pub mod validate;

// ============================================================================
// Public API re-exports
// ============================================================================

// Main engine interface
pub use engine::{ElementStore, Query, RequestContext, SelfTestCase, SelfTestReport, SortDir};

// Configuration
pub use config::{Config, StorageKind, ENV_DATA_ROOT, ENV_HUB_URL, ENV_STORAGE, ENV_STORAGE_URL};

// Error handling
pub use error::{FieldError, Result, StoreError, ValidationFailure};

// Core types
pub use object::{ObjectMap, StoredObject, ENGINE_FIELDS, FIELD_ID, FIELD_VERSION};
pub use types::{mint_object_id, ConnectionId, Principal, Timestamp};

// Schema façades
pub use meta::{ClassDef, DataType, OnOrphan, PropDef, StorageDef, UniqueConstraint};

// Change plane
pub use broadcast::{ChangeEvent, ChangeKind};
pub use hub::{Hub, HubClient};

// ============================================================================
// Prelude module for convenient imports
// ============================================================================

/// Convenient imports for common ElementStore usage.
///
/// ```rust
/// use elementstore::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::engine::{ElementStore, Query, RequestContext, SortDir};
    pub use crate::error::{Result, StoreError};
    pub use crate::meta::{ClassDef, DataType, PropDef};
    pub use crate::object::{ObjectMap, StoredObject};
}
