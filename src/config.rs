//! Configuration types for ElementStore.
//!
//! The [`Config`] struct controls engine behavior including:
//! - Data root and storage backend selection
//! - Hub URL for change broadcasts
//! - Default capability flags and safety limits
//!
//! # Example
//! ```rust
//! use elementstore::{Config, StorageKind};
//!
//! // Use defaults (filesystem JSON under ./elementstore-data)
//! let config = Config::default();
//!
//! // Customize for production
//! let config = Config {
//!     data_root: "/var/lib/elementstore".into(),
//!     hub_url: Some("http://localhost:9310".to_string()),
//!     ..Default::default()
//! };
//! ```
//!
//! Per-request flags (principal, ownership enforcement, custom-id
//! allowance) are NOT part of `Config`; they travel in
//! [`RequestContext`](crate::RequestContext), derived from request
//! headers by the shell.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, StoreError};

/// Environment variable naming the data root directory.
pub const ENV_DATA_ROOT: &str = "ELEMENTSTORE_DATA_ROOT";

/// Environment variable naming the storage backend type.
pub const ENV_STORAGE: &str = "ELEMENTSTORE_STORAGE";

/// Environment variable naming the storage backend URL (document DB).
pub const ENV_STORAGE_URL: &str = "ELEMENTSTORE_STORAGE_URL";

/// Environment variable naming the broadcast hub URL.
pub const ENV_HUB_URL: &str = "ELEMENTSTORE_HUB_URL";

/// Engine configuration options.
///
/// All fields have sensible defaults. Use struct update syntax to override
/// specific settings:
///
/// ```rust
/// use elementstore::Config;
///
/// let config = Config {
///     cascade_depth_limit: 4,
///     ..Default::default()
/// };
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory holding per-class JSON files and export bundles.
    pub data_root: PathBuf,

    /// Which storage backend persists objects.
    pub storage: StorageKind,

    /// Base URL of the WebSocket hub's HTTP ingress.
    ///
    /// `None` disables broadcasting entirely (commits still succeed).
    pub hub_url: Option<String>,

    /// Default for per-request ownership enforcement.
    ///
    /// The shell can override per request via `X-Disable-Ownership`.
    pub enforce_ownership: bool,

    /// Default for per-request caller-supplied-id allowance.
    ///
    /// The shell can override per request via `X-Allow-Custom-Ids`.
    pub allow_custom_ids: bool,

    /// Wall-clock budget for a single engine request.
    ///
    /// Exceeding it returns `unavailable`; partial state never persists
    /// (atomicity is at the provider put boundary).
    /// Default: 30 seconds
    pub request_deadline: Duration,

    /// Maximum depth for `on_orphan = delete` cascades.
    ///
    /// Exceeding the bound records an `io_error` on the offending edge and
    /// aborts the remaining cascade. Default: 8
    pub cascade_depth_limit: usize,

    /// Optional directory of additional genesis class+seed files.
    pub genesis_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./elementstore-data"),
            storage: StorageKind::Json,
            hub_url: None,
            enforce_ownership: true,
            allow_custom_ids: false,
            request_deadline: Duration::from_secs(30),
            cascade_depth_limit: 8,
            genesis_dir: None,
        }
    }
}

impl Config {
    /// Creates a new Config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a Config from the process environment.
    ///
    /// Reads [`ENV_DATA_ROOT`], [`ENV_STORAGE`], [`ENV_STORAGE_URL`] and
    /// [`ENV_HUB_URL`]; unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unknown storage type or a
    /// document storage type without a URL.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(root) = std::env::var(ENV_DATA_ROOT) {
            config.data_root = PathBuf::from(root);
        }
        if let Ok(hub) = std::env::var(ENV_HUB_URL) {
            if !hub.is_empty() {
                config.hub_url = Some(hub);
            }
        }
        if let Ok(kind) = std::env::var(ENV_STORAGE) {
            let url = std::env::var(ENV_STORAGE_URL).ok();
            config.storage = StorageKind::parse(&kind, url.as_deref())?;
        }

        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// Called automatically by `ElementStore::open()`. You can also call
    /// this explicitly to check configuration before attempting to open.
    ///
    /// # Errors
    /// Returns a configuration error if:
    /// - `data_root` is empty
    /// - `request_deadline` is zero
    /// - `cascade_depth_limit` is zero
    /// - the hub URL is not http(s)
    pub fn validate(&self) -> Result<()> {
        if self.data_root.as_os_str().is_empty() {
            return Err(StoreError::config("data_root must not be empty"));
        }
        if self.request_deadline.is_zero() {
            return Err(StoreError::config("request_deadline must be positive"));
        }
        if self.cascade_depth_limit == 0 {
            return Err(StoreError::config("cascade_depth_limit must be positive"));
        }
        if let Some(ref url) = self.hub_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(StoreError::config(format!(
                    "hub_url must be http(s), got '{}'",
                    url
                )));
            }
        }
        if let StorageKind::CouchDb { ref url } = self.storage {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(StoreError::config(format!(
                    "couchdb url must be http(s), got '{}'",
                    url
                )));
            }
        }
        Ok(())
    }
}

/// Storage backend selection.
///
/// The `@storage` meta-class declares five binding types; `local`/`json`
/// map to the filesystem provider and `couchdb` to the document provider.
/// `mongo` and `rest` are part of the vocabulary but have no shipped
/// provider and are rejected here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageKind {
    /// One JSON file per class under the data root.
    Json,

    /// One CouchDB database per class at the given base URL.
    CouchDb {
        /// Base URL of the CouchDB server, e.g. `http://localhost:5984`.
        /// Credentials may be supplied as `user:pass@` userinfo.
        url: String,
    },
}

impl StorageKind {
    /// Parses a storage type name (from env or an `@storage` record).
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unknown or unsupported types, or
    /// when `couchdb` is requested without a URL.
    pub fn parse(kind: &str, url: Option<&str>) -> Result<Self> {
        match kind {
            "local" | "json" => Ok(Self::Json),
            "couchdb" => match url {
                Some(url) if !url.is_empty() => Ok(Self::CouchDb {
                    url: url.to_string(),
                }),
                _ => Err(StoreError::config("couchdb storage requires a URL")),
            },
            "mongo" | "rest" => Err(StoreError::config(format!(
                "storage type '{}' has no shipped provider",
                kind
            ))),
            other => Err(StoreError::config(format!(
                "unknown storage type '{}'",
                other
            ))),
        }
    }

    /// Returns the storage type name as used in `@storage` records.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::CouchDb { .. } => "couchdb",
        }
    }
}
