//! Filesystem JSON storage provider.
//!
//! One file per class under the data root: `<root>/<class_id>.json`
//! holding `{"<id>": {…object…}, …}`. Class ids starting with `@` are
//! ordinary filenames.
//!
//! # Locking
//!
//! Every class has a sidecar lock file (`<class_id>.json.lock`) that is
//! never renamed. Mutations take an exclusive `fs2` lock on it, reads a
//! shared lock, which gives per-class writer serialization and torn-read
//! protection across processes.
//!
//! # Atomic replace
//!
//! Writes land in a temp file that is fsynced and renamed over the class
//! file, so readers observe either the old or the new snapshot, never a
//! partial write.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, instrument};

use crate::error::{Result, StoreError};
use crate::object::ObjectMap;

use super::StorageProvider;

/// The per-class file content: id -> object, sorted for stable diffs.
type ClassFile = BTreeMap<String, ObjectMap>;

/// Filesystem JSON provider.
#[derive(Debug)]
pub struct FsJsonProvider {
    root: PathBuf,
}

impl FsJsonProvider {
    /// Opens a provider rooted at the given directory, creating it if
    /// needed.
    #[instrument(fields(root = %root.as_ref().display()))]
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .map_err(|e| StoreError::io(format!("create data root {}: {}", root.display(), e)))?;
        debug!("Filesystem provider opened");
        Ok(Self { root })
    }

    /// Rejects class ids that would escape the data root.
    fn check_class_id(class_id: &str) -> Result<()> {
        if class_id.is_empty()
            || class_id.contains('/')
            || class_id.contains('\\')
            || class_id.contains("..")
        {
            return Err(StoreError::io(format!(
                "class id '{}' is not a valid container name",
                class_id
            )));
        }
        Ok(())
    }

    fn class_path(&self, class_id: &str) -> PathBuf {
        self.root.join(format!("{}.json", class_id))
    }

    fn lock_path(&self, class_id: &str) -> PathBuf {
        self.root.join(format!("{}.json.lock", class_id))
    }

    /// Opens (creating if needed) the sidecar lock file.
    fn lock_file(&self, class_id: &str) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path(class_id))
            .map_err(|e| StoreError::io(format!("open lock for '{}': {}", class_id, e)))
    }

    /// Reads the class file under a lock already held by the caller.
    fn read_class(&self, class_id: &str) -> Result<ClassFile> {
        let path = self.class_path(class_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ClassFile::new()),
            Err(e) => {
                return Err(StoreError::io(format!(
                    "read class '{}': {}",
                    class_id, e
                )))
            }
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::io(format!("corrupt class file '{}': {}", class_id, e)))
    }

    /// Writes the class file atomically (temp + fsync + rename), under a
    /// lock already held by the caller.
    fn write_class(&self, class_id: &str, content: &ClassFile) -> Result<()> {
        let path = self.class_path(class_id);
        let tmp = self.root.join(format!("{}.json.tmp", class_id));

        let bytes = serde_json::to_vec_pretty(content)?;
        let mut file = File::create(&tmp)
            .map_err(|e| StoreError::io(format!("create temp for '{}': {}", class_id, e)))?;
        file.write_all(&bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| StoreError::io(format!("write class '{}': {}", class_id, e)))?;
        drop(file);

        fs::rename(&tmp, &path)
            .map_err(|e| StoreError::io(format!("replace class '{}': {}", class_id, e)))
    }

    fn with_shared<T>(&self, class_id: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self.lock_file(class_id)?;
        lock.lock_shared()
            .map_err(|e| StoreError::io(format!("shared lock '{}': {}", class_id, e)))?;
        let result = f();
        let _ = fs2::FileExt::unlock(&lock);
        result
    }

    fn with_exclusive<T>(&self, class_id: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self.lock_file(class_id)?;
        lock.lock_exclusive()
            .map_err(|e| StoreError::io(format!("exclusive lock '{}': {}", class_id, e)))?;
        let result = f();
        let _ = fs2::FileExt::unlock(&lock);
        result
    }
}

impl StorageProvider for FsJsonProvider {
    fn get(&self, class_id: &str, id: &str) -> Result<Option<ObjectMap>> {
        Self::check_class_id(class_id)?;
        self.with_shared(class_id, || Ok(self.read_class(class_id)?.remove(id)))
    }

    fn list(&self, class_id: &str) -> Result<Vec<ObjectMap>> {
        Self::check_class_id(class_id)?;
        self.with_shared(class_id, || {
            Ok(self.read_class(class_id)?.into_values().collect())
        })
    }

    fn put(&self, class_id: &str, id: &str, object: &ObjectMap) -> Result<()> {
        Self::check_class_id(class_id)?;
        self.with_exclusive(class_id, || {
            let mut content = self.read_class(class_id)?;
            content.insert(id.to_string(), object.clone());
            self.write_class(class_id, &content)
        })
    }

    fn delete(&self, class_id: &str, id: &str) -> Result<bool> {
        Self::check_class_id(class_id)?;
        self.with_exclusive(class_id, || {
            let mut content = self.read_class(class_id)?;
            if content.remove(id).is_none() {
                return Ok(false);
            }
            self.write_class(class_id, &content)?;
            Ok(true)
        })
    }

    fn exists(&self, class_id: &str) -> Result<bool> {
        Self::check_class_id(class_id)?;
        Ok(self.class_path(class_id).exists())
    }

    fn drop_class(&self, class_id: &str) -> Result<bool> {
        Self::check_class_id(class_id)?;
        self.with_exclusive(class_id, || {
            let path = self.class_path(class_id);
            match fs::remove_file(&path) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(StoreError::io(format!(
                    "drop class '{}': {}",
                    class_id, e
                ))),
            }
        })
    }

    fn init(&self, class_id: &str) -> Result<()> {
        Self::check_class_id(class_id)?;
        self.with_exclusive(class_id, || {
            if !self.class_path(class_id).exists() {
                self.write_class(class_id, &ClassFile::new())?;
            }
            Ok(())
        })
    }

    fn data_path(&self) -> Option<&Path> {
        Some(&self.root)
    }
}
