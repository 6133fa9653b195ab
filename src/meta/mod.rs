//! Class & property registry.
//!
//! The registry is a memoizable resolver over the `@class` / `@prop`
//! objects held in storage. It owns:
//!
//! - the reserved meta-class identifiers
//! - the inheritance walk (`extends_id`, root→leaf) with cycle detection
//! - prop resolution: merged property sets where a child prop overrides a
//!   parent prop with the same key
//! - a thread-safe cache keyed by class id, invalidated whenever any
//!   `@class` or `@prop` commit touches a class or one of its descendants
//!
//! Resolution is a pure function of the current class graph: two callers
//! resolving the same class at the same instant observe the same result.

mod class;
mod prop;
mod storage_def;

pub use class::{ClassDef, UniqueConstraint};
pub use prop::{DataType, OnOrphan, PropDef, PropOptions};
pub use storage_def::StorageDef;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::storage::StorageProvider;

/// Reserved meta-class holding class definitions.
pub const CLASS_META: &str = "@class";

/// Reserved meta-class holding property definitions.
pub const PROP_META: &str = "@prop";

/// Reserved meta-class holding storage bindings.
pub const STORAGE_META: &str = "@storage";

/// All reserved meta-class identifiers.
pub const META_CLASSES: [&str; 3] = [CLASS_META, PROP_META, STORAGE_META];

/// Returns true for the reserved meta-classes.
#[inline]
pub fn is_meta_class(class_id: &str) -> bool {
    META_CLASSES.contains(&class_id)
}

/// A fully resolved class: its definition, ancestor chain and merged props.
#[derive(Clone, Debug)]
pub struct ResolvedClass {
    /// The class definition itself.
    pub class: ClassDef,

    /// Ancestor chain, root first, the class itself last.
    pub ancestors: Vec<String>,

    /// Merged property set in ancestor-then-self order; a child prop with
    /// the same key replaces the parent definition in place.
    pub props: Vec<PropDef>,
}

impl ResolvedClass {
    /// Finds a resolved prop by key.
    pub fn prop(&self, key: &str) -> Option<&PropDef> {
        self.props.iter().find(|p| p.key == key)
    }
}

/// The registry: storage-backed class/prop resolver with a memo cache.
pub struct Registry {
    provider: Arc<dyn StorageProvider>,
    cache: RwLock<HashMap<String, Arc<ResolvedClass>>>,
}

impl Registry {
    /// Creates a registry over the given provider.
    pub fn new(provider: Arc<dyn StorageProvider>) -> Self {
        Self {
            provider,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the class definition, or `None` if no such class exists.
    pub fn get_class(&self, id: &str) -> Result<Option<ClassDef>> {
        match self.provider.get(CLASS_META, id)? {
            Some(map) => Ok(Some(ClassDef::from_map(&map)?)),
            None => Ok(None),
        }
    }

    /// Lists every class definition, skipping malformed records.
    pub fn list_classes(&self) -> Result<Vec<ClassDef>> {
        let mut classes = Vec::new();
        for map in self.provider.list(CLASS_META)? {
            match ClassDef::from_map(&map) {
                Ok(class) => classes.push(class),
                Err(e) => warn!(error = %e, "Skipping malformed @class record"),
            }
        }
        classes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(classes)
    }

    /// Resolves a class: definition + ancestors + merged props.
    ///
    /// Results are cached per class id until an invalidation.
    ///
    /// # Errors
    ///
    /// - `not_found` if the class (or an ancestor) does not exist
    /// - `cycle_detected` if the `extends_id` walk revisits a class
    pub fn resolve(&self, id: &str) -> Result<Arc<ResolvedClass>> {
        if let Some(hit) = self
            .cache
            .read()
            .map_err(|_| StoreError::unavailable("registry cache lock poisoned"))?
            .get(id)
        {
            return Ok(Arc::clone(hit));
        }

        let resolved = Arc::new(self.resolve_uncached(id)?);

        self.cache
            .write()
            .map_err(|_| StoreError::unavailable("registry cache lock poisoned"))?
            .insert(id.to_string(), Arc::clone(&resolved));

        Ok(resolved)
    }

    /// Returns the merged property set of a class.
    pub fn props_of(&self, class_id: &str) -> Result<Vec<PropDef>> {
        Ok(self.resolve(class_id)?.props.clone())
    }

    /// Walks the inheritance chain for one key; the nearest definition wins.
    ///
    /// Returns `None` when no class in the chain defines the key.
    pub fn prop_of(&self, class_id: &str, key: &str) -> Result<Option<PropDef>> {
        Ok(self.resolve(class_id)?.prop(key).cloned())
    }

    /// Returns the ancestor chain of a class, root first, self last.
    pub fn ancestors(&self, class_id: &str) -> Result<Vec<String>> {
        Ok(self.resolve(class_id)?.ancestors.clone())
    }

    /// Returns ids of classes whose ancestor chain passes through `id`
    /// (strict descendants; `id` itself is not included).
    pub fn descendants_of(&self, id: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for class in self.list_classes()? {
            if class.id == id {
                continue;
            }
            // A broken chain elsewhere must not poison unrelated lookups.
            match self.resolve(&class.id) {
                Ok(resolved) => {
                    if resolved.ancestors.iter().any(|a| a == id) {
                        out.push(class.id);
                    }
                }
                Err(e) => debug!(class = %class.id, error = %e, "Skipping unresolvable class"),
            }
        }
        Ok(out)
    }

    /// Lists every prop record owned directly by a class (no inheritance).
    pub fn own_props(&self, class_id: &str) -> Result<Vec<PropDef>> {
        let prefix = format!("{}.", class_id);
        let mut props = Vec::new();
        for map in self.provider.list(PROP_META)? {
            let Some(prop_id) = map.get("id").and_then(serde_json::Value::as_str) else {
                continue;
            };
            if !prop_id.starts_with(&prefix) {
                continue;
            }
            match PropDef::from_map(&map) {
                // Guard against ids like `book.x.y` belonging to class `book.x`.
                Ok(prop) if prop.owning_class() == class_id => props.push(prop),
                Ok(_) => {}
                Err(e) => warn!(prop = prop_id, error = %e, "Skipping malformed @prop record"),
            }
        }
        props.sort_by(|a, b| {
            let ord_a = a.display_order.unwrap_or(i64::MAX);
            let ord_b = b.display_order.unwrap_or(i64::MAX);
            ord_a.cmp(&ord_b).then_with(|| a.key.cmp(&b.key))
        });
        Ok(props)
    }

    /// Drops cached resolutions affected by a commit to `class_id`.
    ///
    /// An entry is stale when the changed class appears anywhere in its
    /// ancestor chain, so descendants are invalidated together with the
    /// class itself.
    pub fn invalidate(&self, class_id: &str) {
        if let Ok(mut cache) = self.cache.write() {
            let before = cache.len();
            cache.retain(|_, resolved| !resolved.ancestors.iter().any(|a| a == class_id));
            debug!(
                class = class_id,
                dropped = before - cache.len(),
                "Registry cache invalidated"
            );
        }
    }

    /// Drops the whole cache (reset path).
    pub fn invalidate_all(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
    }

    fn resolve_uncached(&self, id: &str) -> Result<ResolvedClass> {
        // Walk extends_id leaf -> root, watching for revisits.
        let mut chain: Vec<ClassDef> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut cursor = Some(id.to_string());

        while let Some(current) = cursor {
            if !seen.insert(current.clone()) {
                return Err(StoreError::CycleDetected { class_id: current });
            }
            let class = self
                .get_class(&current)?
                .ok_or_else(|| StoreError::class_not_found(current.clone()))?;
            cursor = class.extends_id.clone();
            chain.push(class);
        }
        chain.reverse();

        let ancestors: Vec<String> = chain.iter().map(|c| c.id.clone()).collect();

        // Merge props root -> leaf; a child key replaces the parent
        // definition but keeps the parent's position.
        let mut props: Vec<PropDef> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for class in &chain {
            for prop in self.own_props(&class.id)? {
                match index.get(&prop.key) {
                    Some(&i) => props[i] = prop,
                    None => {
                        index.insert(prop.key.clone(), props.len());
                        props.push(prop);
                    }
                }
            }
        }

        let class = chain
            .pop()
            .ok_or_else(|| StoreError::class_not_found(id))?;
        Ok(ResolvedClass {
            class,
            ancestors,
            props,
        })
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cached = self.cache.read().map(|c| c.len()).unwrap_or(0);
        f.debug_struct("Registry")
            .field("cached_classes", &cached)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsJsonProvider;
    use serde_json::json;
    use tempfile::tempdir;

    fn put(provider: &dyn StorageProvider, class: &str, value: serde_json::Value) {
        let map = match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected object"),
        };
        let id = map["id"].as_str().unwrap().to_string();
        provider.put(class, &id, &map).unwrap();
    }

    fn registry_with_animals() -> (tempfile::TempDir, Registry) {
        let dir = tempdir().unwrap();
        let provider: Arc<dyn StorageProvider> =
            Arc::new(FsJsonProvider::open(dir.path()).unwrap());

        put(&*provider, CLASS_META, json!({"id": "animal"}));
        put(&*provider, CLASS_META, json!({"id": "dog", "extends_id": "animal"}));
        put(&*provider, CLASS_META, json!({"id": "puppy", "extends_id": "dog"}));
        put(
            &*provider,
            PROP_META,
            json!({"id": "animal.sound", "key": "sound", "data_type": "string",
                   "default_value": "noise", "display_order": 1}),
        );
        put(
            &*provider,
            PROP_META,
            json!({"id": "animal.legs", "key": "legs", "data_type": "integer",
                   "display_order": 2}),
        );
        put(
            &*provider,
            PROP_META,
            json!({"id": "dog.sound", "key": "sound", "data_type": "string",
                   "default_value": "bark"}),
        );

        (dir, Registry::new(provider))
    }

    #[test]
    fn test_ancestors_root_to_leaf() {
        let (_dir, registry) = registry_with_animals();
        assert_eq!(
            registry.ancestors("puppy").unwrap(),
            vec!["animal", "dog", "puppy"]
        );
    }

    #[test]
    fn test_child_overrides_parent_prop() {
        let (_dir, registry) = registry_with_animals();
        let props = registry.props_of("dog").unwrap();

        // Exactly one `sound` entry, with the child's default, at the
        // parent's position.
        let sounds: Vec<_> = props.iter().filter(|p| p.key == "sound").collect();
        assert_eq!(sounds.len(), 1);
        assert_eq!(sounds[0].default_value, Some(json!("bark")));
        assert_eq!(props[0].key, "sound");
        assert_eq!(props[1].key, "legs");
    }

    #[test]
    fn test_prop_of_walks_chain() {
        let (_dir, registry) = registry_with_animals();
        let legs = registry.prop_of("puppy", "legs").unwrap().unwrap();
        assert_eq!(legs.id, "animal.legs");
        assert!(registry.prop_of("puppy", "wings").unwrap().is_none());
    }

    #[test]
    fn test_cycle_detected() {
        let dir = tempdir().unwrap();
        let provider: Arc<dyn StorageProvider> =
            Arc::new(FsJsonProvider::open(dir.path()).unwrap());
        put(&*provider, CLASS_META, json!({"id": "a", "extends_id": "b"}));
        put(&*provider, CLASS_META, json!({"id": "b", "extends_id": "a"}));

        let registry = Registry::new(provider);
        let err = registry.resolve("a").unwrap_err();
        assert!(err.is_cycle());
    }

    #[test]
    fn test_self_cycle_detected() {
        let dir = tempdir().unwrap();
        let provider: Arc<dyn StorageProvider> =
            Arc::new(FsJsonProvider::open(dir.path()).unwrap());
        put(&*provider, CLASS_META, json!({"id": "a", "extends_id": "a"}));

        let registry = Registry::new(provider);
        assert!(registry.resolve("a").unwrap_err().is_cycle());
    }

    #[test]
    fn test_missing_class_not_found() {
        let (_dir, registry) = registry_with_animals();
        assert!(registry.resolve("ghost").unwrap_err().is_not_found());
    }

    #[test]
    fn test_descendants_of() {
        let (_dir, registry) = registry_with_animals();
        let mut descendants = registry.descendants_of("animal").unwrap();
        descendants.sort();
        assert_eq!(descendants, vec!["dog", "puppy"]);
        assert!(registry.descendants_of("puppy").unwrap().is_empty());
    }

    #[test]
    fn test_invalidation_drops_descendants() {
        let (_dir, registry) = registry_with_animals();
        registry.resolve("animal").unwrap();
        registry.resolve("puppy").unwrap();

        registry.invalidate("dog");

        let cache = registry.cache.read().unwrap();
        assert!(cache.contains_key("animal"));
        assert!(!cache.contains_key("puppy"));
    }

    #[test]
    fn test_own_props_excludes_dotted_subclass_ids() {
        let dir = tempdir().unwrap();
        let provider: Arc<dyn StorageProvider> =
            Arc::new(FsJsonProvider::open(dir.path()).unwrap());
        put(&*provider, CLASS_META, json!({"id": "book"}));
        put(
            &*provider,
            PROP_META,
            json!({"id": "book.title", "key": "title", "data_type": "string"}),
        );
        // Belongs to a different (dotted) class, not to `book`.
        put(
            &*provider,
            PROP_META,
            json!({"id": "book.note.text", "key": "text", "data_type": "string"}),
        );

        let registry = Registry::new(provider);
        let props = registry.own_props("book").unwrap();
        assert_eq!(props.len(), 1);
        assert_eq!(props[0].key, "title");
    }

    #[test]
    fn test_is_meta_class() {
        assert!(is_meta_class("@class"));
        assert!(is_meta_class("@prop"));
        assert!(is_meta_class("@storage"));
        assert!(!is_meta_class("book"));
    }
}
