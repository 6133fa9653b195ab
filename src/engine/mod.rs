//! The engine façade - every read and write goes through [`ElementStore`].
//!
//! The engine orchestrates the registry, the validator, the storage
//! provider and the broadcast emitter into the single write pipeline every
//! mutation traverses:
//!
//! 1. identity resolution (mint or verify the id)
//! 2. schema lookup (resolved props, meta-classes included)
//! 3. ownership check (update path)
//! 4. shallow merge with engine-field protection
//! 5. defaults (create path)
//! 6. coercion & validation (errors collected per field)
//! 7. relation-target existence
//! 8. uniqueness constraints
//! 9. stamping (`updated_at`, `_version`)
//! 10. persist
//! 11. broadcast (fire-and-forget)
//!
//! # Thread Safety
//!
//! `ElementStore` is `Send + Sync`; share it with `Arc`. Writes serialize
//! per class behind an engine-level lock layered over the provider's own
//! per-class locking; the schema-read hot path takes no engine lock at
//! all thanks to the registry cache.
//!
//! # Per-request state
//!
//! Runtime flags (principal, ownership enforcement, custom-id allowance,
//! echo-suppression origin) are carried by [`RequestContext`] values the
//! shell derives from request headers. The engine object itself is
//! immutable after construction except for cache invalidation.

mod query;
mod selftest;

pub use query::{Query, SortDir};
pub use selftest::{SelfTestCase, SelfTestReport};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::broadcast::{ChangeEmitter, ChangeEvent};
use crate::config::Config;
use crate::error::{FieldError, Result, StoreError, ValidationFailure};
use crate::export::{self, ExportMeta, ExportService};
use crate::genesis::{Genesis, GenesisReport};
use crate::meta::{
    is_meta_class, ClassDef, DataType, OnOrphan, PropDef, Registry, ResolvedClass, StorageDef,
    CLASS_META, META_CLASSES, PROP_META, STORAGE_META,
};
use crate::object::{ObjectMap, StoredObject, FIELD_ID, FIELD_OWNER_ID};
use crate::storage::{open_provider, StorageProvider};
use crate::types::{mint_object_id, Principal, Timestamp};
use crate::validate::Validator;

/// Per-request runtime flags.
///
/// Derived from request headers by the shell; defaults are the engine
/// configuration's defaults. [`RequestContext::system`] is the internal
/// variant used by genesis-adjacent paths and cascades - it bypasses
/// ownership and custom-id gating.
#[derive(Clone, Debug)]
pub struct RequestContext {
    /// The acting principal, or `None` for anonymous requests.
    pub principal: Option<Principal>,

    /// Filter reads and gate writes by `owner_id == principal`.
    pub enforce_ownership: bool,

    /// Allow creates with a caller-supplied id.
    pub allow_custom_ids: bool,

    /// Hub connection id of the originating client, for echo suppression.
    pub origin_connection_id: Option<String>,

    deadline: Option<Instant>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            principal: None,
            enforce_ownership: true,
            allow_custom_ids: false,
            origin_connection_id: None,
            deadline: None,
        }
    }
}

impl RequestContext {
    /// An internal context: no ownership, custom ids allowed, no deadline.
    pub fn system() -> Self {
        Self {
            enforce_ownership: false,
            allow_custom_ids: true,
            ..Self::default()
        }
    }

    /// Sets the acting principal.
    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(Principal::new(principal));
        self
    }

    /// Disables ownership enforcement for this request.
    pub fn without_ownership(mut self) -> Self {
        self.enforce_ownership = false;
        self
    }

    /// Allows caller-supplied ids for this request.
    pub fn with_custom_ids(mut self) -> Self {
        self.allow_custom_ids = true;
        self
    }

    /// Attaches the originating hub connection id.
    pub fn with_origin(mut self, connection_id: impl Into<String>) -> Self {
        self.origin_connection_id = Some(connection_id.into());
        self
    }

    /// Fails with `unavailable` once the request deadline has passed.
    ///
    /// Checked between pipeline steps and inside scan loops; partial state
    /// never persists because atomicity sits at the provider put boundary.
    pub fn check_deadline(&self) -> Result<()> {
        match self.deadline {
            Some(deadline) if Instant::now() > deadline => {
                Err(StoreError::unavailable("request deadline exceeded"))
            }
            _ => Ok(()),
        }
    }

    /// True when the context may see/touch an object owned by `owner`.
    fn owns(&self, owner: Option<&str>) -> bool {
        match owner {
            None => true,
            Some(owner) => {
                !self.enforce_ownership
                    || self.principal.as_ref().map(Principal::as_str) == Some(owner)
            }
        }
    }
}

/// The main ElementStore engine handle.
///
/// Create one per process with [`ElementStore::open`] and inject it into
/// request handlers; there are no module-level singletons.
pub struct ElementStore {
    provider: Arc<dyn StorageProvider>,
    registry: Registry,
    emitter: ChangeEmitter,
    exports: ExportService,
    config: Config,

    /// Engine-level per-class write serialization.
    write_locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl std::fmt::Debug for ElementStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElementStore")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("broadcasting", &self.emitter.is_enabled())
            .finish_non_exhaustive()
    }
}

impl ElementStore {
    /// Opens the engine: validates config, opens storage, starts the
    /// emitter and runs genesis (idempotent) so the meta-classes exist.
    #[instrument(skip(config))]
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        info!(storage = config.storage.type_name(), "Opening ElementStore");

        let provider = open_provider(&config)?;

        let genesis = Genesis::new(Arc::clone(&provider));
        let report = genesis.run(config.genesis_dir.as_deref())?;
        for note in &report.drift {
            warn!(note = %note, "Genesis drift");
        }

        let emitter = match config.hub_url {
            Some(ref url) => ChangeEmitter::new(url),
            None => ChangeEmitter::disabled(),
        };

        let exports = ExportService::new(config.data_root.join("exports"));

        info!(
            seeded = report.created.len(),
            broadcasting = emitter.is_enabled(),
            "ElementStore opened"
        );

        Ok(Self {
            registry: Registry::new(Arc::clone(&provider)),
            provider,
            emitter,
            exports,
            config,
            write_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Returns a reference to the engine configuration.
    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Builds a request context from the configured defaults, with the
    /// standard deadline attached.
    pub fn request(&self) -> RequestContext {
        RequestContext {
            enforce_ownership: self.config.enforce_ownership,
            allow_custom_ids: self.config.allow_custom_ids,
            deadline: Some(Instant::now() + self.config.request_deadline),
            ..RequestContext::default()
        }
    }

    /// Storage access for sibling modules (export, self test).
    #[inline]
    pub(crate) fn provider(&self) -> &dyn StorageProvider {
        self.provider.as_ref()
    }

    /// Registry access for sibling modules.
    #[inline]
    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    // =========================================================================
    // Schema reads
    // =========================================================================

    /// Returns a class definition, or `None` if unknown.
    pub fn get_class(&self, id: &str) -> Result<Option<ClassDef>> {
        self.registry.get_class(id)
    }

    /// Lists all class definitions, sorted by id.
    pub fn list_classes(&self) -> Result<Vec<ClassDef>> {
        self.registry.list_classes()
    }

    /// Returns the resolved (inherited) property list of a class.
    pub fn get_class_props(&self, id: &str) -> Result<Vec<PropDef>> {
        self.registry.props_of(id)
    }

    /// Returns the ancestor chain of a class, root first.
    pub fn class_ancestors(&self, id: &str) -> Result<Vec<String>> {
        self.registry.ancestors(id)
    }

    // =========================================================================
    // Object reads
    // =========================================================================

    /// Returns an object as stored.
    ///
    /// With ownership enforcement on, an object owned by someone else
    /// comes back as `None` - deliberately indistinguishable from real
    /// absence.
    #[instrument(skip(self, ctx))]
    pub fn get_object(&self, ctx: &RequestContext, class_id: &str, id: &str) -> Result<Option<ObjectMap>> {
        ctx.check_deadline()?;
        self.registry.resolve(class_id)?;

        let Some(map) = self.provider.get(class_id, id)? else {
            return Ok(None);
        };
        let object = StoredObject::from_map(map);
        if !ctx.owns(object.owner_id()) {
            return Ok(None);
        }
        Ok(Some(object.into_map()))
    }

    /// Cross-class lookup by id: first match wins, system classes skipped.
    #[instrument(skip(self, ctx))]
    pub fn find_object(&self, ctx: &RequestContext, id: &str) -> Result<Option<ObjectMap>> {
        for class in self.registry.list_classes()? {
            ctx.check_deadline()?;
            if class.is_system {
                continue;
            }
            if let Some(object) = self.get_object(ctx, &class.id, id)? {
                return Ok(Some(object));
            }
        }
        Ok(None)
    }

    /// Equality query with sorting and paging.
    ///
    /// When ownership is enforced, results are filtered to the caller's
    /// objects (and unowned ones) before sort/limit/offset apply.
    #[instrument(skip(self, ctx, query))]
    pub fn query(&self, ctx: &RequestContext, class_id: &str, query: &Query) -> Result<Vec<ObjectMap>> {
        ctx.check_deadline()?;
        self.registry.resolve(class_id)?;

        let mut rows = self.provider.list(class_id)?;
        rows.retain(|row| ctx.owns(row.get(FIELD_OWNER_ID).and_then(Value::as_str)));
        Ok(query.apply(rows))
    }

    /// Lists all visible objects of a class.
    pub fn list_objects(&self, ctx: &RequestContext, class_id: &str) -> Result<Vec<ObjectMap>> {
        self.query(ctx, class_id, &Query::all())
    }

    /// Reads a single field; relation props resolve one level deep.
    #[instrument(skip(self, ctx))]
    pub fn get_field(
        &self,
        ctx: &RequestContext,
        class_id: &str,
        id: &str,
        key: &str,
    ) -> Result<Value> {
        let Some(object) = self.get_object(ctx, class_id, id)? else {
            return Err(StoreError::object_not_found(class_id, id));
        };
        let value = object.get(key).cloned().unwrap_or(Value::Null);

        let Some(prop) = self.registry.prop_of(class_id, key)? else {
            return Ok(value);
        };
        if prop.data_type != DataType::Relation || value.is_null() {
            return Ok(value);
        }

        match value {
            Value::String(ref target) => self.resolve_relation_target(ctx, &prop, target),
            Value::Array(items) => {
                let mut resolved = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::String(ref target) => {
                            resolved.push(self.resolve_relation_target(ctx, &prop, target)?)
                        }
                        other => resolved.push(other),
                    }
                }
                Ok(Value::Array(resolved))
            }
            other => Ok(other),
        }
    }

    /// Writes a single field through the full pipeline.
    ///
    /// The object must already exist (and be visible to the caller).
    #[instrument(skip(self, ctx, value))]
    pub fn set_field(
        &self,
        ctx: &RequestContext,
        class_id: &str,
        id: &str,
        key: &str,
        value: Value,
    ) -> Result<ObjectMap> {
        if self.get_object(ctx, class_id, id)?.is_none() {
            return Err(StoreError::object_not_found(class_id, id));
        }
        let mut input = ObjectMap::new();
        input.insert(FIELD_ID.to_string(), Value::String(id.to_string()));
        input.insert(key.to_string(), value);
        self.set_object(ctx, class_id, input)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// The single create/update entry point.
    ///
    /// Without `input.id` a new id is minted; with it, an existing object
    /// is updated (shallow merge) or - given the allow-custom-ids
    /// capability - created under the supplied id. Returns the persisted
    /// record.
    #[instrument(skip(self, ctx, input), fields(class = class_id))]
    pub fn set_object(
        &self,
        ctx: &RequestContext,
        class_id: &str,
        mut input: ObjectMap,
    ) -> Result<ObjectMap> {
        ctx.check_deadline()?;
        let resolved = self.registry.resolve(class_id)?;

        let lock = self.class_lock(class_id)?;
        let guard = lock
            .write()
            .map_err(|_| StoreError::unavailable("class write lock poisoned"))?;

        // 1. Identity resolution.
        let supplied = input
            .get(FIELD_ID)
            .and_then(Value::as_str)
            .map(str::to_string);
        let (id, existing) = match supplied {
            Some(id) => {
                check_id_shape(&id)?;
                let existing = self.provider.get(class_id, &id)?.map(StoredObject::from_map);
                // Meta records are authored with semantic ids (`book`,
                // `book.title`); the capability flag gates data classes only.
                if existing.is_none() && !ctx.allow_custom_ids && !is_meta_class(class_id) {
                    return Err(StoreError::conflict(format!(
                        "creating '{}' with a caller-supplied id requires the allow-custom-ids capability",
                        id
                    )));
                }
                (id, existing)
            }
            None if class_id == PROP_META => {
                return Err(StoreError::validation(FieldError::new(
                    FIELD_ID,
                    "required",
                    "@prop records carry their '<class>.<key>' id explicitly",
                )));
            }
            None => (mint_object_id(), None),
        };
        let is_create = existing.is_none();

        // 2. Ownership check (update path only).
        if let Some(ref previous) = existing {
            if !ctx.owns(previous.owner_id()) {
                return Err(StoreError::forbidden(format!(
                    "object {}/{} belongs to another principal",
                    class_id, id
                )));
            }
        }

        // 3. Merge, with readonly / create-only stripping.
        for prop in &resolved.props {
            if prop.readonly || (prop.create_only && !is_create) {
                input.remove(&prop.key);
            }
        }
        let mut record = existing.clone().unwrap_or_default();
        record.merge_input(&input);

        // 4. Defaults (create path only).
        if is_create {
            for prop in &resolved.props {
                if let Some(ref default) = prop.default_value {
                    let absent = matches!(record.get(&prop.key), None | Some(Value::Null));
                    if absent && !default.is_null() {
                        record.set(prop.key.clone(), default.clone());
                    }
                }
            }
        }

        // 5. Meta-class structural checks (schema errors lead).
        match class_id {
            CLASS_META => self.check_class_record(&id, record.as_map())?,
            PROP_META => self.check_prop_record(&id, record.as_map_mut())?,
            STORAGE_META => self.check_storage_record(&id, record.as_map())?,
            _ => {}
        }

        // 6. Coercion & validation - all errors collected.
        ctx.check_deadline()?;
        let validator = Validator::new(&self.registry);
        let mut errors = validator.validate(&resolved.props, record.as_map_mut());

        // 7. Relation-target existence.
        errors.extend(self.check_relation_targets(ctx, &resolved.props, record.as_map())?);

        if !errors.is_empty() {
            return Err(ValidationFailure::new(errors).into());
        }

        // 8. Uniqueness constraints.
        self.check_unique(&resolved, class_id, &id, record.as_map())?;

        // 9. Stamp.
        let now = Timestamp::now();
        match existing {
            Some(ref previous) => record.stamp_updated(previous, now),
            None => record.stamp_created(&id, class_id, ctx.principal.as_ref(), now),
        }

        // 10. Persist.
        ctx.check_deadline()?;
        self.provider.put(class_id, &id, record.as_map())?;
        self.invalidate_for(class_id, &id);
        drop(guard);

        info!(
            class = class_id,
            id = %id,
            version = record.version(),
            create = is_create,
            "Object committed"
        );

        // 11. Broadcast - fire and forget.
        self.emitter.emit(ChangeEvent::change(
            class_id,
            &id,
            record.as_map().clone(),
            existing.map(StoredObject::into_map),
            ctx.origin_connection_id.clone(),
        ));

        Ok(record.into_map())
    }

    /// Deletes an object, then applies `on_orphan` policies to referrers.
    ///
    /// Returns `false` when the object is absent (or hidden by ownership).
    /// Deleting under `@class` routes to [`delete_class`](Self::delete_class).
    #[instrument(skip(self, ctx))]
    pub fn delete_object(&self, ctx: &RequestContext, class_id: &str, id: &str) -> Result<bool> {
        ctx.check_deadline()?;
        if class_id == CLASS_META {
            return self.delete_class(ctx, id);
        }
        self.registry.resolve(class_id)?;

        let lock = self.class_lock(class_id)?;
        let guard = lock
            .write()
            .map_err(|_| StoreError::unavailable("class write lock poisoned"))?;

        let Some(existing) = self.provider.get(class_id, id)? else {
            return Ok(false);
        };
        let existing = StoredObject::from_map(existing);
        if !ctx.owns(existing.owner_id()) {
            // Hidden, indistinguishable from absent.
            return Ok(false);
        }

        self.provider.delete(class_id, id)?;
        self.invalidate_for(class_id, id);
        drop(guard);

        if !is_meta_class(class_id) {
            self.cascade_orphans(ctx, class_id, id, 0)?;
        }

        info!(class = class_id, id, "Object deleted");
        self.emitter.emit(ChangeEvent::delete(
            class_id,
            id,
            existing.into_map(),
            ctx.origin_connection_id.clone(),
        ));
        Ok(true)
    }

    /// Deletes a class definition.
    ///
    /// Refused with `conflict` while instances remain or while another
    /// class chains through it via `extends_id`. Removes the class's own
    /// `@prop` children along with the `@class` record.
    #[instrument(skip(self, ctx))]
    pub fn delete_class(&self, ctx: &RequestContext, class_id: &str) -> Result<bool> {
        ctx.check_deadline()?;
        if is_meta_class(class_id) {
            return Err(StoreError::conflict(format!(
                "'{}' is a reserved meta-class",
                class_id
            )));
        }
        let Some(_class) = self.registry.get_class(class_id)? else {
            return Ok(false);
        };

        if !self.provider.list(class_id)?.is_empty() {
            return Err(StoreError::conflict(format!(
                "class '{}' still has instances",
                class_id
            )));
        }
        let dependents = self.registry.descendants_of(class_id)?;
        if !dependents.is_empty() {
            return Err(StoreError::conflict(format!(
                "class '{}' is extended by: {}",
                class_id,
                dependents.join(", ")
            )));
        }

        for prop in self.registry.own_props(class_id)? {
            if self.provider.delete(PROP_META, &prop.id)? {
                self.emitter.emit(ChangeEvent::delete(
                    PROP_META,
                    &prop.id,
                    prop.to_map(),
                    ctx.origin_connection_id.clone(),
                ));
            }
        }

        let class_record = self.provider.get(CLASS_META, class_id)?.unwrap_or_default();
        self.provider.delete(CLASS_META, class_id)?;
        self.provider.drop_class(class_id)?;
        self.registry.invalidate(class_id);

        info!(class = class_id, "Class deleted");
        self.emitter.emit(ChangeEvent::delete(
            CLASS_META,
            class_id,
            class_record,
            ctx.origin_connection_id.clone(),
        ));
        Ok(true)
    }

    /// Development reset: drops every non-meta class, restores the meta
    /// containers to genesis state, returns the cleared class ids.
    #[instrument(skip(self))]
    pub fn reset(&self) -> Result<Vec<String>> {
        let mut cleared = Vec::new();
        for class in self.registry.list_classes()? {
            if is_meta_class(&class.id) {
                continue;
            }
            self.provider.drop_class(&class.id)?;
            cleared.push(class.id);
        }
        for meta in META_CLASSES {
            self.provider.drop_class(meta)?;
        }
        self.registry.invalidate_all();

        Genesis::new(Arc::clone(&self.provider)).run(self.config.genesis_dir.as_deref())?;

        info!(cleared = cleared.len(), "Store reset");
        Ok(cleared)
    }

    /// Re-runs the genesis loader against the live store.
    pub fn run_genesis(&self) -> Result<GenesisReport> {
        let report =
            Genesis::new(Arc::clone(&self.provider)).run(self.config.genesis_dir.as_deref())?;
        self.registry.invalidate_all();
        Ok(report)
    }

    /// The canonical built-in seed, for the loader-control surface.
    pub fn genesis_data(&self) -> Value {
        crate::genesis::builtin_data()
    }

    /// Scripted schema+data exercise returning a structured report.
    ///
    /// A testing aid, not part of the data path; runs against scratch
    /// classes and cleans up after itself.
    pub fn run_tests(&self) -> SelfTestReport {
        selftest::run(self)
    }

    // =========================================================================
    // Exports
    // =========================================================================

    /// Snapshots all classes and non-meta data into a content-addressed
    /// bundle.
    pub fn export_snapshot(&self) -> Result<ExportMeta> {
        let bundle = export::build_bundle(self)?;
        self.exports.save(&bundle)
    }

    /// Lists stored bundles, newest first.
    pub fn list_exports(&self) -> Result<Vec<ExportMeta>> {
        self.exports.list()
    }

    /// Loads a bundle by its content hash.
    pub fn get_export(&self, hash: &str) -> Result<Value> {
        self.exports.load(hash)
    }

    /// Removes a bundle. Returns `true` if it existed.
    pub fn delete_export(&self, hash: &str) -> Result<bool> {
        self.exports.delete(hash)
    }

    // =========================================================================
    // Pipeline internals
    // =========================================================================

    fn class_lock(&self, class_id: &str) -> Result<Arc<RwLock<()>>> {
        let mut locks = self
            .write_locks
            .lock()
            .map_err(|_| StoreError::unavailable("lock table poisoned"))?;
        Ok(Arc::clone(
            locks
                .entry(class_id.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(()))),
        ))
    }

    /// Registry invalidation after a meta commit.
    fn invalidate_for(&self, class_id: &str, id: &str) {
        match class_id {
            CLASS_META => self.registry.invalidate(id),
            PROP_META => {
                let owning = id.rfind('.').map(|i| &id[..i]).unwrap_or(id);
                self.registry.invalidate(owning);
            }
            _ => {}
        }
    }

    /// Structural checks for `@class` writes: parseable definition, parent
    /// exists, no `extends_id` cycle (checked against the candidate state).
    fn check_class_record(&self, id: &str, map: &ObjectMap) -> Result<()> {
        let mut with_id = map.clone();
        with_id.insert(FIELD_ID.to_string(), Value::String(id.to_string()));
        let candidate = ClassDef::from_map(&with_id)?;

        let Some(parent) = candidate.extends_id else {
            return Ok(());
        };

        let mut seen = std::collections::HashSet::from([id.to_string()]);
        let mut cursor = Some(parent);
        while let Some(current) = cursor {
            if !seen.insert(current.clone()) {
                return Err(StoreError::CycleDetected { class_id: current });
            }
            let Some(ancestor) = self.registry.get_class(&current)? else {
                return Err(StoreError::validation(FieldError::new(
                    "extends_id",
                    "unknown_class",
                    format!("extends_id references unknown class '{}'", current),
                )));
            };
            cursor = ancestor.extends_id;
        }
        Ok(())
    }

    /// Structural checks for `@prop` writes: id convention, known owning
    /// class, normalized `object_class_id`.
    fn check_prop_record(&self, id: &str, map: &mut ObjectMap) -> Result<()> {
        map.insert(FIELD_ID.to_string(), Value::String(id.to_string()));
        let prop = PropDef::from_map(map)?;

        if self.registry.get_class(prop.owning_class())?.is_none() {
            return Err(StoreError::validation(FieldError::new(
                FIELD_ID,
                "unknown_class",
                format!(
                    "prop '{}' belongs to unknown class '{}'",
                    id,
                    prop.owning_class()
                ),
            )));
        }

        // Scalar-or-array input normalizes to always-array on write.
        if map.contains_key("object_class_id") {
            map.insert(
                "object_class_id".to_string(),
                serde_json::to_value(&prop.object_class_id)?,
            );
        }
        Ok(())
    }

    /// Structural check for `@storage` writes: parseable binding.
    fn check_storage_record(&self, id: &str, map: &ObjectMap) -> Result<()> {
        let mut with_id = map.clone();
        with_id.insert(FIELD_ID.to_string(), Value::String(id.to_string()));
        StorageDef::from_map(&with_id)?;
        Ok(())
    }

    /// Verifies every non-null relation value references an existing
    /// object in a declared target class (or a subclass, unless strict).
    fn check_relation_targets(
        &self,
        ctx: &RequestContext,
        props: &[PropDef],
        map: &ObjectMap,
    ) -> Result<Vec<FieldError>> {
        let mut errors = Vec::new();

        for prop in props {
            if prop.data_type != DataType::Relation || prop.object_class_id.is_empty() {
                continue;
            }
            let Some(value) = map.get(&prop.key) else {
                continue;
            };
            let targets: Vec<&str> = match value {
                Value::Null => continue,
                Value::String(s) => vec![s.as_str()],
                Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
                _ => continue,
            };
            if targets.is_empty() {
                continue;
            }
            ctx.check_deadline()?;

            let classes = self.relation_target_classes(prop)?;
            for target in targets {
                let mut found = false;
                for class in &classes {
                    if self.provider.get(class, target)?.is_some() {
                        found = true;
                        break;
                    }
                }
                if !found {
                    errors.push(FieldError::relation_target_missing(&prop.key, target));
                }
            }
        }
        Ok(errors)
    }

    /// The classes a relation prop may point into: the declared ones,
    /// plus their descendants when `object_class_strict` is off.
    fn relation_target_classes(&self, prop: &PropDef) -> Result<Vec<String>> {
        let mut classes = prop.object_class_id.clone();
        if !prop.object_class_strict {
            for declared in &prop.object_class_id {
                classes.extend(self.registry.descendants_of(declared)?);
            }
        }
        classes.dedup();
        Ok(classes)
    }

    /// Enforces the class's composite `unique` constraints.
    fn check_unique(
        &self,
        resolved: &ResolvedClass,
        class_id: &str,
        id: &str,
        map: &ObjectMap,
    ) -> Result<()> {
        if resolved.class.unique.is_empty() {
            return Ok(());
        }

        let rows = self.provider.list(class_id)?;
        for constraint in &resolved.class.unique {
            let keys = constraint.keys();
            if keys.is_empty() {
                continue;
            }
            let candidate: Vec<&Value> = keys
                .iter()
                .map(|k| map.get(*k).unwrap_or(&Value::Null))
                .collect();

            for row in &rows {
                if row.get(FIELD_ID).and_then(Value::as_str) == Some(id) {
                    continue;
                }
                let other: Vec<&Value> = keys
                    .iter()
                    .map(|k| row.get(*k).unwrap_or(&Value::Null))
                    .collect();
                if candidate == other {
                    return Err(StoreError::conflict(format!(
                        "unique constraint ({}) violated",
                        keys.join("+")
                    )));
                }
            }
        }
        Ok(())
    }

    /// Fetches the object a relation value points at, honoring ownership.
    fn resolve_relation_target(
        &self,
        ctx: &RequestContext,
        prop: &PropDef,
        target: &str,
    ) -> Result<Value> {
        for class in self.relation_target_classes(prop)? {
            if let Some(object) = self.get_object(ctx, &class, target)? {
                return Ok(Value::Object(object));
            }
        }
        Ok(Value::Null)
    }

    /// Applies `on_orphan` policies to everything referring at a deleted
    /// object. Recursion (for `delete` policies) is bounded; exceeding the
    /// bound logs an `io_error` on the offending edge and aborts the
    /// remaining cascade - orphans become visible and the operator reruns.
    fn cascade_orphans(
        &self,
        ctx: &RequestContext,
        target_class: &str,
        target_id: &str,
        depth: usize,
    ) -> Result<()> {
        let target_ancestors = match self.registry.ancestors(target_class) {
            Ok(ancestors) => ancestors,
            // The class may be mid-teardown; nothing left to cascade.
            Err(_) => vec![target_class.to_string()],
        };

        for prop_map in self.provider.list(PROP_META)? {
            let Ok(prop) = PropDef::from_map(&prop_map) else {
                continue;
            };
            if prop.data_type != DataType::Relation || prop.on_orphan == OnOrphan::Keep {
                continue;
            }
            let points_here = if prop.object_class_strict {
                prop.object_class_id.iter().any(|c| c == target_class)
            } else {
                prop.object_class_id
                    .iter()
                    .any(|c| target_ancestors.contains(c))
            };
            if !points_here {
                continue;
            }

            // The prop applies to its owning class and every subclass.
            let owning = prop.owning_class().to_string();
            if self.registry.get_class(&owning)?.is_none() {
                continue;
            }
            let mut referrer_classes = vec![owning.clone()];
            referrer_classes.extend(self.registry.descendants_of(&owning)?);

            for referrer_class in referrer_classes {
                ctx.check_deadline()?;
                for row in self.provider.list(&referrer_class)? {
                    let Some(row_id) = row.get(FIELD_ID).and_then(Value::as_str) else {
                        continue;
                    };
                    if !references(row.get(&prop.key), target_id) {
                        continue;
                    }

                    match prop.on_orphan {
                        OnOrphan::Keep => {}
                        OnOrphan::Nullify => {
                            self.nullify_reference(ctx, &referrer_class, row_id, &prop, target_id)?;
                        }
                        OnOrphan::Delete => {
                            if depth >= self.config.cascade_depth_limit {
                                warn!(
                                    code = "io_error",
                                    class = %referrer_class,
                                    id = row_id,
                                    depth,
                                    "Cascade depth bound hit; aborting remaining cascade"
                                );
                                return Ok(());
                            }
                            self.cascade_delete(ctx, &referrer_class, row_id, depth + 1)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Clears (or prunes, for arrays) a dangling reference on a referrer.
    fn nullify_reference(
        &self,
        ctx: &RequestContext,
        class_id: &str,
        id: &str,
        prop: &PropDef,
        target_id: &str,
    ) -> Result<()> {
        let lock = self.class_lock(class_id)?;
        let guard = lock
            .write()
            .map_err(|_| StoreError::unavailable("class write lock poisoned"))?;

        let Some(previous) = self.provider.get(class_id, id)? else {
            return Ok(());
        };
        let previous = StoredObject::from_map(previous);
        let mut record = previous.clone();

        let cleared = match previous.get(&prop.key) {
            Some(Value::Array(items)) => {
                // Multi-valued relation: prune the dead id, keep the rest.
                let kept: Vec<Value> = items
                    .iter()
                    .filter(|item| item.as_str() != Some(target_id))
                    .cloned()
                    .collect();
                Value::Array(kept)
            }
            _ => Value::Null,
        };
        record.set(prop.key.clone(), cleared);
        record.stamp_updated(&previous, Timestamp::now());

        self.provider.put(class_id, id, record.as_map())?;
        drop(guard);

        info!(class = class_id, id, field = %prop.key, "Orphaned reference nullified");
        self.emitter.emit(ChangeEvent::change(
            class_id,
            id,
            record.into_map(),
            Some(previous.into_map()),
            ctx.origin_connection_id.clone(),
        ));
        Ok(())
    }

    /// Deletes a referrer as part of a cascade (ownership bypassed - this
    /// is an integrity action, not a client request).
    fn cascade_delete(
        &self,
        ctx: &RequestContext,
        class_id: &str,
        id: &str,
        depth: usize,
    ) -> Result<()> {
        let lock = self.class_lock(class_id)?;
        let guard = lock
            .write()
            .map_err(|_| StoreError::unavailable("class write lock poisoned"))?;
        let Some(existing) = self.provider.get(class_id, id)? else {
            return Ok(());
        };
        self.provider.delete(class_id, id)?;
        drop(guard);

        info!(class = class_id, id, depth, "Cascade-deleted referrer");
        self.emitter.emit(ChangeEvent::delete(
            class_id,
            id,
            existing,
            ctx.origin_connection_id.clone(),
        ));
        self.cascade_orphans(ctx, class_id, id, depth)
    }
}

/// True when a field value references `target_id` (scalar or list).
fn references(value: Option<&Value>, target_id: &str) -> bool {
    match value {
        Some(Value::String(s)) => s == target_id,
        Some(Value::Array(items)) => items.iter().any(|i| i.as_str() == Some(target_id)),
        _ => false,
    }
}

/// Shape check for caller-supplied ids: URL-safe, no path separators.
fn check_id_shape(id: &str) -> Result<()> {
    if id.is_empty()
        || id.len() > 256
        || id.contains('/')
        || id.contains('\\')
        || id.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(StoreError::validation(FieldError::new(
            FIELD_ID,
            "invalid_id",
            format!("'{}' is not a valid object id", id),
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn obj(value: serde_json::Value) -> ObjectMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn open_store(dir: &tempfile::TempDir) -> ElementStore {
        ElementStore::open(Config {
            data_root: dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_open_seeds_meta_classes() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let class = store.get_class("@prop").unwrap().unwrap();
        assert!(class.is_system);
        assert!(!store.get_class_props("@prop").unwrap().is_empty());
    }

    #[test]
    fn test_set_object_mints_id_and_stamps() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let ctx = store.request().with_principal("u1");

        store
            .set_object(&ctx, CLASS_META, obj(json!({"id": "book"})))
            .unwrap();

        let record = store
            .set_object(&ctx, "book", obj(json!({"title": "Dune"})))
            .unwrap();
        let record = StoredObject::from_map(record);

        assert!(!record.id().unwrap().is_empty());
        assert_eq!(record.class_id(), Some("book"));
        assert_eq!(record.owner_id(), Some("u1"));
        assert_eq!(record.version(), 1);
        assert_eq!(record.created_at(), record.updated_at());
    }

    #[test]
    fn test_custom_id_requires_capability() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let ctx = store.request();

        store
            .set_object(&ctx, CLASS_META, obj(json!({"id": "book"})))
            .unwrap();

        let err = store
            .set_object(&ctx, "book", obj(json!({"id": "b1", "title": "Dune"})))
            .unwrap_err();
        assert!(err.is_conflict());

        let permissive = store.request().with_custom_ids();
        let record = store
            .set_object(&permissive, "book", obj(json!({"id": "b1", "title": "Dune"})))
            .unwrap();
        assert_eq!(record["id"], json!("b1"));
    }

    #[test]
    fn test_unknown_class_is_not_found() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let ctx = store.request();

        let err = store
            .set_object(&ctx, "ghost", obj(json!({"x": 1})))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_extends_cycle_refused() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let ctx = store.request();

        store
            .set_object(&ctx, CLASS_META, obj(json!({"id": "a"})))
            .unwrap();
        store
            .set_object(&ctx, CLASS_META, obj(json!({"id": "b", "extends_id": "a"})))
            .unwrap();

        let err = store
            .set_object(&ctx, CLASS_META, obj(json!({"id": "a", "extends_id": "b"})))
            .unwrap_err();
        assert!(err.is_cycle());
    }

    #[test]
    fn test_prop_requires_known_owning_class() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let ctx = store.request();

        let err = store
            .set_object(
                &ctx,
                PROP_META,
                obj(json!({"id": "ghost.title", "key": "title", "data_type": "string"})),
            )
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_id_shape_rejected() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let ctx = store.request().with_custom_ids();

        store
            .set_object(&ctx, CLASS_META, obj(json!({"id": "book"})))
            .unwrap();
        for bad in ["a/b", "a b", ""] {
            let err = store
                .set_object(&ctx, "book", obj(json!({"id": bad})))
                .unwrap_err();
            assert!(err.is_validation(), "accepted id '{}'", bad);
        }
    }

    #[test]
    fn test_references_helper() {
        assert!(references(Some(&json!("x")), "x"));
        assert!(references(Some(&json!(["a", "x"])), "x"));
        assert!(!references(Some(&json!("y")), "x"));
        assert!(!references(Some(&json!(null)), "x"));
        assert!(!references(None, "x"));
    }

    #[test]
    fn test_deadline_expiry_is_unavailable() {
        let ctx = RequestContext {
            deadline: Some(Instant::now() - std::time::Duration::from_secs(1)),
            ..RequestContext::default()
        };
        let err = ctx.check_deadline().unwrap_err();
        assert_eq!(err.code(), "unavailable");
    }

    #[test]
    fn test_store_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ElementStore>();
    }
}
