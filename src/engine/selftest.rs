//! Scripted self test - a built-in schema+data exercise.
//!
//! Runs a fixed scenario against scratch classes (`selftest_*`), records a
//! pass/fail per step, and cleans up after itself. A development and
//! deployment aid, deliberately outside the data path.

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, instrument};

use crate::engine::{ElementStore, Query, RequestContext, SortDir};
use crate::meta::{CLASS_META, PROP_META};
use crate::object::ObjectMap;

/// One executed step.
#[derive(Clone, Debug, Serialize)]
pub struct SelfTestCase {
    /// Step name.
    pub name: String,

    /// Whether the step behaved as scripted.
    pub ok: bool,

    /// Failure detail, when not ok.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Structured result of one self-test run.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SelfTestReport {
    /// Count of passing steps.
    pub passed: usize,

    /// Count of failing steps.
    pub failed: usize,

    /// Per-step outcomes, in execution order.
    pub cases: Vec<SelfTestCase>,
}

impl SelfTestReport {
    /// True when every step passed.
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }

    fn record(&mut self, name: &str, outcome: Result<(), String>) {
        match outcome {
            Ok(()) => {
                self.passed += 1;
                self.cases.push(SelfTestCase {
                    name: name.to_string(),
                    ok: true,
                    detail: None,
                });
            }
            Err(detail) => {
                self.failed += 1;
                self.cases.push(SelfTestCase {
                    name: name.to_string(),
                    ok: false,
                    detail: Some(detail),
                });
            }
        }
    }
}

const SCRATCH_ANIMAL: &str = "selftest_animal";
const SCRATCH_DOG: &str = "selftest_dog";

fn obj(value: Value) -> ObjectMap {
    match value {
        Value::Object(map) => map,
        _ => ObjectMap::new(),
    }
}

/// Runs the scripted scenario. Never fails - failures land in the report.
#[instrument(skip(store))]
pub(crate) fn run(store: &ElementStore) -> SelfTestReport {
    let ctx = RequestContext::system();
    let mut report = SelfTestReport::default();

    cleanup(store, &ctx);

    report.record("create classes", create_classes(store, &ctx));
    report.record("required field refused", required_refused(store, &ctx));
    report.record("defaults and inheritance", defaults_and_inheritance(store, &ctx));
    report.record("partial update keeps fields", partial_update(store, &ctx));
    report.record("query sorts and pages", query_sorts(store, &ctx));
    report.record("unique constraint conflicts", unique_conflict(store, &ctx));
    report.record("populated class undeletable", populated_class_undeletable(store, &ctx));

    cleanup(store, &ctx);

    info!(passed = report.passed, failed = report.failed, "Self test finished");
    report
}

/// Removes scratch classes from previous or current runs.
fn cleanup(store: &ElementStore, ctx: &RequestContext) {
    for class in [SCRATCH_DOG, SCRATCH_ANIMAL] {
        if let Ok(rows) = store.list_objects(ctx, class) {
            for row in rows {
                if let Some(id) = row.get("id").and_then(Value::as_str) {
                    let _ = store.delete_object(ctx, class, id);
                }
            }
        }
        let _ = store.delete_class(ctx, class);
    }
}

fn create_classes(store: &ElementStore, ctx: &RequestContext) -> Result<(), String> {
    store
        .set_object(
            ctx,
            CLASS_META,
            obj(json!({"id": SCRATCH_ANIMAL, "unique": [["name"]]})),
        )
        .map_err(|e| e.to_string())?;
    store
        .set_object(
            ctx,
            CLASS_META,
            obj(json!({"id": SCRATCH_DOG, "extends_id": SCRATCH_ANIMAL})),
        )
        .map_err(|e| e.to_string())?;

    for (id, key, extra) in [
        (
            format!("{}.name", SCRATCH_ANIMAL),
            "name",
            json!({"required": true}),
        ),
        (
            format!("{}.sound", SCRATCH_ANIMAL),
            "sound",
            json!({"default_value": "noise"}),
        ),
        (
            format!("{}.sound", SCRATCH_DOG),
            "sound",
            json!({"default_value": "bark"}),
        ),
    ] {
        let mut record = obj(json!({"id": id, "key": key, "data_type": "string"}));
        if let Value::Object(extra) = extra {
            record.extend(extra);
        }
        store
            .set_object(ctx, PROP_META, record)
            .map_err(|e| e.to_string())?;
    }
    Ok(())
}

fn required_refused(store: &ElementStore, ctx: &RequestContext) -> Result<(), String> {
    match store.set_object(ctx, SCRATCH_ANIMAL, obj(json!({"sound": "moo"}))) {
        Err(e) if e.is_validation() => Ok(()),
        Err(e) => Err(format!("wrong error kind: {}", e)),
        Ok(_) => Err("write without required field was accepted".to_string()),
    }
}

fn defaults_and_inheritance(store: &ElementStore, ctx: &RequestContext) -> Result<(), String> {
    let dog = store
        .set_object(ctx, SCRATCH_DOG, obj(json!({"name": "Rex"})))
        .map_err(|e| e.to_string())?;
    if dog.get("sound") != Some(&json!("bark")) {
        return Err(format!("expected overridden default 'bark', got {:?}", dog.get("sound")));
    }

    let props = store.get_class_props(SCRATCH_DOG).map_err(|e| e.to_string())?;
    let sounds = props.iter().filter(|p| p.key == "sound").count();
    if sounds != 1 {
        return Err(format!("expected exactly one 'sound' prop, got {}", sounds));
    }
    Ok(())
}

fn partial_update(store: &ElementStore, ctx: &RequestContext) -> Result<(), String> {
    let created = store
        .set_object(
            ctx,
            SCRATCH_ANIMAL,
            obj(json!({"name": "Maus", "sound": "squeak"})),
        )
        .map_err(|e| e.to_string())?;
    let id = created["id"].as_str().unwrap_or_default().to_string();

    let updated = store
        .set_object(ctx, SCRATCH_ANIMAL, obj(json!({"id": id, "name": "Ratte"})))
        .map_err(|e| e.to_string())?;

    if updated.get("sound") != Some(&json!("squeak")) {
        return Err("omitted field was erased".to_string());
    }
    if updated.get("_version") != Some(&json!(2)) {
        return Err(format!("expected _version 2, got {:?}", updated.get("_version")));
    }
    if updated.get("created_at") != created.get("created_at") {
        return Err("created_at changed on update".to_string());
    }
    Ok(())
}

fn query_sorts(store: &ElementStore, ctx: &RequestContext) -> Result<(), String> {
    for name in ["a", "b", "c"] {
        store
            .set_object(ctx, SCRATCH_DOG, obj(json!({"name": name})))
            .map_err(|e| e.to_string())?;
    }
    let hits = store
        .query(
            ctx,
            SCRATCH_DOG,
            &Query::all().sort_by("name", SortDir::Desc).page(0, Some(2)),
        )
        .map_err(|e| e.to_string())?;

    let names: Vec<_> = hits
        .iter()
        .filter_map(|o| o.get("name").and_then(Value::as_str))
        .collect();
    if names != vec!["c", "b"] {
        return Err(format!("expected [c, b], got {:?}", names));
    }
    Ok(())
}

fn unique_conflict(store: &ElementStore, ctx: &RequestContext) -> Result<(), String> {
    store
        .set_object(ctx, SCRATCH_ANIMAL, obj(json!({"name": "Uniq"})))
        .map_err(|e| e.to_string())?;
    match store.set_object(ctx, SCRATCH_ANIMAL, obj(json!({"name": "Uniq"}))) {
        Err(e) if e.is_conflict() => Ok(()),
        Err(e) => Err(format!("wrong error kind: {}", e)),
        Ok(_) => Err("duplicate unique key was accepted".to_string()),
    }
}

fn populated_class_undeletable(store: &ElementStore, ctx: &RequestContext) -> Result<(), String> {
    match store.delete_class(ctx, SCRATCH_ANIMAL) {
        Err(e) if e.is_conflict() => Ok(()),
        Err(e) => Err(format!("wrong error kind: {}", e)),
        Ok(_) => Err("populated class was deleted".to_string()),
    }
}
