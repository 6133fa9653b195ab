//! End-to-end schema + data lifecycle through the engine façade.

use elementstore::{Config, ElementStore, ObjectMap, RequestContext};
use serde_json::{json, Value};
use tempfile::tempdir;

fn obj(value: Value) -> ObjectMap {
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

fn ctx(store: &ElementStore, principal: &str) -> RequestContext {
    store.request().with_principal(principal)
}

#[test]
fn test_create_class_prop_and_instance() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let ctx = ctx(&store, "u1");

    store
        .set_object(&ctx, "@class", obj(json!({"id": "book"})))
        .unwrap();
    store
        .set_object(
            &ctx,
            "@prop",
            obj(json!({"id": "book.title", "key": "title",
                       "data_type": "string", "required": true})),
        )
        .unwrap();

    let record = store
        .set_object(&ctx, "book", obj(json!({"title": "x"})))
        .unwrap();

    assert_eq!(record["class_id"], json!("book"));
    assert_eq!(record["title"], json!("x"));
    assert_eq!(record["owner_id"], json!("u1"));
    assert_eq!(record["_version"], json!(1));
    assert!(record["created_at"].is_string());
    assert_eq!(record["created_at"], record["updated_at"]);
    assert!(!record["id"].as_str().unwrap().is_empty());
}

#[test]
fn test_missing_required_field_reports_per_field() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let ctx = ctx(&store, "u1");

    store
        .set_object(&ctx, "@class", obj(json!({"id": "book"})))
        .unwrap();
    store
        .set_object(
            &ctx,
            "@prop",
            obj(json!({"id": "book.title", "key": "title",
                       "data_type": "string", "required": true})),
        )
        .unwrap();

    let err = store
        .set_object(&ctx, "book", obj(json!({"pages": 10})))
        .unwrap_err();
    assert!(err.is_validation());

    let fields = err.field_errors().unwrap();
    assert_eq!(fields.len(), 1);
    assert_eq!(fields[0].field, "title");
    assert_eq!(fields[0].message, "title is required");
}

#[test]
fn test_inheritance_overrides_default() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let ctx = ctx(&store, "u1");

    store
        .set_object(&ctx, "@class", obj(json!({"id": "animal"})))
        .unwrap();
    store
        .set_object(&ctx, "@class", obj(json!({"id": "dog", "extends_id": "animal"})))
        .unwrap();
    store
        .set_object(
            &ctx,
            "@prop",
            obj(json!({"id": "animal.sound", "key": "sound",
                       "data_type": "string", "default_value": "noise"})),
        )
        .unwrap();
    store
        .set_object(
            &ctx,
            "@prop",
            obj(json!({"id": "dog.sound", "key": "sound",
                       "data_type": "string", "default_value": "bark"})),
        )
        .unwrap();

    // New dog without explicit sound gets the overridden default.
    let dog = store.set_object(&ctx, "dog", obj(json!({}))).unwrap();
    assert_eq!(dog["sound"], json!("bark"));

    // New animal keeps the parent default.
    let animal = store.set_object(&ctx, "animal", obj(json!({}))).unwrap();
    assert_eq!(animal["sound"], json!("noise"));

    // propsOf(dog) contains exactly one `sound` entry.
    let props = store.get_class_props("dog").unwrap();
    assert_eq!(props.iter().filter(|p| p.key == "sound").count(), 1);
}

#[test]
fn test_partial_update_retains_omitted_fields() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let ctx = ctx(&store, "u1");

    store
        .set_object(&ctx, "@class", obj(json!({"id": "book"})))
        .unwrap();
    let created = store
        .set_object(&ctx, "book", obj(json!({"title": "Dune", "pages": 412})))
        .unwrap();
    let id = created["id"].as_str().unwrap().to_string();

    std::thread::sleep(std::time::Duration::from_millis(5));

    let updated = store
        .set_object(&ctx, "book", obj(json!({"id": id, "title": "Dune (reissue)"})))
        .unwrap();

    // Omitted field survives; engine stamps move forward.
    assert_eq!(updated["pages"], json!(412));
    assert_eq!(updated["_version"], json!(2));
    assert_eq!(updated["created_at"], created["created_at"]);
    assert!(updated["updated_at"].as_str().unwrap() > created["updated_at"].as_str().unwrap());
}

#[test]
fn test_version_strictly_increases_over_writes() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let ctx = ctx(&store, "u1");

    store
        .set_object(&ctx, "@class", obj(json!({"id": "book"})))
        .unwrap();
    let created = store
        .set_object(&ctx, "book", obj(json!({"title": "v1"})))
        .unwrap();
    let id = created["id"].as_str().unwrap().to_string();

    for expected in 2..=5i64 {
        let updated = store
            .set_object(
                &ctx,
                "book",
                obj(json!({"id": id, "title": format!("v{}", expected)})),
            )
            .unwrap();
        assert_eq!(updated["_version"], json!(expected));
    }
}

#[test]
fn test_engine_fields_cannot_be_forged() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let ctx = ctx(&store, "u1");

    store
        .set_object(&ctx, "@class", obj(json!({"id": "book"})))
        .unwrap();
    let record = store
        .set_object(
            &ctx,
            "book",
            obj(json!({"title": "x", "_version": 99, "owner_id": "someone-else",
                       "created_at": "1970-01-01T00:00:00Z"})),
        )
        .unwrap();

    assert_eq!(record["_version"], json!(1));
    assert_eq!(record["owner_id"], json!("u1"));
    assert_ne!(record["created_at"], json!("1970-01-01T00:00:00Z"));
}

#[test]
fn test_get_after_set_is_identical() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let ctx = ctx(&store, "u1");

    store
        .set_object(&ctx, "@class", obj(json!({"id": "book"})))
        .unwrap();
    let written = store
        .set_object(&ctx, "book", obj(json!({"title": "Dune", "pages": 412})))
        .unwrap();
    let id = written["id"].as_str().unwrap();

    let read = store.get_object(&ctx, "book", id).unwrap().unwrap();
    assert_eq!(read, written);
}

#[test]
fn test_delete_then_get_is_absent() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let ctx = ctx(&store, "u1");

    store
        .set_object(&ctx, "@class", obj(json!({"id": "book"})))
        .unwrap();
    let record = store
        .set_object(&ctx, "book", obj(json!({"title": "x"})))
        .unwrap();
    let id = record["id"].as_str().unwrap().to_string();

    assert!(store.delete_object(&ctx, "book", &id).unwrap());
    assert!(store.get_object(&ctx, "book", &id).unwrap().is_none());
    assert!(!store.delete_object(&ctx, "book", &id).unwrap());
}

#[test]
fn test_delete_class_refused_while_populated() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let ctx = ctx(&store, "u1");

    store
        .set_object(&ctx, "@class", obj(json!({"id": "book"})))
        .unwrap();
    let record = store
        .set_object(&ctx, "book", obj(json!({"title": "x"})))
        .unwrap();

    let err = store.delete_class(&ctx, "book").unwrap_err();
    assert!(err.is_conflict());

    let id = record["id"].as_str().unwrap().to_string();
    store.delete_object(&ctx, "book", &id).unwrap();
    assert!(store.delete_class(&ctx, "book").unwrap());
    assert!(store.get_class("book").unwrap().is_none());
}

#[test]
fn test_delete_class_refused_while_extended() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let ctx = ctx(&store, "u1");

    store
        .set_object(&ctx, "@class", obj(json!({"id": "animal"})))
        .unwrap();
    store
        .set_object(&ctx, "@class", obj(json!({"id": "dog", "extends_id": "animal"})))
        .unwrap();

    let err = store.delete_class(&ctx, "animal").unwrap_err();
    assert!(err.is_conflict());

    assert!(store.delete_class(&ctx, "dog").unwrap());
    assert!(store.delete_class(&ctx, "animal").unwrap());
}

#[test]
fn test_delete_class_removes_prop_children() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let ctx = ctx(&store, "u1");

    store
        .set_object(&ctx, "@class", obj(json!({"id": "book"})))
        .unwrap();
    store
        .set_object(
            &ctx,
            "@prop",
            obj(json!({"id": "book.title", "key": "title", "data_type": "string"})),
        )
        .unwrap();

    store.delete_class(&ctx, "book").unwrap();
    assert!(store
        .get_object(&RequestContext::system(), "@prop", "book.title")
        .unwrap()
        .is_none());
}

#[test]
fn test_find_object_skips_system_classes() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let ctx = ctx(&store, "u1");

    store
        .set_object(&ctx, "@class", obj(json!({"id": "book"})))
        .unwrap();
    let record = store
        .set_object(&ctx, "book", obj(json!({"title": "x"})))
        .unwrap();
    let id = record["id"].as_str().unwrap();

    let found = store.find_object(&ctx, id).unwrap().unwrap();
    assert_eq!(found["class_id"], json!("book"));

    // Meta records are invisible to cross-class lookup.
    assert!(store.find_object(&ctx, "@prop.key").unwrap().is_none());
}

#[test]
fn test_field_access_resolves_relation_one_level() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let ctx = ctx(&store, "u1");

    store
        .set_object(&ctx, "@class", obj(json!({"id": "customer"})))
        .unwrap();
    store
        .set_object(&ctx, "@class", obj(json!({"id": "invoice"})))
        .unwrap();
    store
        .set_object(
            &ctx,
            "@prop",
            obj(json!({"id": "customer.name", "key": "name", "data_type": "string"})),
        )
        .unwrap();
    store
        .set_object(
            &ctx,
            "@prop",
            obj(json!({"id": "invoice.customer_id", "key": "customer_id",
                       "data_type": "relation", "object_class_id": ["customer"]})),
        )
        .unwrap();

    let customer = store
        .set_object(&ctx, "customer", obj(json!({"name": "Ada"})))
        .unwrap();
    let customer_id = customer["id"].as_str().unwrap().to_string();

    let invoice = store
        .set_object(&ctx, "invoice", obj(json!({"customer_id": customer_id})))
        .unwrap();
    let invoice_id = invoice["id"].as_str().unwrap();

    let resolved = store
        .get_field(&ctx, "invoice", invoice_id, "customer_id")
        .unwrap();
    assert_eq!(resolved["name"], json!("Ada"));

    // set_field routes through the whole pipeline.
    let updated = store
        .set_field(&ctx, "customer", &customer_id, "name", json!("Ava"))
        .unwrap();
    assert_eq!(updated["name"], json!("Ava"));
    assert_eq!(updated["_version"], json!(2));
}

#[test]
fn test_readonly_and_create_only_props() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let ctx = ctx(&store, "u1");

    store
        .set_object(&ctx, "@class", obj(json!({"id": "doc"})))
        .unwrap();
    store
        .set_object(
            &ctx,
            "@prop",
            obj(json!({"id": "doc.sealed", "key": "sealed",
                       "data_type": "string", "readonly": true})),
        )
        .unwrap();
    store
        .set_object(
            &ctx,
            "@prop",
            obj(json!({"id": "doc.slug", "key": "slug",
                       "data_type": "string", "create_only": true})),
        )
        .unwrap();

    let created = store
        .set_object(&ctx, "doc", obj(json!({"sealed": "nope", "slug": "first"})))
        .unwrap();
    assert!(created.get("sealed").is_none());
    assert_eq!(created["slug"], json!("first"));

    let id = created["id"].as_str().unwrap().to_string();
    let updated = store
        .set_object(&ctx, "doc", obj(json!({"id": id, "slug": "second"})))
        .unwrap();
    assert_eq!(updated["slug"], json!("first"));
}

#[test]
fn test_unique_constraint_conflicts() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);
    let ctx = ctx(&store, "u1");

    store
        .set_object(
            &ctx,
            "@class",
            obj(json!({"id": "user", "unique": [["email"]]})),
        )
        .unwrap();
    store
        .set_object(
            &ctx,
            "@prop",
            obj(json!({"id": "user.email", "key": "email", "data_type": "string"})),
        )
        .unwrap();

    let first = store
        .set_object(&ctx, "user", obj(json!({"email": "a@b.co"})))
        .unwrap();

    let err = store
        .set_object(&ctx, "user", obj(json!({"email": "a@b.co"})))
        .unwrap_err();
    assert!(err.is_conflict());

    // Updating the same record is not a self-collision.
    let id = first["id"].as_str().unwrap().to_string();
    let updated = store
        .set_object(&ctx, "user", obj(json!({"id": id, "email": "a@b.co"})))
        .unwrap();
    assert_eq!(updated["_version"], json!(2));
}

#[test]
fn test_self_test_report() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir);

    let report = store.run_tests();
    assert!(report.all_passed(), "failures: {:?}", report.cases);

    let rendered = serde_json::to_value(&report).unwrap();
    assert_eq!(rendered["failed"], json!(0));
    assert!(rendered["cases"].as_array().unwrap().len() >= 5);
}
