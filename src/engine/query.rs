//! Equality queries with sorting and paging.
//!
//! A [`Query`] matches objects by exact field equality (no joins), then
//! applies `sort`/`sort_dir`, `offset` and `limit` - in that order, after
//! any ownership filtering done by the engine.

use std::cmp::Ordering;

use serde_json::Value;

use crate::object::{ObjectMap, FIELD_ID};

/// Sort direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortDir {
    /// Ascending (the default).
    #[default]
    Asc,
    /// Descending.
    Desc,
}

impl SortDir {
    /// Parses `asc`/`desc` (case-insensitive); anything else is `Asc`.
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("desc") {
            Self::Desc
        } else {
            Self::Asc
        }
    }
}

/// An equality-match query with control options.
#[derive(Clone, Debug, Default)]
pub struct Query {
    /// Field/value pairs that must all match exactly.
    pub filters: Vec<(String, Value)>,

    /// Field to sort by; `None` keeps storage order.
    pub sort: Option<String>,

    /// Sort direction (ascending by default).
    pub sort_dir: SortDir,

    /// Maximum number of results; `None` is unlimited.
    pub limit: Option<usize>,

    /// Results to skip before collecting.
    pub offset: usize,
}

impl Query {
    /// An unfiltered query returning everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Adds an equality filter.
    pub fn filter(mut self, field: impl Into<String>, value: Value) -> Self {
        self.filters.push((field.into(), value));
        self
    }

    /// Sets the sort field.
    pub fn sort_by(mut self, field: impl Into<String>, dir: SortDir) -> Self {
        self.sort = Some(field.into());
        self.sort_dir = dir;
        self
    }

    /// Sets the page window.
    pub fn page(mut self, offset: usize, limit: Option<usize>) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }

    /// Returns `true` when the object matches every filter.
    pub fn matches(&self, object: &ObjectMap) -> bool {
        self.filters.iter().all(|(field, expected)| {
            object.get(field).unwrap_or(&Value::Null) == expected
        })
    }

    /// Applies filtering, sorting and paging to a listed snapshot.
    pub(crate) fn apply(&self, objects: Vec<ObjectMap>) -> Vec<ObjectMap> {
        let mut matched: Vec<ObjectMap> =
            objects.into_iter().filter(|o| self.matches(o)).collect();

        if let Some(ref field) = self.sort {
            matched.sort_by(|a, b| {
                let ord = compare_values(
                    a.get(field).unwrap_or(&Value::Null),
                    b.get(field).unwrap_or(&Value::Null),
                );
                let ord = match self.sort_dir {
                    SortDir::Asc => ord,
                    SortDir::Desc => ord.reverse(),
                };
                // Ties break by id ascending for determinism, regardless
                // of the requested direction.
                ord.then_with(|| {
                    let id_a = a.get(FIELD_ID).and_then(Value::as_str).unwrap_or("");
                    let id_b = b.get(FIELD_ID).and_then(Value::as_str).unwrap_or("");
                    id_a.cmp(id_b)
                })
            });
        }

        matched
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

/// Total order over JSON values for sorting.
///
/// Numbers compare numerically, strings by code point (ISO date strings
/// therefore sort chronologically), booleans with false < true. Across
/// types a fixed rank applies: null < bool < number < string < everything
/// else, so mixed columns still sort deterministically.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)).then_with(|| {
            // Same rank but uncomparable payloads (arrays/objects):
            // stringify for a stable, if arbitrary, order.
            a.to_string().cmp(&b.to_string())
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: serde_json::Value) -> ObjectMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn books() -> Vec<ObjectMap> {
        vec![
            obj(json!({"id": "b1", "title": "Dune", "pages": 412, "in_print": true})),
            obj(json!({"id": "b2", "title": "Emma", "pages": 474, "in_print": false})),
            obj(json!({"id": "b3", "title": "Ubik", "pages": 224, "in_print": true})),
            obj(json!({"id": "b4", "title": "Ubik", "pages": 230, "in_print": true})),
        ]
    }

    #[test]
    fn test_equality_filter() {
        let query = Query::all().filter("in_print", json!(true));
        let hits = query.apply(books());
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn test_multiple_filters_conjoin() {
        let query = Query::all()
            .filter("in_print", json!(true))
            .filter("title", json!("Ubik"));
        let hits = query.apply(books());
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_missing_field_matches_null() {
        let query = Query::all().filter("subtitle", json!(null));
        assert_eq!(query.apply(books()).len(), 4);
    }

    #[test]
    fn test_numeric_sort() {
        let query = Query::all().sort_by("pages", SortDir::Asc);
        let hits = query.apply(books());
        let pages: Vec<_> = hits.iter().map(|o| o["pages"].as_i64().unwrap()).collect();
        assert_eq!(pages, vec![224, 230, 412, 474]);
    }

    #[test]
    fn test_string_sort_desc() {
        let query = Query::all().sort_by("title", SortDir::Desc);
        let hits = query.apply(books());
        assert_eq!(hits[0]["title"], json!("Ubik"));
        assert_eq!(hits[3]["title"], json!("Dune"));
    }

    #[test]
    fn test_ties_break_by_id_ascending() {
        let query = Query::all().sort_by("title", SortDir::Asc);
        let hits = query.apply(books());
        // The two "Ubik" rows must come back b3 then b4.
        assert_eq!(hits[2]["id"], json!("b3"));
        assert_eq!(hits[3]["id"], json!("b4"));

        // Direction flip keeps the id tiebreak ascending.
        let query = Query::all().sort_by("title", SortDir::Desc);
        let hits = query.apply(books());
        assert_eq!(hits[0]["id"], json!("b3"));
        assert_eq!(hits[1]["id"], json!("b4"));
    }

    #[test]
    fn test_bool_sort_false_before_true() {
        let query = Query::all().sort_by("in_print", SortDir::Asc);
        let hits = query.apply(books());
        assert_eq!(hits[0]["in_print"], json!(false));
    }

    #[test]
    fn test_offset_and_limit() {
        let query = Query::all()
            .sort_by("pages", SortDir::Asc)
            .page(1, Some(2));
        let hits = query.apply(books());
        let pages: Vec<_> = hits.iter().map(|o| o["pages"].as_i64().unwrap()).collect();
        assert_eq!(pages, vec![230, 412]);
    }

    #[test]
    fn test_offset_past_end_is_empty() {
        let query = Query::all().page(10, None);
        assert!(query.apply(books()).is_empty());
    }

    #[test]
    fn test_sort_dir_parse() {
        assert_eq!(SortDir::parse("desc"), SortDir::Desc);
        assert_eq!(SortDir::parse("DESC"), SortDir::Desc);
        assert_eq!(SortDir::parse("asc"), SortDir::Asc);
        assert_eq!(SortDir::parse("sideways"), SortDir::Asc);
    }

    #[test]
    fn test_date_strings_sort_chronologically() {
        let rows = vec![
            obj(json!({"id": "a", "at": "2024-06-01T00:00:00Z"})),
            obj(json!({"id": "b", "at": "2023-12-31T23:59:59Z"})),
        ];
        let hits = Query::all().sort_by("at", SortDir::Asc).apply(rows);
        assert_eq!(hits[0]["id"], json!("b"));
    }

    #[test]
    fn test_mixed_types_rank_stably() {
        let rows = vec![
            obj(json!({"id": "a", "v": "text"})),
            obj(json!({"id": "b", "v": 3})),
            obj(json!({"id": "c", "v": null})),
            obj(json!({"id": "d", "v": true})),
        ];
        let hits = Query::all().sort_by("v", SortDir::Asc).apply(rows);
        let ids: Vec<_> = hits.iter().map(|o| o["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["c", "d", "b", "a"]);
    }
}
