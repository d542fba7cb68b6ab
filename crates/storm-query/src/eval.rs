use std::cmp::Ordering;

use serde_json::Value;

use crate::ast::{FieldCond, Query};

impl Query {
    /// Evaluate this query against a JSON document.
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Query::All => true,
            Query::Field { path, cond } => {
                let candidates = resolve_path(doc, path);
                if candidates.is_empty() {
                    // A missing field behaves like an explicit null.
                    cond.matches(&Value::Null)
                } else {
                    candidates.iter().any(|v| cond.matches(v))
                }
            }
            Query::And(children) => children.iter().all(|q| q.matches(doc)),
            Query::Or(children) => children.iter().any(|q| q.matches(doc)),
            Query::Not(child) => !child.matches(doc),
        }
    }
}

/// Walk a dotted path through nested maps, descending into arrays at every
/// step. Returns every value reachable at the path.
fn resolve_path<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut current = vec![doc];
    for segment in path.split('.') {
        let mut next = Vec::new();
        for value in current {
            match value {
                Value::Object(map) => {
                    if let Some(v) = map.get(segment) {
                        next.push(v);
                    }
                }
                Value::Array(items) => {
                    for item in items {
                        if let Some(v) = item.get(segment) {
                            next.push(v);
                        }
                    }
                }
                _ => {}
            }
        }
        current = next;
    }
    current
}

impl FieldCond {
    /// Evaluate this condition against a single field value.
    ///
    /// A list-valued field matches scalar conditions if any element matches,
    /// which is what makes `{"names": "web-1"}` address a resource by one of
    /// its names.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldCond::Eq(target) => eq_matches(value, target),
            FieldCond::Ne(target) => !eq_matches(value, target),
            FieldCond::In(targets) => targets.iter().any(|t| eq_matches(value, t)),
            FieldCond::Nin(targets) => !targets.iter().any(|t| eq_matches(value, t)),
            FieldCond::Regex(re) => any_str(value, |s| re.is_match(s)),
            FieldCond::StartsWith(prefix) => any_str(value, |s| s.starts_with(prefix.as_str())),
            FieldCond::EndsWith(suffix) => any_str(value, |s| s.ends_with(suffix.as_str())),
            FieldCond::Contains(needle) => any_str(value, |s| s.contains(needle.as_str())),
            FieldCond::Gt(target) => any_ord(value, target, |o| o == Ordering::Greater),
            FieldCond::Gte(target) => any_ord(value, target, |o| o != Ordering::Less),
            FieldCond::Lt(target) => any_ord(value, target, |o| o == Ordering::Less),
            FieldCond::Lte(target) => any_ord(value, target, |o| o != Ordering::Greater),
        }
    }
}

/// Equality with numeric coercion: `1` and `1.0` are equal. A list value is
/// equal to the target if the whole list matches or any element does.
fn eq_matches(value: &Value, target: &Value) -> bool {
    if values_equal(value, target) {
        return true;
    }
    match value {
        Value::Array(items) => items.iter().any(|item| values_equal(item, target)),
        _ => false,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs.iter().all(|(k, x)| ys.get(k).map_or(false, |y| values_equal(x, y)))
        }
        _ => a == b,
    }
}

fn any_str(value: &Value, pred: impl Fn(&str) -> bool) -> bool {
    match value {
        Value::String(s) => pred(s),
        Value::Array(items) => items.iter().any(|v| v.as_str().map_or(false, &pred)),
        _ => false,
    }
}

fn any_ord(value: &Value, target: &Value, pred: impl Fn(Ordering) -> bool) -> bool {
    let check = |v: &Value| compare_values(v, target).map_or(false, &pred);
    match value {
        Value::Array(items) => items.iter().any(check),
        v => check(v),
    }
}

/// Order two values when they are of comparable types: numbers against
/// numbers, strings against strings. Everything else is unordered and never
/// satisfies a range condition.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.as_str().cmp(y.as_str())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use crate::parse::parse;
    use serde_json::json;

    fn matches(query: serde_json::Value, doc: serde_json::Value) -> bool {
        parse(&query).unwrap().matches(&doc)
    }

    #[test]
    fn bare_equality() {
        assert!(matches(json!({"type": "alpha"}), json!({"type": "alpha"})));
        assert!(!matches(json!({"type": "alpha"}), json!({"type": "beta"})));
    }

    #[test]
    fn list_fields_match_by_element() {
        let doc = json!({"names": ["web-1", "web-1.example.org"]});
        assert!(matches(json!({"names": "web-1"}), doc.clone()));
        assert!(matches(json!({"names": ["web-1", "web-1.example.org"]}), doc.clone()));
        assert!(!matches(json!({"names": "db-1"}), doc));
    }

    #[test]
    fn dotted_paths_reach_nested_maps() {
        let doc = json!({"snapshot": {"labels": {"role": "db"}}});
        assert!(matches(json!({"snapshot.labels.role": "db"}), doc.clone()));
        assert!(!matches(json!({"snapshot.labels.role": "web"}), doc));
    }

    #[test]
    fn missing_field_equals_null() {
        assert!(matches(json!({"parent": null}), json!({"type": "x"})));
        assert!(matches(json!({"parent": {"$ne": "res-1"}}), json!({"type": "x"})));
        assert!(!matches(json!({"parent": "res-1"}), json!({"type": "x"})));
    }

    #[test]
    fn in_and_nin() {
        let doc = json!({"status": "running"});
        assert!(matches(json!({"status": {"$in": ["running", "stopped"]}}), doc.clone()));
        assert!(!matches(json!({"status": {"$nin": ["running"]}}), doc));
    }

    #[test]
    fn numeric_coercion() {
        assert!(matches(json!({"port": 80.0}), json!({"port": 80})));
        assert!(matches(json!({"port": {"$in": [80]}}), json!({"port": 80.0})));
    }

    #[test]
    fn ranges() {
        let doc = json!({"port": 8080});
        assert!(matches(json!({"port": {"$gt": 1024}}), doc.clone()));
        assert!(matches(json!({"port": {"$gte": 8080}}), doc.clone()));
        assert!(!matches(json!({"port": {"$lt": 8080}}), doc.clone()));
        assert!(matches(json!({"port": {"$lte": 8080}}), doc));
    }

    #[test]
    fn string_ranges_are_lexicographic() {
        assert!(matches(json!({"name": {"$gt": "abc"}}), json!({"name": "abd"})));
        assert!(!matches(json!({"name": {"$gt": 5}}), json!({"name": "abd"})));
    }

    #[test]
    fn string_operators() {
        let doc = json!({"image": "registry.example.org/storm:latest"});
        assert!(matches(json!({"image": {"$startsWith": "registry."}}), doc.clone()));
        assert!(matches(json!({"image": {"$endsWith": ":latest"}}), doc.clone()));
        assert!(matches(json!({"image": {"$contains": "/storm"}}), doc.clone()));
        assert!(matches(json!({"image": {"$regex": "storm:[a-z]+$"}}), doc));
    }

    #[test]
    fn and_or_not_compose() {
        let doc = json!({"type": "alpha", "status": "running"});
        assert!(matches(
            json!({"$and": [{"type": "alpha"}, {"status": "running"}]}),
            doc.clone()
        ));
        assert!(matches(
            json!({"$or": [{"type": "beta"}, {"status": "running"}]}),
            doc.clone()
        ));
        assert!(matches(json!({"$not": {"type": "beta"}}), doc.clone()));
        assert!(!matches(json!({"$not": {"type": "alpha"}}), doc));
    }

    #[test]
    fn field_level_not() {
        let doc = json!({"status": "stopped"});
        assert!(matches(json!({"status": {"$not": {"$eq": "running"}}}), doc.clone()));
        assert!(!matches(json!({"status": {"$not": {"$eq": "stopped"}}}), doc));
    }

    #[test]
    fn implicit_and_over_fields() {
        let doc = json!({"type": "alpha", "health": "healthy"});
        assert!(matches(json!({"type": "alpha", "health": "healthy"}), doc.clone()));
        assert!(!matches(json!({"type": "alpha", "health": "unhealthy"}), doc));
    }
}
