use regex::Regex;
use serde_json::{Map, Value};

use crate::ast::{FieldCond, Query};
use crate::error::QueryError;

/// Maximum nesting depth of operator trees. Deeper queries are rejected
/// rather than risking unbounded recursion on adversarial input.
pub const MAX_DEPTH: usize = 32;

/// Parse a JSON query object into a [`Query`] tree.
///
/// Unknown `$`-prefixed keys and keys containing `\0` are stripped rather
/// than rejected; `.` is allowed and means a path into nested maps.
pub fn parse(query: &Value) -> Result<Query, QueryError> {
    let map = query.as_object().ok_or(QueryError::NotAnObject)?;
    parse_map(map, 0)
}

/// Remove keys a query is never allowed to contain: anything with `\0`, and
/// `$`-prefixed keys that are not recognized operators. Applied recursively,
/// including through `$and`/`$or` branches.
pub fn sanitize(query: &mut Value) {
    let Some(map) = query.as_object_mut() else { return };

    let bad: Vec<String> = map
        .keys()
        .filter(|k| k.contains('\0') || (k.starts_with('$') && !is_operator(k)))
        .cloned()
        .collect();
    for key in bad {
        map.remove(&key);
    }

    for (key, value) in map.iter_mut() {
        if key.starts_with('$') {
            match value {
                Value::Array(items) => items.iter_mut().for_each(sanitize),
                v => sanitize(v),
            }
        } else if value.is_object() {
            sanitize(value);
        }
    }
}

fn is_operator(key: &str) -> bool {
    matches!(
        key,
        "$eq" | "$ne" | "$in" | "$nin" | "$regex" | "$startsWith" | "$endsWith" | "$contains"
            | "$gt" | "$gte" | "$lt" | "$lte" | "$not" | "$and" | "$or"
    )
}

fn parse_map(map: &Map<String, Value>, depth: usize) -> Result<Query, QueryError> {
    if depth > MAX_DEPTH {
        return Err(QueryError::TooDeep);
    }

    let mut clauses = Vec::new();

    for (key, value) in map {
        match key.as_str() {
            "$and" => clauses.push(Query::And(parse_branches(key, value, depth + 1)?)),
            "$or" => clauses.push(Query::Or(parse_branches(key, value, depth + 1)?)),
            "$not" => {
                let inner = value.as_object().ok_or(QueryError::BadOperand {
                    op: key.clone(),
                    expected: "an object",
                })?;
                clauses.push(Query::Not(Box::new(parse_map(inner, depth + 1)?)));
            }
            k if k.starts_with('$') || k.contains('\0') => {
                // Not a recognized operator; stripped defensively.
                continue;
            }
            field => clauses.push(parse_field(field, value, depth + 1)?),
        }
    }

    Ok(match clauses.len() {
        0 => Query::All,
        1 => clauses.pop().expect("len checked"),
        _ => Query::And(clauses),
    })
}

fn parse_branches(op: &str, value: &Value, depth: usize) -> Result<Vec<Query>, QueryError> {
    if depth > MAX_DEPTH {
        return Err(QueryError::TooDeep);
    }
    let items = value.as_array().ok_or(QueryError::BadOperand {
        op: op.to_string(),
        expected: "an array of objects",
    })?;
    items
        .iter()
        .map(|item| {
            let map = item.as_object().ok_or(QueryError::BadOperand {
                op: op.to_string(),
                expected: "an array of objects",
            })?;
            parse_map(map, depth + 1)
        })
        .collect()
}

/// Parse the value side of a field key. An object with at least one
/// recognized operator key is an operator map; anything else is a literal
/// equality test.
fn parse_field(field: &str, value: &Value, depth: usize) -> Result<Query, QueryError> {
    if depth > MAX_DEPTH {
        return Err(QueryError::TooDeep);
    }

    let path = field.to_string();

    let Some(map) = value.as_object() else {
        return Ok(Query::Field { path, cond: FieldCond::Eq(value.clone()) });
    };
    if !map.keys().any(|k| is_operator(k)) {
        return Ok(Query::Field { path, cond: FieldCond::Eq(value.clone()) });
    }

    let mut queries = Vec::new();
    let push = |queries: &mut Vec<Query>, cond: FieldCond| {
        queries.push(Query::Field { path: path.clone(), cond });
    };

    for (op, operand) in map {
        match op.as_str() {
            "$eq" => push(&mut queries, FieldCond::Eq(operand.clone())),
            "$ne" => push(&mut queries, FieldCond::Ne(operand.clone())),
            "$in" => push(&mut queries, FieldCond::In(operand_list(op, operand)?)),
            "$nin" => push(&mut queries, FieldCond::Nin(operand_list(op, operand)?)),
            "$regex" => {
                let pattern = operand_str(op, operand)?;
                push(&mut queries, FieldCond::Regex(Regex::new(pattern)?));
            }
            "$startsWith" => {
                push(&mut queries, FieldCond::StartsWith(operand_str(op, operand)?.to_string()))
            }
            "$endsWith" => {
                push(&mut queries, FieldCond::EndsWith(operand_str(op, operand)?.to_string()))
            }
            "$contains" => {
                push(&mut queries, FieldCond::Contains(operand_str(op, operand)?.to_string()))
            }
            "$gt" => push(&mut queries, FieldCond::Gt(operand.clone())),
            "$gte" => push(&mut queries, FieldCond::Gte(operand.clone())),
            "$lt" => push(&mut queries, FieldCond::Lt(operand.clone())),
            "$lte" => push(&mut queries, FieldCond::Lte(operand.clone())),
            "$not" => {
                // Negation of a nested operator map on the same path.
                let inner = parse_field(field, operand, depth + 1)?;
                queries.push(Query::Not(Box::new(inner)));
            }
            _ => continue, // unrecognized operator, stripped
        }
    }

    Ok(match queries.len() {
        0 => Query::All,
        1 => queries.pop().expect("len checked"),
        _ => Query::And(queries),
    })
}

fn operand_list(op: &str, operand: &Value) -> Result<Vec<Value>, QueryError> {
    operand
        .as_array()
        .cloned()
        .ok_or(QueryError::BadOperand { op: op.to_string(), expected: "an array" })
}

fn operand_str<'a>(op: &str, operand: &'a Value) -> Result<&'a str, QueryError> {
    operand
        .as_str()
        .ok_or(QueryError::BadOperand { op: op.to_string(), expected: "a string" })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_query_is_all() {
        assert!(matches!(parse(&json!({})).unwrap(), Query::All));
    }

    #[test]
    fn bare_pair_is_equality() {
        let q = parse(&json!({"type": "alpha"})).unwrap();
        match q {
            Query::Field { path, cond: FieldCond::Eq(v) } => {
                assert_eq!(path, "type");
                assert_eq!(v, json!("alpha"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn multiple_keys_are_implicit_and() {
        let q = parse(&json!({"type": "alpha", "status": "running"})).unwrap();
        assert!(matches!(q, Query::And(ref children) if children.len() == 2));
    }

    #[test]
    fn or_preserves_branch_order() {
        let q = parse(&json!({"$or": [{"a": 1}, {"b": 2}]})).unwrap();
        match q {
            Query::Or(children) => {
                assert!(matches!(&children[0], Query::Field { path, .. } if path == "a"));
                assert!(matches!(&children[1], Query::Field { path, .. } if path == "b"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn operator_map_with_two_ops_is_and() {
        let q = parse(&json!({"port": {"$gte": 1024, "$lt": 2048}})).unwrap();
        assert!(matches!(q, Query::And(ref children) if children.len() == 2));
    }

    #[test]
    fn unknown_dollar_keys_are_stripped() {
        let q = parse(&json!({"$where": "evil()", "type": "x"})).unwrap();
        assert!(matches!(q, Query::Field { ref path, .. } if path == "type"));
    }

    #[test]
    fn object_without_operators_is_literal() {
        let q = parse(&json!({"snapshot": {"labels": {"role": "db"}}})).unwrap();
        assert!(matches!(q, Query::Field { cond: FieldCond::Eq(_), .. }));
    }

    #[test]
    fn field_not_negates() {
        let q = parse(&json!({"status": {"$not": {"$eq": "running"}}})).unwrap();
        assert!(matches!(q, Query::Not(_)));
    }

    #[test]
    fn bad_in_operand_errors() {
        assert!(parse(&json!({"type": {"$in": "not-a-list"}})).is_err());
    }

    #[test]
    fn bad_regex_errors() {
        assert!(parse(&json!({"name": {"$regex": "("}})).is_err());
    }

    #[test]
    fn non_object_query_errors() {
        assert!(matches!(parse(&json!([1, 2])), Err(QueryError::NotAnObject)));
    }

    #[test]
    fn depth_guard_rejects_pathological_nesting() {
        let mut q = json!({"a": 1});
        for _ in 0..(MAX_DEPTH + 2) {
            q = json!({"$not": q});
        }
        assert!(matches!(parse(&q), Err(QueryError::TooDeep)));
    }

    #[test]
    fn sanitize_strips_nul_and_unknown_dollar_keys() {
        let mut q = json!({
            "$or": [{"$where": "evil", "ok": 1}],
            "bad\0key": 2,
            "keep": {"$unknown": 3, "nested": {"$bad": 4}},
        });
        sanitize(&mut q);
        assert_eq!(
            q,
            json!({"$or": [{"ok": 1}], "keep": {"nested": {}}})
        );
    }
}
