use regex::Regex;
use serde_json::Value;

/// A parsed query tree.
///
/// The dialect is closed: there is no way to extend the operator set at
/// runtime, and evaluation is a total function over JSON documents.
#[derive(Debug, Clone)]
pub enum Query {
    /// The empty query; matches every document.
    All,
    /// A condition on a single (possibly dotted) field path.
    Field { path: String, cond: FieldCond },
    /// Every child must match. Children are evaluated in the order given.
    And(Vec<Query>),
    /// At least one child must match. Children are evaluated in the order given.
    Or(Vec<Query>),
    /// The child must not match.
    Not(Box<Query>),
}

/// A field-level condition.
#[derive(Debug, Clone)]
pub enum FieldCond {
    Eq(Value),
    Ne(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Regex(Regex),
    StartsWith(String),
    EndsWith(String),
    Contains(String),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
}

impl Query {
    /// Conjoin two queries, flattening `All` away.
    pub fn and(self, other: Query) -> Query {
        match (self, other) {
            (Query::All, q) | (q, Query::All) => q,
            (Query::And(mut a), Query::And(b)) => {
                a.extend(b);
                Query::And(a)
            }
            (Query::And(mut a), q) => {
                a.push(q);
                Query::And(a)
            }
            (a, b) => Query::And(vec![a, b]),
        }
    }
}
