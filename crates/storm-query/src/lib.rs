//! The structured query dialect used by group definitions and the `?q=`
//! list-endpoint filter.
//!
//! A query is a JSON object whose interior nodes are operator maps and whose
//! leaves are scalars or lists. Bare field/value pairs mean equality;
//! multiple keys in one map are an implicit `$and`. The parser produces a
//! closed sum type which is then evaluated directly against stored JSON
//! documents.

pub mod ast;
pub mod error;
pub mod eval;
pub mod parse;

pub use ast::{FieldCond, Query};
pub use error::QueryError;
pub use parse::{parse, sanitize, MAX_DEPTH};
