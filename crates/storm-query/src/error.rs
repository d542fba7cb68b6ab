use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Query must be a dictionary")]
    NotAnObject,

    #[error("Query is nested too deeply")]
    TooDeep,

    #[error("Operator {op} expects {expected}")]
    BadOperand { op: String, expected: &'static str },

    #[error("Invalid regular expression: {0}")]
    BadRegex(#[from] regex::Error),
}
