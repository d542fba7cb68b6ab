use std::collections::BTreeMap;

use serde::Serialize;

/// Field-keyed validation messages, serialized at the API boundary as
/// `{"field": ["message", ...]}`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors {
    pub fields: BTreeMap<String, Vec<String>>,
}

impl std::error::Error for ValidationErrors {}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.add(field, message);
        errors
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.fields.entry(field.into()).or_default().push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Return `Err(self)` when any message was recorded.
    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }

    pub fn required() -> String {
        "This field is required.".to_string()
    }

    pub fn blank() -> String {
        "This field may not be blank.".to_string()
    }

    pub fn not_found(value: &str) -> String {
        format!("Invalid id or name \"{}\".", value)
    }

    pub fn bad_choice(value: &str) -> String {
        format!("\"{}\" is not a valid choice.", value)
    }

    pub fn wrong_type(expected: &str) -> String {
        format!("Expected {}.", expected)
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (field, messages) in &self.fields {
            for message in messages {
                if !first {
                    write!(f, "; ")?;
                }
                write!(f, "{}: {}", field, message)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_field_map() {
        let mut errors = ValidationErrors::new();
        errors.add("type", ValidationErrors::required());
        errors.add("type", ValidationErrors::blank());
        errors.add("name", "duplicate");
        let v = serde_json::to_value(&errors).unwrap();
        assert_eq!(v["type"].as_array().unwrap().len(), 2);
        assert_eq!(v["name"][0], "duplicate");
    }

    #[test]
    fn empty_is_ok() {
        assert!(ValidationErrors::new().into_result().is_ok());
        assert!(ValidationErrors::single("x", "bad").into_result().is_err());
    }
}
