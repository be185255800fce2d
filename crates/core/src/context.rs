//! Execution context payload.
//!
//! Steps exchange data through a context keyed by declared field names rather
//! than through references to arbitrary records. Handlers read the fields they
//! need and return output fields that are merged back in.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::value_object::ValueObject;

/// Named fields carried by a workflow execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowContext {
    fields: BTreeMap<String, JsonValue>,
}

impl ValueObject for WorkflowContext {}

impl WorkflowContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context from a JSON object. Anything else is rejected.
    pub fn from_json(value: JsonValue) -> DomainResult<Self> {
        match value {
            JsonValue::Object(map) => Ok(Self {
                fields: map.into_iter().collect(),
            }),
            JsonValue::Null => Ok(Self::default()),
            other => Err(DomainError::validation(format!(
                "context must be a JSON object, got {other}"
            ))),
        }
    }

    pub fn with(mut self, field: impl Into<String>, value: JsonValue) -> Self {
        self.fields.insert(field.into(), value);
        self
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.fields.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &JsonValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Return a new context with `other`'s fields layered on top.
    pub fn merged(&self, other: &WorkflowContext) -> Self {
        let mut fields = self.fields.clone();
        for (k, v) in &other.fields {
            fields.insert(k.clone(), v.clone());
        }
        Self { fields }
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(self.fields.clone().into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_overrides_existing_fields() {
        let base = WorkflowContext::new()
            .with("invoice_id", json!("inv-1"))
            .with("amount", json!(100));
        let output = WorkflowContext::new().with("amount", json!(120));

        let merged = base.merged(&output);
        assert_eq!(merged.get("amount"), Some(&json!(120)));
        assert_eq!(merged.get("invoice_id"), Some(&json!("inv-1")));
        // Original untouched.
        assert_eq!(base.get("amount"), Some(&json!(100)));
    }

    #[test]
    fn non_object_json_is_rejected() {
        assert!(WorkflowContext::from_json(json!([1, 2])).is_err());
        assert!(WorkflowContext::from_json(json!(null)).unwrap().is_empty());
    }
}
