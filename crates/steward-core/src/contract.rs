//! Input/output data contracts
//!
//! A contract is a flat schema over a JSON object: named fields with an
//! expected type and a required flag. Contracts are validated at publish
//! time and enforced at the execution-engine boundary (start input,
//! completion output).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Expected JSON type of a contract field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl FieldType {
    /// Check whether a JSON value matches this type
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String => write!(f, "string"),
            Self::Number => write!(f, "number"),
            Self::Boolean => write!(f, "boolean"),
            Self::Object => write!(f, "object"),
            Self::Array => write!(f, "array"),
        }
    }
}

/// A single field in a data contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }
}

/// Schema for an input or output payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataContract {
    pub fields: Vec<FieldSpec>,
}

impl DataContract {
    /// An empty contract accepts any object
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    /// Structural problems in the contract itself (duplicate field names)
    pub fn schema_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for field in &self.fields {
            if field.name.is_empty() {
                violations.push("contract field with empty name".to_string());
            }
            if !seen.insert(field.name.as_str()) {
                violations.push(format!("duplicate contract field: {}", field.name));
            }
        }
        violations
    }

    /// Validate a payload against this contract.
    ///
    /// Collects every violation rather than stopping at the first, so the
    /// caller can self-correct in one round trip.
    pub fn validate(&self, payload: &Value) -> Result<(), Vec<String>> {
        let mut violations = Vec::new();

        let object = match payload.as_object() {
            Some(object) => object,
            None => return Err(vec!["payload must be a JSON object".to_string()]),
        };

        for field in &self.fields {
            match object.get(&field.name) {
                None | Some(Value::Null) => {
                    if field.required {
                        violations.push(format!("missing required field: {}", field.name));
                    }
                }
                Some(value) => {
                    if !field.field_type.matches(value) {
                        violations.push(format!(
                            "field {} must be a {}",
                            field.name, field.field_type
                        ));
                    }
                }
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn contract() -> DataContract {
        DataContract::empty()
            .with_field(FieldSpec::required("customer_id", FieldType::String))
            .with_field(FieldSpec::required("amount", FieldType::Number))
            .with_field(FieldSpec::optional("notes", FieldType::String))
    }

    #[test]
    fn test_valid_payload() {
        let payload = json!({"customer_id": "c-1", "amount": 42.5});
        assert!(contract().validate(&payload).is_ok());
    }

    #[test]
    fn test_collects_all_violations() {
        let payload = json!({"amount": "not a number", "notes": 7});
        let violations = contract().validate(&payload).unwrap_err();
        assert_eq!(violations.len(), 3);
        assert!(violations[0].contains("customer_id"));
    }

    #[test]
    fn test_null_counts_as_missing() {
        let payload = json!({"customer_id": null, "amount": 1});
        let violations = contract().validate(&payload).unwrap_err();
        assert_eq!(violations, vec!["missing required field: customer_id"]);
    }

    #[test]
    fn test_non_object_payload() {
        let violations = contract().validate(&json!([1, 2])).unwrap_err();
        assert_eq!(violations, vec!["payload must be a JSON object"]);
    }

    #[test]
    fn test_duplicate_field_is_schema_violation() {
        let contract = DataContract::empty()
            .with_field(FieldSpec::required("a", FieldType::String))
            .with_field(FieldSpec::optional("a", FieldType::Number));
        assert_eq!(contract.schema_violations().len(), 1);
    }

    #[test]
    fn test_empty_contract_accepts_any_object() {
        assert!(DataContract::empty().validate(&json!({"anything": 1})).is_ok());
    }
}
