//! Feature schemas and strict row validation

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::{ModelshipError, ModelshipResult};

/// A single inbound feature row, keyed by feature name
pub type FeatureRow = Map<String, Value>;

/// Ordered set of named numeric fields a predictor expects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct FeatureSchema {
    fields: Vec<String>,
}

impl FeatureSchema {
    /// Build a schema, rejecting empty or duplicate names
    pub fn new<I, S>(fields: I) -> ModelshipResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        if fields.is_empty() {
            return Err(ModelshipError::Config(
                "feature schema must declare at least one field".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for field in &fields {
            if field.is_empty() {
                return Err(ModelshipError::Config("feature name must not be empty".to_string()));
            }
            if !seen.insert(field.as_str()) {
                return Err(ModelshipError::Config(format!("duplicate feature '{}'", field)));
            }
        }
        Ok(Self { fields })
    }

    /// Declared field names in order
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Validate one row and project it onto the declared field order.
    ///
    /// Every declared field must be present with a JSON number; unknown
    /// fields are rejected. Nothing is coerced.
    pub fn validate_row(&self, index: usize, row: &FeatureRow) -> ModelshipResult<Vec<f64>> {
        let mut values = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let value = row.get(field).ok_or_else(|| {
                ModelshipError::Validation(format!("inputs[{}]: missing field '{}'", index, field))
            })?;
            let number = match value {
                Value::Number(n) => n.as_f64(),
                _ => None,
            }
            .ok_or_else(|| {
                ModelshipError::Validation(format!(
                    "inputs[{}].{}: expected a number, got {}",
                    index,
                    field,
                    json_kind(value)
                ))
            })?;
            values.push(number);
        }

        if row.len() != self.fields.len() {
            let extra: Vec<&str> = row
                .keys()
                .filter(|k| !self.fields.iter().any(|f| f == *k))
                .map(String::as_str)
                .collect();
            return Err(ModelshipError::Validation(format!(
                "inputs[{}]: unexpected fields {:?}",
                index, extra
            )));
        }

        Ok(values)
    }

    /// Validate a batch, failing on the first offending row
    pub fn validate_rows(&self, rows: &[FeatureRow]) -> ModelshipResult<Vec<Vec<f64>>> {
        rows.iter()
            .enumerate()
            .map(|(i, row)| self.validate_row(i, row))
            .collect()
    }
}

impl TryFrom<Vec<String>> for FeatureSchema {
    type Error = ModelshipError;

    fn try_from(fields: Vec<String>) -> Result<Self, Self::Error> {
        FeatureSchema::new(fields)
    }
}

impl From<FeatureSchema> for Vec<String> {
    fn from(schema: FeatureSchema) -> Self {
        schema.fields
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> FeatureSchema {
        FeatureSchema::new(["f1", "f2", "f3"]).unwrap()
    }

    fn row(value: Value) -> FeatureRow {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_rejects_bad_schema() {
        assert!(FeatureSchema::new(Vec::<String>::new()).is_err());
        assert!(FeatureSchema::new(["a", "a"]).is_err());
        assert!(FeatureSchema::new(["a", ""]).is_err());
    }

    #[test]
    fn test_projects_in_declared_order() {
        let values = schema()
            .validate_row(0, &row(json!({"f3": 3, "f1": 1.5, "f2": -2})))
            .unwrap();
        assert_eq!(values, vec![1.5, -2.0, 3.0]);
    }

    #[test]
    fn test_missing_field() {
        let err = schema()
            .validate_row(4, &row(json!({"f1": 1, "f2": 2})))
            .unwrap_err();
        assert_eq!(err.to_string(), "Validation error: inputs[4]: missing field 'f3'");
    }

    #[test]
    fn test_no_string_coercion() {
        let err = schema()
            .validate_row(0, &row(json!({"f1": "1.0", "f2": 2, "f3": 3})))
            .unwrap_err();
        assert!(err.to_string().contains("expected a number, got string"));
    }

    #[test]
    fn test_extra_field_rejected() {
        let err = schema()
            .validate_row(0, &row(json!({"f1": 1, "f2": 2, "f3": 3, "f9": 0})))
            .unwrap_err();
        assert!(err.to_string().contains("f9"));
    }

    #[test]
    fn test_schema_serde() {
        let parsed: FeatureSchema = serde_json::from_str(r#"["a","b"]"#).unwrap();
        assert_eq!(parsed.fields(), &["a".to_string(), "b".to_string()]);
        assert!(serde_json::from_str::<FeatureSchema>(r#"["a","a"]"#).is_err());
    }
}
