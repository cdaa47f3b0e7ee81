//! Declarative input schemas and their validation.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::types::InputFields;
use crate::{Result, SkaldError};

/// Declared runtime type of an input field.
///
/// Unrecognised type names are kept as [`FieldType::Unchecked`] and accept
/// any value, so schemas written for newer versions still load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FieldType {
    String,
    Integer,
    /// Integer or floating point.
    Number,
    Boolean,
    Array,
    Object,
    Unchecked(String),
}

impl FieldType {
    /// Structural type check of a JSON value against this declaration.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
            FieldType::Unchecked(_) => true,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Array => "array",
            FieldType::Object => "object",
            FieldType::Unchecked(name) => name,
        }
    }
}

impl From<String> for FieldType {
    fn from(name: String) -> Self {
        match name.as_str() {
            "string" => FieldType::String,
            "integer" => FieldType::Integer,
            "number" => FieldType::Number,
            "boolean" => FieldType::Boolean,
            "array" => FieldType::Array,
            "object" => FieldType::Object,
            _ => FieldType::Unchecked(name),
        }
    }
}

impl From<&str> for FieldType {
    fn from(name: &str) -> Self {
        FieldType::from(name.to_string())
    }
}

impl From<FieldType> for String {
    fn from(field_type: FieldType) -> Self {
        field_type.as_str().to_string()
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One declared input field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    /// Allowed values, advertised to callers in listings.
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>, field_type: impl Into<FieldType>) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
            required: true,
            enum_values: None,
            description: None,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: impl Into<FieldType>) -> Self {
        Self {
            required: false,
            ..Self::required(name, field_type)
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn enum_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enum_values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// Ordered set of declared input fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputSchema {
    fields: Vec<FieldSpec>,
}

impl InputSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field. A field with the same name is replaced in place.
    pub fn field(mut self, spec: FieldSpec) -> Self {
        match self.fields.iter_mut().find(|f| f.name == spec.name) {
            Some(existing) => *existing = spec,
            None => self.fields.push(spec),
        }
        self
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Check `input` against the schema, failing on the first violation.
    ///
    /// Checks run in a fixed order: required fields present, then declared
    /// types of supplied fields, then the total rendered length against
    /// `max_input_length`. Fields not declared in the schema are accepted
    /// but still count towards the length limit.
    pub fn validate(&self, input: &InputFields, max_input_length: Option<usize>) -> Result<()> {
        if let Some(missing) = self
            .fields
            .iter()
            .find(|f| f.required && !input.contains_key(&f.name))
        {
            return Err(SkaldError::validation(
                &missing.name,
                "required field is missing",
            ));
        }

        for (name, value) in input {
            if let Some(spec) = self.get(name)
                && !spec.field_type.accepts(value)
            {
                return Err(SkaldError::validation(
                    name,
                    format!(
                        "expected {}, got {}",
                        spec.field_type,
                        json_type_name(value)
                    ),
                ));
            }
        }

        if let Some(max) = max_input_length {
            let total: usize = input.values().map(rendered_len).sum();
            if total > max {
                return Err(SkaldError::validation(
                    "input",
                    format!("input too long: {total} characters exceeds the maximum of {max}"),
                ));
            }
        }

        Ok(())
    }

    /// JSON-schema shaped view used in function listings.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        for field in &self.fields {
            let mut prop = serde_json::Map::new();
            prop.insert("type".into(), json!(field.field_type.as_str()));
            if let Some(ref description) = field.description {
                prop.insert("description".into(), json!(description));
            }
            if let Some(ref values) = field.enum_values {
                prop.insert("enum".into(), json!(values));
            }
            if let Some(ref default) = field.default {
                prop.insert("default".into(), default.clone());
            }
            properties.insert(field.name.clone(), Value::Object(prop));
        }
        let required: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name.as_str())
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

/// Length of a value as counted against `max_input_length`.
///
/// Strings count their characters; everything else counts the characters
/// of its compact JSON rendering.
fn rendered_len(value: &Value) -> usize {
    match value {
        Value::String(s) => s.chars().count(),
        other => other.to_string().chars().count(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
