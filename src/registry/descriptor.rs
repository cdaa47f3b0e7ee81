//! Function descriptors and prompt templates.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::schema::{FieldSpec, InputSchema};
use crate::types::{InputFields, ModelParams};

/// Renders validated input into the backend user prompt.
#[derive(Clone, Default)]
pub enum PromptTemplate {
    /// Canonical pretty-printed JSON of the input map.
    ///
    /// Fallback for functions without a hand-authored prompt.
    #[default]
    Structural,
    /// Text with `{field}` placeholders substituted from the input.
    ///
    /// String values are inserted raw, other values as compact JSON, and
    /// missing fields as the empty string. `{{` and `}}` escape braces.
    Pattern(String),
    /// Arbitrary rendering function.
    Custom(Arc<dyn Fn(&InputFields) -> String + Send + Sync>),
}

impl PromptTemplate {
    pub fn pattern(text: impl Into<String>) -> Self {
        PromptTemplate::Pattern(text.into())
    }

    pub fn custom<F>(render: F) -> Self
    where
        F: Fn(&InputFields) -> String + Send + Sync + 'static,
    {
        PromptTemplate::Custom(Arc::new(render))
    }

    pub fn render(&self, input: &InputFields) -> String {
        match self {
            PromptTemplate::Structural => structural(input),
            PromptTemplate::Pattern(text) => substitute(text, input),
            PromptTemplate::Custom(render) => render(input),
        }
    }
}

impl fmt::Debug for PromptTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptTemplate::Structural => f.write_str("Structural"),
            PromptTemplate::Pattern(text) => f.debug_tuple("Pattern").field(text).finish(),
            PromptTemplate::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

fn structural(input: &InputFields) -> String {
    // Map keys are already sorted, so the rendering is canonical.
    serde_json::to_string_pretty(input).unwrap_or_default()
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn substitute(text: &str, input: &InputFields) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for n in chars.by_ref() {
                    if n == '}' {
                        closed = true;
                        break;
                    }
                    name.push(n);
                }
                if closed {
                    if let Some(value) = input.get(name.trim()) {
                        out.push_str(&render_value(value));
                    }
                } else {
                    out.push('{');
                    out.push_str(&name);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Declarative definition of one callable AI function.
///
/// Descriptors are immutable once registered and shared behind `Arc`.
#[derive(Debug, Clone)]
pub struct FunctionDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Fixed instruction sent as the system prompt.
    pub system_prompt: String,
    pub template: PromptTemplate,
    pub input_schema: InputSchema,
    /// Limit on the summed rendered length of all input values.
    pub max_input_length: Option<usize>,
    pub model_params: ModelParams,
    /// Model to use when the request carries no override.
    pub default_model: Option<String>,
    /// Typical execution time in seconds, advertised to callers.
    pub estimated_time: Option<f64>,
    pub supports_streaming: bool,
    pub active: bool,
}

impl FunctionDescriptor {
    /// A streaming-capable, active descriptor with a structural template.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            system_prompt: String::new(),
            template: PromptTemplate::Structural,
            input_schema: InputSchema::new(),
            max_input_length: None,
            model_params: ModelParams::new(),
            default_model: None,
            estimated_time: None,
            supports_streaming: true,
            active: true,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn template(mut self, template: PromptTemplate) -> Self {
        self.template = template;
        self
    }

    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.input_schema = self.input_schema.field(spec);
        self
    }

    pub fn input_schema(mut self, schema: InputSchema) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn max_input_length(mut self, max: usize) -> Self {
        self.max_input_length = Some(max);
        self
    }

    pub fn model_params(mut self, params: ModelParams) -> Self {
        self.model_params = params;
        self
    }

    pub fn default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn estimated_time(mut self, seconds: f64) -> Self {
        self.estimated_time = Some(seconds);
        self
    }

    pub fn supports_streaming(mut self, supported: bool) -> Self {
        self.supports_streaming = supported;
        self
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    /// Render the backend user prompt for already validated input.
    pub fn render_prompt(&self, input: &InputFields) -> String {
        self.template.render(input)
    }

    /// Public listing view of this descriptor.
    pub fn info(&self) -> FunctionInfo {
        FunctionInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.to_json_schema(),
            max_input_length: self.max_input_length,
            estimated_time: self.estimated_time,
            supports_streaming: self.supports_streaming,
        }
    }
}

/// Serialisable description of a function, as returned by listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_input_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_time: Option<f64>,
    pub supports_streaming: bool,
}

fn default_true() -> bool {
    true
}

/// Data-only function definition, as read from configuration.
///
/// ```toml
/// [[functions]]
/// id = "polish"
/// name = "Polish"
/// system_prompt = "You are a careful copy editor."
/// template = "Polish the following text:\n\n{text}"
/// max_input_length = 4000
///
/// [[functions.fields]]
/// name = "text"
/// type = "string"
/// required = true
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub system_prompt: String,
    /// `{field}` pattern; the structural rendering is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_input_length: Option<usize>,
    #[serde(default, skip_serializing_if = "ModelParams::is_empty")]
    pub params: ModelParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time: Option<f64>,
    #[serde(default = "default_true")]
    pub supports_streaming: bool,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl From<FunctionDefinition> for FunctionDescriptor {
    fn from(def: FunctionDefinition) -> Self {
        let schema = def
            .fields
            .into_iter()
            .fold(InputSchema::new(), InputSchema::field);
        FunctionDescriptor {
            id: def.id,
            name: def.name,
            description: def.description,
            system_prompt: def.system_prompt,
            template: def
                .template
                .map(PromptTemplate::Pattern)
                .unwrap_or_default(),
            input_schema: schema,
            max_input_length: def.max_input_length,
            model_params: def.params,
            default_model: def.model,
            estimated_time: def.estimated_time,
            supports_streaming: def.supports_streaming,
            active: def.active,
        }
    }
}
