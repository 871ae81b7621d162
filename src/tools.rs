//! Tool definitions and JSON Schema emission.
//!
//! A tool exposes a unique name, a description, an ordered parameter schema,
//! and an execution procedure. The schema is emitted as JSON Schema for
//! inclusion in prompts and for remote-API compatibility.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{json, Map, Value};

/// Boxed error from inside a tool. Never fatal to the chat loop — the
/// pipeline turns it into a tool-role message.
pub type ToolError = Box<dyn std::error::Error + Send + Sync>;

/// Value kind of a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ParameterType {
    fn as_str(&self) -> &'static str {
        match self {
            ParameterType::String => "string",
            ParameterType::Number => "number",
            ParameterType::Integer => "integer",
            ParameterType::Boolean => "boolean",
            ParameterType::Array => "array",
            ParameterType::Object => "object",
        }
    }
}

/// One named parameter in a tool's ordered schema.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub param_type: ParameterType,
    pub description: String,
    pub required: bool,
    /// Element schema; mandatory for arrays.
    pub items: Option<Box<Parameter>>,
    /// Child parameters for object types.
    pub properties: Vec<Parameter>,
    /// Allowed values for constrained string parameters.
    pub enum_values: Option<Vec<String>>,
    pub min_items: Option<u64>,
    pub max_items: Option<u64>,
    pub unique_items: bool,
    pub additional_properties: Option<bool>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, param_type: ParameterType, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: description.into(),
            required: true,
            items: None,
            properties: Vec::new(),
            enum_values: None,
            min_items: None,
            max_items: None,
            unique_items: false,
            additional_properties: None,
        }
    }

    pub fn string(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, ParameterType::String, description)
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_items(mut self, items: Parameter) -> Self {
        self.items = Some(Box::new(items));
        self
    }

    pub fn with_properties(mut self, properties: Vec<Parameter>) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_enum(mut self, values: Vec<String>) -> Self {
        self.enum_values = Some(values);
        self
    }

    /// Emit this parameter as a JSON Schema fragment.
    ///
    /// # Panics
    ///
    /// Panics if an array parameter has no `items` — that is a programming
    /// error in the tool definition, surfaced at schema-construction time.
    pub fn json_schema(&self) -> Value {
        let mut schema = Map::new();
        schema.insert("type".into(), json!(self.param_type.as_str()));
        if !self.description.is_empty() {
            schema.insert("description".into(), json!(self.description));
        }

        match self.param_type {
            ParameterType::Array => {
                let items = self
                    .items
                    .as_ref()
                    .unwrap_or_else(|| panic!("array parameter '{}' must define items", self.name));
                schema.insert("items".into(), items.json_schema());
                if let Some(n) = self.min_items {
                    schema.insert("minItems".into(), json!(n));
                }
                if let Some(n) = self.max_items {
                    schema.insert("maxItems".into(), json!(n));
                }
                if self.unique_items {
                    schema.insert("uniqueItems".into(), json!(true));
                }
            }
            ParameterType::Object => {
                if !self.properties.is_empty() {
                    let mut props = Map::new();
                    let mut required = Vec::new();
                    for child in &self.properties {
                        props.insert(child.name.clone(), child.json_schema());
                        if child.required {
                            required.push(json!(child.name));
                        }
                    }
                    schema.insert("properties".into(), Value::Object(props));
                    schema.insert("required".into(), Value::Array(required));
                }
                if let Some(allow) = self.additional_properties {
                    schema.insert("additionalProperties".into(), json!(allow));
                }
            }
            _ => {}
        }

        if let Some(values) = &self.enum_values {
            schema.insert("enum".into(), json!(values));
        }

        Value::Object(schema)
    }
}

/// A callable tool exposed to the model.
pub trait Tool: Send + Sync {
    /// Unique identifier used for matching parsed tool calls.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Ordered parameter schema.
    fn parameters(&self) -> Vec<Parameter>;

    /// Run the tool with decoded arguments and an opaque caller context.
    /// A structured return value is stringified by the pipeline.
    fn execute(&self, args: Map<String, Value>, extra: &Value) -> Result<Value, ToolError>;
}

impl fmt::Debug for dyn Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool").field("name", &self.name()).finish()
    }
}

/// Emit the full JSON Schema for a tool's parameters: an object schema with
/// `properties` in declaration order and a `required` list.
pub fn tool_schema(tool: &dyn Tool) -> Value {
    let params = tool.parameters();
    let mut props = Map::new();
    let mut required = Vec::new();
    for p in &params {
        props.insert(p.name.clone(), p.json_schema());
        if p.required {
            required.push(json!(p.name));
        }
    }
    json!({
        "type": "object",
        "properties": props,
        "required": required,
    })
}

/// Function-style descriptor for a tool, as remote chat APIs expect it.
pub fn tool_descriptor(tool: &dyn Tool) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name(),
            "description": tool.description(),
            "parameters": tool_schema(tool),
        }
    })
}

/// Look up a tool by name.
pub fn find_tool<'a>(tools: &'a [Arc<dyn Tool>], name: &str) -> Option<&'a Arc<dyn Tool>> {
    tools.iter().find(|t| t.name() == name)
}

/// A tool built from closures; convenient for tests and simple callers.
pub struct FnTool {
    name: String,
    description: String,
    parameters: Vec<Parameter>,
    handler: Box<dyn Fn(Map<String, Value>, &Value) -> Result<Value, ToolError> + Send + Sync>,
}

impl FnTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Vec<Parameter>,
        handler: impl Fn(Map<String, Value>, &Value) -> Result<Value, ToolError> + Send + Sync + 'static,
    ) -> Arc<dyn Tool> {
        Arc::new(Self {
            name: name.into(),
            description: description.into(),
            parameters,
            handler: Box::new(handler),
        })
    }
}

impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Vec<Parameter> {
        self.parameters.clone()
    }

    fn execute(&self, args: Map<String, Value>, extra: &Value) -> Result<Value, ToolError> {
        (self.handler)(args, extra)
    }
}

/// Deterministic map form of the schema, handy for prompt construction.
pub fn schema_summary(tools: &[Arc<dyn Tool>]) -> BTreeMap<String, Value> {
    tools
        .iter()
        .map(|t| (t.name().to_string(), tool_descriptor(t.as_ref())))
        .collect()
}
