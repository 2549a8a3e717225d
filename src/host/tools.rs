//! Tools the model may call, grouped into toolkits.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};

use crate::host::model::BoxFuture;
use crate::protocol::types::{SingleToolInfo, ToolInfo, ToolkitInfo};
use crate::{AppError, Result};

/// A callable tool.
pub trait Tool: Send + Sync {
    /// Tool name, unique within its toolkit.
    fn name(&self) -> &str;

    /// Description shown to the model.
    fn description(&self) -> &str;

    /// JSON schema of the arguments.
    fn args_schema(&self) -> Value;

    /// Run the tool.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Tool`] (or any other error) on failure; the
    /// orchestrator feeds the message back to the model.
    fn execute(&self, args: Value) -> BoxFuture<'_, Result<Value>>;
}

/// Tool backed by a synchronous function.
pub struct FnTool {
    name: &'static str,
    description: &'static str,
    schema: fn() -> Value,
    handler: fn(Value) -> Result<Value>,
}

impl FnTool {
    /// Build a tool from its parts.
    #[must_use]
    pub const fn new(
        name: &'static str,
        description: &'static str,
        schema: fn() -> Value,
        handler: fn(Value) -> Result<Value>,
    ) -> Self {
        Self {
            name,
            description,
            schema,
            handler,
        }
    }
}

impl Tool for FnTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        self.description
    }

    fn args_schema(&self) -> Value {
        (self.schema)()
    }

    fn execute(&self, args: Value) -> BoxFuture<'_, Result<Value>> {
        let result = (self.handler)(args);
        Box::pin(async move { result })
    }
}

/// Named group of tools.
#[derive(Clone)]
pub struct Toolkit {
    name: String,
    description: String,
    tools: Vec<Arc<dyn Tool>>,
}

impl std::fmt::Debug for Toolkit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tools: Vec<_> = self.tools.iter().map(|t| t.name().to_owned()).collect();
        f.debug_struct("Toolkit")
            .field("name", &self.name)
            .field("tools", &tools)
            .finish()
    }
}

impl Toolkit {
    /// Empty toolkit.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            tools: Vec::new(),
        }
    }

    /// Add a tool.
    #[must_use]
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// Toolkit name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn find(&self, tool: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == tool).cloned()
    }

    fn info(&self) -> ToolkitInfo {
        ToolkitInfo {
            name: self.name.clone(),
            description: self.description.clone(),
            tools: self.tools.iter().map(|t| tool_info(t.as_ref())).collect(),
        }
    }
}

fn tool_info(tool: &dyn Tool) -> ToolInfo {
    ToolInfo {
        name: tool.name().to_owned(),
        description: tool.description().to_owned(),
        args: tool.args_schema(),
    }
}

/// Every toolkit the host knows, in registration order.
#[derive(Debug, Default, Clone)]
pub struct ToolRegistry {
    toolkits: Vec<Toolkit>,
}

impl ToolRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in `utility` and `text` toolkits.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(builtin_utility());
        registry.register(builtin_text());
        registry
    }

    /// Add `toolkit`, replacing one with the same name.
    pub fn register(&mut self, toolkit: Toolkit) {
        self.toolkits.retain(|t| t.name != toolkit.name);
        self.toolkits.push(toolkit);
    }

    /// Registered toolkit names.
    #[must_use]
    pub fn toolkit_names(&self) -> Vec<&str> {
        self.toolkits.iter().map(Toolkit::name).collect()
    }

    /// Number of toolkits.
    #[must_use]
    pub fn len(&self) -> usize {
        self.toolkits.len()
    }

    /// Whether no toolkit is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.toolkits.is_empty()
    }

    /// Find `tool`, in `toolkit` when given, otherwise in any toolkit.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] when no match exists.
    pub fn find(&self, tool: &str, toolkit: Option<&str>) -> Result<(String, Arc<dyn Tool>)> {
        self.toolkits
            .iter()
            .filter(|t| toolkit.is_none_or(|name| t.name == name))
            .find_map(|t| t.find(tool).map(|found| (t.name.clone(), found)))
            .ok_or_else(|| match toolkit {
                Some(kit) => AppError::NotFound(format!("tool {tool} in toolkit {kit}")),
                None => AppError::NotFound(format!("tool {tool}")),
            })
    }

    /// Find `tool` among the named toolkits.
    #[must_use]
    pub fn find_in(&self, tool: &str, toolkits: &[String]) -> Option<Arc<dyn Tool>> {
        self.toolkits
            .iter()
            .filter(|t| toolkits.contains(&t.name))
            .find_map(|t| t.find(tool))
    }

    /// `listToolkits` payload.
    #[must_use]
    pub fn toolkit_infos(&self) -> Vec<ToolkitInfo> {
        self.toolkits.iter().map(Toolkit::info).collect()
    }

    /// `listTools` payload.
    #[must_use]
    pub fn tool_infos(&self) -> Vec<SingleToolInfo> {
        self.toolkits
            .iter()
            .flat_map(|kit| {
                kit.tools.iter().map(move |t| SingleToolInfo {
                    name: t.name().to_owned(),
                    description: t.description().to_owned(),
                    args: t.args_schema(),
                    toolkit_name: kit.name.clone(),
                })
            })
            .collect()
    }

    /// Tools visible to an agent with access to `toolkits`.
    #[must_use]
    pub fn tools_for(&self, toolkits: &[String]) -> Vec<ToolInfo> {
        self.toolkits
            .iter()
            .filter(|t| toolkits.contains(&t.name))
            .flat_map(|t| t.tools.iter().map(|tool| tool_info(tool.as_ref())))
            .collect()
    }
}

/// Decode arguments the model sent as a JSON-encoded string.
#[must_use]
pub fn normalize_arguments(args: Value) -> Value {
    match args {
        Value::String(raw) => match serde_json::from_str::<Value>(&raw) {
            Ok(parsed @ Value::Object(_)) => parsed,
            _ => Value::String(raw),
        },
        Value::Null => Value::Object(serde_json::Map::new()),
        other => other,
    }
}

// ── Built-ins ─────────────────────────────────────────────────────────────────

fn builtin_utility() -> Toolkit {
    Toolkit::new("utility", "General-purpose helpers")
        .with_tool(Arc::new(FnTool::new(
            "echo",
            "Return the given text unchanged",
            || json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]}),
            |args| Ok(Value::String(str_arg(&args, "text")?.to_owned())),
        )))
        .with_tool(Arc::new(FnTool::new(
            "add",
            "Add two numbers",
            || {
                json!({
                    "type": "object",
                    "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
                    "required": ["a", "b"]
                })
            },
            |args| Ok(number(num_arg(&args, "a")? + num_arg(&args, "b")?)),
        )))
        .with_tool(Arc::new(FnTool::new(
            "current_time",
            "Current UTC time in RFC 3339 format",
            || json!({"type": "object", "properties": {}}),
            |_| Ok(Value::String(Utc::now().to_rfc3339())),
        )))
}

fn builtin_text() -> Toolkit {
    Toolkit::new("text", "String utilities")
        .with_tool(Arc::new(FnTool::new(
            "word_count",
            "Count whitespace-separated words",
            || json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]}),
            |args| Ok(json!(str_arg(&args, "text")?.split_whitespace().count())),
        )))
        .with_tool(Arc::new(FnTool::new(
            "uppercase",
            "Convert text to upper case",
            || json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]}),
            |args| Ok(Value::String(str_arg(&args, "text")?.to_uppercase())),
        )))
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Tool(format!("missing string argument: {key}")))
}

/// Whole results are reported without a fractional part.
#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        json!(value as i64)
    } else {
        json!(value)
    }
}

fn num_arg(args: &Value, key: &str) -> Result<f64> {
    args.get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| AppError::Tool(format!("missing numeric argument: {key}")))
}
