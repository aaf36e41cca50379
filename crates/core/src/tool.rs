//! Tool trait: the abstraction over agent capabilities.
//!
//! Tools are what give the agent the ability to act: list directories,
//! read/write files, run commands. The [`ToolRegistry`] is the capability
//! table the request loop dispatches into by action name.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::ToolError;

/// A tool description rendered into the system prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name (the `ACTION` identifier)
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: Value,
}

/// A structured instruction extracted from a model reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// The model's reasoning preceding the action, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,

    /// Name of the tool to execute
    pub action: String,

    /// Parsed parameters
    pub parameters: Map<String, Value>,

    /// Free text the model attached for the user, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// The parameter text exactly as the model wrote it
    #[serde(default)]
    pub raw_parameters: String,
}

impl ToolCall {
    /// Build a call directly (used by tests and programmatic callers).
    pub fn new(action: impl Into<String>, parameters: Map<String, Value>) -> Self {
        let raw_parameters = Value::Object(parameters.clone()).to_string();
        Self {
            thinking: None,
            action: action.into(),
            parameters,
            message: None,
            raw_parameters,
        }
    }

    /// Identity of this call for duplicate detection.
    ///
    /// Byte-for-byte on the literal parameter text: `{"a":1}` and `{ "a": 1 }`
    /// are different fingerprints.
    pub fn fingerprint(&self) -> String {
        format!("{}:{}", self.action, self.raw_parameters)
    }
}

/// The normalized result of a tool execution.
///
/// Serialized flat: `{"success": true, "path": "...", "files": [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the tool executed successfully
    pub success: bool,

    /// Domain fields (path, content, files, count, message, ...)
    #[serde(flatten)]
    pub data: Map<String, Value>,

    /// Error text for failed executions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    /// An empty successful result; add fields with [`ToolResult::with`].
    pub fn ok() -> Self {
        Self {
            success: true,
            data: Map::new(),
            error: None,
        }
    }

    /// A failed result carrying an error description.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Map::new(),
            error: Some(error.into()),
        }
    }

    /// Add a domain field.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Read a domain field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

/// The core Tool trait.
///
/// Each capability implements this trait and is registered in the
/// [`ToolRegistry`] under its `name()`.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique action name of this tool (e.g., "list_directory").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> Value;

    /// Execute the tool with the given parameters.
    async fn execute(&self, parameters: &Map<String, Value>) -> Result<ToolResult, ToolError>;

    /// Convert this tool into a ToolDefinition for the system prompt.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// The capability table: action identifier → typed handler.
///
/// Unknown actions are rejected at lookup time with [`ToolError::NotFound`];
/// [`ToolRegistry::execute`] turns every failure into a failed
/// [`ToolResult`] so the model can self-correct.
pub struct ToolRegistry {
    tools: BTreeMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Look up a tool by action name.
    pub fn lookup(&self, action: &str) -> Result<&dyn Tool, ToolError> {
        self.tools
            .get(action)
            .map(|t| t.as_ref())
            .ok_or_else(|| ToolError::NotFound(action.to_string()))
    }

    /// Whether an action is registered.
    pub fn contains(&self, action: &str) -> bool {
        self.tools.contains_key(action)
    }

    /// Get all tool definitions, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.to_definition()).collect()
    }

    /// Execute a tool call. Never fails: errors become failed results.
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        let tool = match self.lookup(&call.action) {
            Ok(tool) => tool,
            Err(e) => {
                warn!(action = %call.action, "Model requested an unknown tool");
                return ToolResult::failure(e.to_string());
            }
        };

        match AssertUnwindSafe(tool.execute(&call.parameters))
            .catch_unwind()
            .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(action = %call.action, error = %e, "Tool execution failed");
                ToolResult::failure(e.to_string())
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                warn!(action = %call.action, reason = %reason, "Tool panicked");
                ToolResult::failure(ToolError::Panicked(reason).to_string())
            }
        }
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// A simple test tool for unit tests.
    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echoes back the input"
        }
        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            })
        }
        async fn execute(&self, parameters: &Map<String, Value>) -> Result<ToolResult, ToolError> {
            let text = parameters
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| ToolError::InvalidArguments("Missing 'text' argument".into()))?;
            Ok(ToolResult::ok().with("message", text))
        }
    }

    struct PanickyTool;

    #[async_trait]
    impl Tool for PanickyTool {
        fn name(&self) -> &str {
            "panicky"
        }
        fn description(&self) -> &str {
            "Always panics"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _parameters: &Map<String, Value>) -> Result<ToolResult, ToolError> {
            panic!("boom");
        }
    }

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn registry_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool));
        assert!(registry.lookup("echo").is_ok());
        assert!(matches!(registry.lookup("nonexistent"), Err(ToolError::NotFound(_))));
        assert_eq!(registry.names(), vec!["echo"]);
    }

    #[test]
    fn registry_definitions() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool));
        let defs = registry.definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "echo");
    }

    #[tokio::test]
    async fn registry_execute_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool));

        let call = ToolCall::new("echo", params(json!({"text": "hello world"})));
        let result = registry.execute(&call).await;
        assert!(result.success);
        assert_eq!(result.get("message"), Some(&json!("hello world")));
    }

    #[tokio::test]
    async fn unknown_tool_is_structured_failure() {
        let registry = ToolRegistry::new();
        let call = ToolCall::new("nonexistent", Map::new());
        let result = registry.execute(&call).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Unknown tool: nonexistent"));
    }

    #[tokio::test]
    async fn tool_error_becomes_failed_result() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool));
        let result = registry.execute(&ToolCall::new("echo", Map::new())).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Missing 'text'"));
    }

    #[tokio::test]
    async fn panicking_tool_is_contained() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(PanickyTool));
        let result = registry.execute(&ToolCall::new("panicky", Map::new())).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("boom"));
    }

    #[test]
    fn tool_result_serializes_flat() {
        let result = ToolResult::ok().with("path", "/tmp/a.txt").with("count", 3);
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value, json!({"success": true, "path": "/tmp/a.txt", "count": 3}));

        let failed = serde_json::to_value(ToolResult::failure("nope")).unwrap();
        assert_eq!(failed, json!({"success": false, "error": "nope"}));
    }

    #[test]
    fn fingerprint_is_literal() {
        let mut a = ToolCall::new("read_file", params(json!({"path": "a"})));
        let mut b = a.clone();
        a.raw_parameters = r#"{"path":"a"}"#.into();
        b.raw_parameters = r#"{ "path": "a" }"#.into();
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert!(a.fingerprint().starts_with("read_file:"));
    }
}
