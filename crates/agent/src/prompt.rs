//! System prompt construction.
//!
//! The prompt has three sections: a short role statement (or the configured
//! override), the labeled-block reply protocol the parser understands, and the
//! capability table rendered from the tool registry.

use ferrule_core::tool::{ToolDefinition, ToolRegistry};
use serde_json::Value;

const DEFAULT_ROLE: &str = "You are Ferrule, an assistant that works inside the user's project \
workspace. Use the available tools to inspect and change files, then answer the user directly.";

const PROTOCOL: &str = "\
## Tool protocol

To use a tool, reply with one or more blocks in exactly this form:

THINKING: <your reasoning, optional>
ACTION: <tool name>
PARAMETERS: <a JSON object with the tool's parameters>
MESSAGE: <a short note for the user, optional>

Rules:
- Each label starts its own line.
- PARAMETERS must be a single JSON object; use {} when the tool takes none.
- Several blocks in one reply run in order.
- After tools run you receive a \"Tool results:\" message. Read it before acting again.
- When you have the answer, reply in plain text with no ACTION line.";

/// Build the system prompt for a registry of tools.
pub fn build_system_prompt(tools: &ToolRegistry, role_override: Option<&str>) -> String {
    let role = role_override
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_ROLE);

    let mut prompt = format!("{role}\n\n{PROTOCOL}\n\n## Available tools\n");
    let definitions = tools.definitions();
    if definitions.is_empty() {
        prompt.push_str("\n(no tools are available; answer directly)\n");
    }
    for definition in &definitions {
        prompt.push_str(&render_tool(definition));
    }
    prompt
}

fn render_tool(definition: &ToolDefinition) -> String {
    let mut out = format!("\n### {}\n{}\n", definition.name, definition.description);

    let required: Vec<&str> = definition
        .parameters
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    if let Some(properties) = definition.parameters.get("properties").and_then(Value::as_object) {
        for (name, schema) in properties {
            let kind = schema.get("type").and_then(Value::as_str).unwrap_or("any");
            let description = schema.get("description").and_then(Value::as_str).unwrap_or("");
            let flag = if required.contains(&name.as_str()) {
                "required"
            } else {
                "optional"
            };
            out.push_str(&format!("- `{name}` ({kind}, {flag}): {description}\n"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ferrule_core::error::ToolError;
    use ferrule_core::tool::{Tool, ToolResult};
    use serde_json::{Map, json};

    struct PathTool;

    #[async_trait]
    impl Tool for PathTool {
        fn name(&self) -> &str {
            "read_file"
        }
        fn description(&self) -> &str {
            "Read a file"
        }
        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "File to read"},
                    "limit": {"type": "integer", "description": "Max bytes"}
                },
                "required": ["path"]
            })
        }
        async fn execute(&self, _parameters: &Map<String, Value>) -> Result<ToolResult, ToolError> {
            Ok(ToolResult::ok())
        }
    }

    #[test]
    fn prompt_lists_protocol_and_tools() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(PathTool));
        let prompt = build_system_prompt(&registry, None);

        assert!(prompt.starts_with(DEFAULT_ROLE));
        for label in ["THINKING:", "ACTION:", "PARAMETERS:", "MESSAGE:"] {
            assert!(prompt.contains(label), "missing {label}");
        }
        assert!(prompt.contains("### read_file"));
        assert!(prompt.contains("- `path` (string, required): File to read"));
        assert!(prompt.contains("- `limit` (integer, optional): Max bytes"));
    }

    #[test]
    fn override_replaces_role_only() {
        let prompt = build_system_prompt(&ToolRegistry::new(), Some("You are a test bot."));
        assert!(prompt.starts_with("You are a test bot."));
        assert!(prompt.contains("## Tool protocol"));
        assert!(prompt.contains("no tools are available"));
    }

    #[test]
    fn blank_override_uses_default() {
        let prompt = build_system_prompt(&ToolRegistry::new(), Some("   "));
        assert!(prompt.starts_with(DEFAULT_ROLE));
    }
}
