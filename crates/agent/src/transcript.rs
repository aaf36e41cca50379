//! The consolidated tool-results message.
//!
//! After each tool cycle the loop appends one user-role message holding
//! every result in execution order. The text is what the model reads; the
//! same results are kept structured under the `tool_results` metadata key
//! so the optimizer can pair and describe them without re-parsing.

use ferrule_core::message::{Message, Role};
use ferrule_core::tool::ToolResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata key marking a tool-results message.
pub const KIND_KEY: &str = "kind";
pub const TOOL_RESULTS_KIND: &str = "tool_results";
const RESULTS_KEY: &str = "tool_results";

/// One executed call and its result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub action: String,
    pub result: ToolResult,
}

impl ToolOutcome {
    pub fn new(action: impl Into<String>, result: ToolResult) -> Self {
        Self {
            action: action.into(),
            result,
        }
    }
}

/// Build the user-role message carrying all results of one cycle.
pub fn tool_results_message(outcomes: &[ToolOutcome]) -> Message {
    let mut content = String::from("Tool results:");
    for (i, outcome) in outcomes.iter().enumerate() {
        let rendered = serde_json::to_string(&outcome.result)
            .unwrap_or_else(|e| format!("{{\"success\":false,\"error\":\"{e}\"}}"));
        content.push_str(&format!("\n{}. {}: {}", i + 1, outcome.action, rendered));
    }

    let structured = serde_json::to_value(outcomes).unwrap_or(Value::Array(Vec::new()));
    Message::user(content)
        .with_metadata(KIND_KEY, Value::String(TOOL_RESULTS_KIND.into()))
        .with_metadata(RESULTS_KEY, structured)
}

/// Whether a message is a consolidated tool-results message.
pub fn is_tool_results(message: &Message) -> bool {
    message.role == Role::User
        && message.meta(KIND_KEY).and_then(Value::as_str) == Some(TOOL_RESULTS_KIND)
}

/// The structured results of a tool-results message (empty for other messages).
pub fn tool_outcomes(message: &Message) -> Vec<ToolOutcome> {
    if !is_tool_results(message) {
        return Vec::new();
    }
    message
        .meta(RESULTS_KEY)
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}
