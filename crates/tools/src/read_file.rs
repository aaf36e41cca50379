//! Read file tool: read file contents inside the workspace.

use async_trait::async_trait;
use ferrule_core::error::ToolError;
use ferrule_core::tool::{Tool, ToolResult};
use serde_json::{Map, Value};

use crate::workspace::Workspace;

/// Files larger than this are truncated in the result.
const MAX_READ_BYTES: usize = 256 * 1024;

pub struct ReadFileTool {
    workspace: Workspace,
}

impl ReadFileTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a text file in the workspace."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file path to read, relative to the workspace root"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, parameters: &Map<String, Value>) -> Result<ToolResult, ToolError> {
        let path = parameters
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'path' argument".into()))?;

        let resolved = self
            .workspace
            .resolve(path)
            .map_err(|e| ToolError::PermissionDenied {
                tool_name: "read_file".into(),
                reason: e.to_string(),
            })?;

        let bytes = match tokio::fs::read(&resolved).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return Ok(ToolResult::failure(format!("Failed to read file: {e}"))
                    .with("path", path));
            }
        };

        let size = bytes.len();
        let truncated = size > MAX_READ_BYTES;
        let content = String::from_utf8_lossy(&bytes[..size.min(MAX_READ_BYTES)]).into_owned();

        Ok(ToolResult::ok()
            .with("path", self.workspace.relative(&resolved))
            .with("content", content)
            .with("size", size)
            .with("truncated", truncated))
    }
}
