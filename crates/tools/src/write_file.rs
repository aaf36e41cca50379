//! Write file tool: create or overwrite files inside the workspace.

use async_trait::async_trait;
use ferrule_core::error::ToolError;
use ferrule_core::tool::{Tool, ToolResult};
use serde_json::{Map, Value};

use crate::workspace::Workspace;

pub struct WriteFileTool {
    workspace: Workspace,
}

impl WriteFileTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file in the workspace. Creates the file (and parent directories) if needed, overwrites if it exists."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file path to write, relative to the workspace root"
                },
                "content": {
                    "type": "string",
                    "description": "The content to write"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, parameters: &Map<String, Value>) -> Result<ToolResult, ToolError> {
        let path = parameters
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'path' argument".into()))?;

        let content = parameters
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'content' argument".into()))?;

        let resolved = self
            .workspace
            .resolve(path)
            .map_err(|e| ToolError::PermissionDenied {
                tool_name: "write_file".into(),
                reason: e.to_string(),
            })?;

        // Ensure parent directory exists
        if let Some(parent) = resolved.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            return Ok(ToolResult::failure(format!("Failed to create directory: {e}"))
                .with("path", path));
        }

        let relative = self.workspace.relative(&resolved);
        match tokio::fs::write(&resolved, content).await {
            Ok(()) => Ok(ToolResult::ok()
                .with("path", relative.as_str())
                .with("bytes", content.len())
                .with(
                    "message",
                    format!("Wrote {} bytes to {relative}", content.len()),
                )),
            Err(e) => Ok(ToolResult::failure(format!("Failed to write file: {e}")).with("path", relative)),
        }
    }
}
