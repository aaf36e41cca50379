//! List directory tool.

use async_trait::async_trait;
use ferrule_core::error::ToolError;
use ferrule_core::tool::{Tool, ToolResult};
use serde_json::{Map, Value};

use crate::workspace::Workspace;

/// List the entries of a workspace directory.
///
/// Directories are suffixed with `/`. Entries are sorted by name so repeated
/// listings of an unchanged directory produce identical results.
pub struct ListDirectoryTool {
    workspace: Workspace,
}

impl ListDirectoryTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for ListDirectoryTool {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "List files and subdirectories in a workspace directory."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list, relative to the workspace root (default \".\")"
                }
            }
        })
    }

    async fn execute(&self, parameters: &Map<String, Value>) -> Result<ToolResult, ToolError> {
        let path = match parameters.get("path") {
            None | Some(Value::Null) => ".",
            Some(Value::String(s)) if s.trim().is_empty() => ".",
            Some(Value::String(s)) => s.as_str(),
            Some(other) => {
                return Err(ToolError::InvalidArguments(format!(
                    "'path' must be a string, got {other}"
                )));
            }
        };

        let resolved = self
            .workspace
            .resolve(path)
            .map_err(|e| ToolError::PermissionDenied {
                tool_name: "list_directory".into(),
                reason: e.to_string(),
            })?;
        let directory = self.workspace.relative(&resolved);

        let mut reader = match tokio::fs::read_dir(&resolved).await {
            Ok(reader) => reader,
            Err(e) => {
                return Ok(ToolResult::failure(format!("Failed to list directory: {e}"))
                    .with("directory", directory));
            }
        };

        let mut files = Vec::new();
        loop {
            match reader.next_entry().await {
                Ok(Some(entry)) => {
                    let mut name = entry.file_name().to_string_lossy().into_owned();
                    if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                        name.push('/');
                    }
                    files.push(name);
                }
                Ok(None) => break,
                Err(e) => {
                    return Err(ToolError::ExecutionFailed {
                        tool_name: "list_directory".into(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        files.sort();

        let count = files.len();
        Ok(ToolResult::ok()
            .with("directory", directory)
            .with("count", count)
            .with("files", files))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn setup() -> (tempfile::TempDir, ListDirectoryTool) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        let tool = ListDirectoryTool::new(Workspace::new(dir.path()).unwrap());
        (dir, tool)
    }

    #[tokio::test]
    async fn lists_root_by_default() {
        let (_dir, tool) = setup();
        let result = tool.execute(&Map::new()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.get("directory"), Some(&json!(".")));
        assert_eq!(result.get("files"), Some(&json!(["a.txt", "b.txt", "src/"])));
        assert_eq!(result.get("count"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn lists_subdirectory() {
        let (dir, tool) = setup();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();
        let result = tool.execute(&params(json!({"path": "src"}))).await.unwrap();
        assert_eq!(result.get("directory"), Some(&json!("src")));
        assert_eq!(result.get("files"), Some(&json!(["main.rs"])));
    }

    #[tokio::test]
    async fn missing_directory_is_failed_result() {
        let (_dir, tool) = setup();
        let result = tool.execute(&params(json!({"path": "nope"}))).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Failed to list directory"));
    }

    #[tokio::test]
    async fn non_string_path_rejected() {
        let (_dir, tool) = setup();
        let result = tool.execute(&params(json!({"path": 7}))).await;
        assert!(matches!(result, Err(ToolError::InvalidArguments(_))));
    }

    #[tokio::test]
    async fn escape_blocked() {
        let (_dir, tool) = setup();
        let result = tool.execute(&params(json!({"path": ".."}))).await;
        assert!(matches!(result, Err(ToolError::PermissionDenied { .. })));
    }
}
