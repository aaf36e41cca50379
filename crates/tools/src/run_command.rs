//! Run command tool: execute system commands in the workspace.
//!
//! Supports command allowlisting, workspace scoping, and timeout.

use std::time::Duration;

use async_trait::async_trait;
use ferrule_core::error::ToolError;
use ferrule_core::tool::{Tool, ToolResult};
use serde_json::{Map, Value};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::workspace::Workspace;

/// Execute shell commands with safety constraints.
pub struct RunCommandTool {
    workspace: Workspace,
    /// If non-empty, only these base commands are allowed.
    allowed_commands: Vec<String>,
    timeout: Duration,
}

impl RunCommandTool {
    pub fn new(workspace: Workspace, allowed_commands: Vec<String>, timeout: Duration) -> Self {
        Self {
            workspace,
            allowed_commands,
            timeout,
        }
    }

    fn base_command(command: &str) -> &str {
        command.split_whitespace().next().unwrap_or("")
    }

    fn is_command_allowed(&self, command: &str) -> bool {
        if self.allowed_commands.is_empty() {
            return true;
        }

        // No chaining, substitution or redirection under an allowlist
        if command.contains([';', '&', '|', '`', '$', '>', '<', '\n']) {
            return false;
        }

        let base_cmd = Self::base_command(command);
        self.allowed_commands.iter().any(|a| a == base_cmd)
    }
}

#[async_trait]
impl Tool for RunCommandTool {
    fn name(&self) -> &str {
        "run_command"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the workspace root and return its exit code, stdout and stderr."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, parameters: &Map<String, Value>) -> Result<ToolResult, ToolError> {
        let command = parameters
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'command' argument".into()))?;

        if !self.is_command_allowed(command) {
            return Err(ToolError::PermissionDenied {
                tool_name: "run_command".into(),
                reason: format!("Command '{}' not in allowlist", Self::base_command(command)),
            });
        }

        debug!(command = %command, "Executing command");

        let mut process = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        // Dropping the future (timeout or job cancellation) kills the child
        process.current_dir(self.workspace.root()).kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, process.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ToolError::ExecutionFailed {
                    tool_name: "run_command".into(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                warn!(command = %command, timeout_secs = self.timeout.as_secs(), "Command timed out");
                return Ok(ToolResult::failure(format!(
                    "Command timed out after {}s",
                    self.timeout.as_secs()
                ))
                .with("command", command));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        let code = output.status.code().unwrap_or(-1);

        let result = if output.status.success() {
            ToolResult::ok()
        } else {
            warn!(command = %command, exit_code = code, "Command failed");
            ToolResult::failure(format!("Command exited with code {code}"))
        };

        Ok(result
            .with("command", command)
            .with("exit_code", code)
            .with("stdout", stdout)
            .with("stderr", stderr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn tool(allowed: &[&str]) -> (tempfile::TempDir, RunCommandTool) {
        let dir = tempfile::tempdir().unwrap();
        let tool = RunCommandTool::new(
            Workspace::new(dir.path()).unwrap(),
            allowed.iter().map(|s| s.to_string()).collect(),
            Duration::from_secs(10),
        );
        (dir, tool)
    }

    #[test]
    fn allowlist_check() {
        let (_dir, tool) = tool(&["ls", "cat", "git"]);
        assert!(tool.is_command_allowed("ls -la"));
        assert!(tool.is_command_allowed("cat file.txt"));
        assert!(tool.is_command_allowed("git status"));
        assert!(!tool.is_command_allowed("rm -rf /"));
        assert!(!tool.is_command_allowed("ls; rm -rf /"));
        assert!(!tool.is_command_allowed("cat a | sh"));
    }

    #[test]
    fn empty_allowlist_allows_all() {
        let (_dir, tool) = tool(&[]);
        assert!(tool.is_command_allowed("anything goes"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn execute_echo() {
        let (_dir, tool) = tool(&[]);
        let result = tool
            .execute(&params(json!({"command": "echo hello"})))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.get("stdout"), Some(&json!("hello")));
        assert_eq!(result.get("exit_code"), Some(&json!(0)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_in_workspace_root() {
        let (dir, tool) = tool(&[]);
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let result = tool.execute(&params(json!({"command": "ls"}))).await.unwrap();
        assert!(result.get("stdout").unwrap().as_str().unwrap().contains("marker.txt"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_failed_result() {
        let (_dir, tool) = tool(&[]);
        let result = tool.execute(&params(json!({"command": "exit 3"}))).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.get("exit_code"), Some(&json!(3)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_is_failed_result() {
        let dir = tempfile::tempdir().unwrap();
        let tool = RunCommandTool::new(
            Workspace::new(dir.path()).unwrap(),
            vec![],
            Duration::from_millis(50),
        );
        let result = tool.execute(&params(json!({"command": "sleep 5"}))).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn blocked_command() {
        let (_dir, tool) = tool(&["ls"]);
        let result = tool.execute(&params(json!({"command": "rm -rf /"}))).await;
        assert!(matches!(result, Err(ToolError::PermissionDenied { .. })));
    }
}
