//! Built-in tool implementations for Ferrule.
//!
//! Tools give the agent the ability to interact with its workspace:
//! list directories, read and write files, and run allowlisted commands.
//! Every file path is confined to the workspace root.

pub mod list_directory;
pub mod read_file;
pub mod run_command;
pub mod workspace;
pub mod write_file;

use std::time::Duration;

use ferrule_config::ToolsConfig;
use ferrule_core::tool::ToolRegistry;

pub use list_directory::ListDirectoryTool;
pub use read_file::ReadFileTool;
pub use run_command::RunCommandTool;
pub use workspace::{PathValidationError, Workspace};
pub use write_file::WriteFileTool;

/// Create the tool registry with all built-in tools.
///
/// The workspace root comes from `tools.workspace_root`, defaulting to the
/// current directory.
pub fn default_registry(config: &ToolsConfig) -> Result<ToolRegistry, PathValidationError> {
    let workspace = match &config.workspace_root {
        Some(root) => Workspace::new(root)?,
        None => Workspace::current()?,
    };
    Ok(registry_for(workspace, config))
}

/// Create the built-in registry over an explicit workspace.
pub fn registry_for(workspace: Workspace, config: &ToolsConfig) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(ListDirectoryTool::new(workspace.clone())));
    registry.register(Box::new(ReadFileTool::new(workspace.clone())));
    registry.register(Box::new(WriteFileTool::new(workspace.clone())));
    registry.register(Box::new(RunCommandTool::new(
        workspace,
        config.allowed_commands.clone(),
        Duration::from_secs(config.command_timeout_secs),
    )));
    registry
}
