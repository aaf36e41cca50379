//! `ferrule tools`: list the agent's capability table.

use ferrule_config::AppConfig;
use ferrule_core::tool::ToolDefinition;
use serde_json::Value;

pub async fn run(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let registry = ferrule_tools::default_registry(&config.tools)?;

    println!("Available tools ({})", registry.len());
    println!();
    for definition in registry.definitions() {
        println!("{}", describe(&definition));
    }

    if config.tools.allowed_commands.is_empty() {
        println!("run_command allowlist: (none, every command is allowed)");
    } else {
        println!(
            "run_command allowlist: {}",
            config.tools.allowed_commands.join(", ")
        );
    }
    Ok(())
}

fn describe(definition: &ToolDefinition) -> String {
    let params: Vec<&str> = definition
        .parameters
        .get("properties")
        .and_then(Value::as_object)
        .map(|p| p.keys().map(String::as_str).collect())
        .unwrap_or_default();

    format!(
        "  {:<16} {}\n  {:<16} parameters: {}\n",
        definition.name,
        definition.description,
        "",
        if params.is_empty() {
            "none".to_string()
        } else {
            params.join(", ")
        }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn describe_lists_parameters() {
        let definition = ToolDefinition {
            name: "read_file".into(),
            description: "Read a file".into(),
            parameters: json!({"type": "object", "properties": {"path": {"type": "string"}}}),
        };
        let text = describe(&definition);
        assert!(text.contains("read_file"));
        assert!(text.contains("parameters: path"));
    }

    #[test]
    fn describe_without_parameters() {
        let definition = ToolDefinition {
            name: "noop".into(),
            description: "Nothing".into(),
            parameters: json!({"type": "object"}),
        };
        assert!(describe(&definition).contains("parameters: none"));
    }
}
