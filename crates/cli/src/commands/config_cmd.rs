//! `ferrule config`: configuration management commands.

use ferrule_config::AppConfig;

fn config_path() -> std::path::PathBuf {
    AppConfig::config_dir().join("config.toml")
}

/// Print the effective configuration with secrets masked.
pub async fn show(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut redacted = config.clone();
    if redacted.api_key.is_some() {
        redacted.api_key = Some("***".into());
    }
    for provider in &mut redacted.providers {
        if provider.api_key.is_some() {
            provider.api_key = Some("***".into());
        }
    }

    println!("# {}", config_path().display());
    println!("{}", toml::to_string_pretty(&redacted)?);
    Ok(())
}

pub async fn path() -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", config_path().display());
    Ok(())
}

/// Write the default configuration unless a file already exists.
pub async fn init() -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path();
    if path.exists() {
        println!("Config already exists at {}", path.display());
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, AppConfig::default_toml()).await?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}
