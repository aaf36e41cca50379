//! Builds the fallback chain from configuration.

use std::sync::Arc;
use std::time::Duration;

use ferrule_config::AppConfig;
use ferrule_core::provider::Provider;
use tracing::warn;

use crate::fallback::{DEFAULT_PROVIDER_TIMEOUT, FallbackChain};
use crate::openai_compat::OpenAiCompatProvider;

/// Build the model client from configuration.
///
/// `[[providers]]` entries are registered in file order, which is the
/// fallback order. The default provider is added when it has no entry of
/// its own, and is made active.
pub fn build_from_config(config: &AppConfig) -> FallbackChain {
    let mut chain = FallbackChain::new(&config.default_model)
        .with_temperature(config.default_temperature)
        .with_max_tokens(config.default_max_tokens)
        .with_fallback(config.agent.fallback_enabled);

    for provider_config in &config.providers {
        let api_key = provider_config
            .api_key
            .clone()
            .or_else(|| config.api_key.clone())
            .unwrap_or_default();

        let base_url = provider_config
            .api_url
            .clone()
            .unwrap_or_else(|| default_base_url(&provider_config.name));

        let mut provider = OpenAiCompatProvider::new(&provider_config.name, base_url, api_key);
        if let Some(model) = &provider_config.model {
            provider = provider.with_model(model);
        }

        chain = chain.add(
            Arc::new(provider) as Arc<dyn Provider>,
            Duration::from_secs(provider_config.timeout_secs),
        );
    }

    // Ensure the default provider exists (even if not explicitly configured)
    if !chain.providers().contains(&config.default_provider.as_str()) {
        let provider = OpenAiCompatProvider::new(
            &config.default_provider,
            default_base_url(&config.default_provider),
            config.api_key.clone().unwrap_or_default(),
        );
        chain = chain.add(Arc::new(provider), DEFAULT_PROVIDER_TIMEOUT);
    }

    if let Err(e) = chain.set_active(&config.default_provider) {
        warn!(error = %e, "Could not activate default provider");
    }

    chain
}

/// Get the default base URL for well-known providers.
pub fn default_base_url(provider_name: &str) -> String {
    match provider_name {
        "openrouter" => "https://openrouter.ai/api/v1".into(),
        "openai" => "https://api.openai.com/v1".into(),
        "ollama" => "http://localhost:11434/v1".into(),
        "deepseek" => "https://api.deepseek.com/v1".into(),
        "groq" => "https://api.groq.com/openai/v1".into(),
        "together" => "https://api.together.xyz/v1".into(),
        "fireworks" => "https://api.fireworks.ai/inference/v1".into(),
        "vllm" => "http://localhost:8000/v1".into(),
        "llamacpp" | "llama.cpp" => "http://localhost:8080/v1".into(),
        _ => format!("https://{provider_name}.api.example.com/v1"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrule_config::ProviderConfig;
    use ferrule_core::ModelClient;

    fn provider(name: &str) -> ProviderConfig {
        ProviderConfig {
            name: name.into(),
            api_key: None,
            api_url: None,
            model: None,
            timeout_secs: 30,
        }
    }

    #[test]
    fn default_base_urls() {
        assert!(default_base_url("openrouter").contains("openrouter.ai"));
        assert!(default_base_url("openai").contains("api.openai.com"));
        assert!(default_base_url("ollama").contains("localhost:11434"));
    }

    #[test]
    fn build_from_default_config() {
        let config = AppConfig::default();
        let chain = build_from_config(&config);
        assert_eq!(chain.providers(), vec!["openrouter"]);
        assert_eq!(chain.active_provider(), "openrouter");
    }

    #[test]
    fn configured_order_is_fallback_order() {
        let config = AppConfig {
            default_provider: "ollama".into(),
            providers: vec![provider("openrouter"), provider("ollama"), provider("groq")],
            ..AppConfig::default()
        };
        let chain = build_from_config(&config);
        assert_eq!(chain.providers(), vec!["openrouter", "ollama", "groq"]);
        assert_eq!(chain.active_provider(), "ollama");
    }

    #[test]
    fn missing_default_is_appended() {
        let config = AppConfig {
            default_provider: "openai".into(),
            providers: vec![provider("ollama")],
            ..AppConfig::default()
        };
        let chain = build_from_config(&config);
        assert_eq!(chain.providers(), vec!["ollama", "openai"]);
        assert_eq!(chain.active_provider(), "openai");
    }
}
