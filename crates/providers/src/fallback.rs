//! Provider fallback: ordered retry chain with per-provider timeouts.
//!
//! [`FallbackChain`] is the `ModelClient` the request loop talks to. It tries
//! the active (or per-request preferred) provider first; when that fails and
//! fallback is enabled, it tries the remaining providers in registration
//! order. Every attempt races the caller's cancellation token.
//!
//! Once a streamed attempt has forwarded a chunk to `on_chunk`, a later
//! failure of that attempt is returned as is and no other provider is tried.

use async_trait::async_trait;
use ferrule_core::error::ProviderError;
use ferrule_core::message::Message;
use ferrule_core::provider::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timeout applied by [`FallbackChain::add_default`].
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(120);

/// A model client over an ordered list of providers.
pub struct FallbackChain {
    chain: Vec<FallbackEntry>,
    active: RwLock<String>,
    fallback_enabled: bool,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
}

/// A single entry in the fallback chain.
struct FallbackEntry {
    provider: Arc<dyn Provider>,
    timeout: Duration,
}

impl FallbackChain {
    /// Create an empty chain. The first provider added becomes active.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            chain: Vec::new(),
            active: RwLock::new(String::new()),
            fallback_enabled: true,
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
        }
    }

    /// Add a provider to the chain with a custom timeout.
    pub fn add(mut self, provider: Arc<dyn Provider>, timeout: Duration) -> Self {
        if self.chain.is_empty() {
            self.active = RwLock::new(provider.name().to_string());
        }
        self.chain.push(FallbackEntry { provider, timeout });
        self
    }

    /// Add a provider with the default timeout (120s).
    pub fn add_default(self, provider: Arc<dyn Provider>) -> Self {
        self.add(provider, DEFAULT_PROVIDER_TIMEOUT)
    }

    /// Enable or disable trying other providers after a failure.
    pub fn with_fallback(mut self, enabled: bool) -> Self {
        self.fallback_enabled = enabled;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Switch the provider tried first.
    pub fn set_active(&self, name: &str) -> Result<(), ProviderError> {
        if !self.chain.iter().any(|e| e.provider.name() == name) {
            return Err(ProviderError::NotConfigured(format!(
                "Unknown provider '{name}'"
            )));
        }
        let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
        *active = name.to_string();
        info!(provider = %name, "Active provider switched");
        Ok(())
    }

    /// Registered provider names, in fallback order.
    pub fn providers(&self) -> Vec<&str> {
        self.chain.iter().map(|e| e.provider.name()).collect()
    }

    /// Number of providers in the chain.
    pub fn len(&self) -> usize {
        self.chain.len()
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Whether any provider in the chain reports healthy.
    pub async fn health_check(&self) -> bool {
        for entry in &self.chain {
            if let Ok(true) = entry.provider.health_check().await {
                return true;
            }
        }
        false
    }

    /// The attempt order for one call: first choice, then the rest.
    fn attempt_order(&self, first: &str) -> Vec<&FallbackEntry> {
        let mut order: Vec<&FallbackEntry> = self
            .chain
            .iter()
            .filter(|e| e.provider.name() == first)
            .collect();
        if self.fallback_enabled {
            order.extend(self.chain.iter().filter(|e| e.provider.name() != first));
        }
        order
    }

    async fn attempt(
        &self,
        entry: &FallbackEntry,
        messages: &[Message],
        options: &ChatOptions,
        forwarded: &AtomicBool,
    ) -> Result<ProviderResponse, ProviderError> {
        let model = entry
            .provider
            .default_model()
            .unwrap_or(self.model.as_str())
            .to_string();
        let request = ProviderRequest {
            model: model.clone(),
            messages: messages.to_vec(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: options.stream,
        };

        let work = async {
            if !options.stream {
                return entry.provider.complete(request).await;
            }

            let mut rx = entry.provider.stream(request).await?;
            let mut text = String::new();
            let mut usage = None;

            while let Some(chunk) = rx.recv().await {
                let chunk = chunk?;
                if let Some(delta) = chunk.content.as_deref()
                    && !delta.is_empty()
                {
                    text.push_str(delta);
                    if let Some(on_chunk) = &options.on_chunk {
                        forwarded.store(true, Ordering::Relaxed);
                        on_chunk(delta);
                    }
                }
                if chunk.usage.is_some() {
                    usage = chunk.usage;
                }
                if chunk.done {
                    break;
                }
            }

            Ok(ProviderResponse {
                message: Message::assistant(text).with_usage(usage),
                usage,
                model,
            })
        };

        // Dropping `work` on cancellation drops the stream receiver too.
        tokio::select! {
            biased;
            _ = options.cancel.cancelled() => Err(ProviderError::Cancelled),
            result = tokio::time::timeout(entry.timeout, work) => match result {
                Ok(response) => response,
                Err(_) => Err(ProviderError::Timeout(format!(
                    "Provider '{}' timed out after {}s",
                    entry.provider.name(),
                    entry.timeout.as_secs()
                ))),
            },
        }
    }
}

#[async_trait]
impl ModelClient for FallbackChain {
    fn active_provider(&self) -> String {
        self.active
            .read()
            .map(|a| a.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    async fn chat(
        &self,
        messages: &[Message],
        options: ChatOptions,
    ) -> Result<ChatReply, ProviderError> {
        let first = options
            .preferred_provider
            .clone()
            .filter(|p| self.chain.iter().any(|e| e.provider.name() == p))
            .unwrap_or_else(|| self.active_provider());

        let order = self.attempt_order(&first);
        if order.is_empty() {
            return Err(ProviderError::NotConfigured(
                "No providers in fallback chain".into(),
            ));
        }

        let total = order.len();
        let mut attempted = Vec::with_capacity(total);
        let mut last_error = None;

        for (i, entry) in order.into_iter().enumerate() {
            if options.cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }

            let provider_name = entry.provider.name().to_string();
            debug!(
                provider = %provider_name,
                attempt = i + 1,
                total,
                stream = options.stream,
                "Fallback: trying provider"
            );

            let forwarded = AtomicBool::new(false);
            match self.attempt(entry, messages, &options, &forwarded).await {
                Ok(response) => {
                    let fallback_used = provider_name != first;
                    if fallback_used {
                        info!(
                            provider = %provider_name,
                            original = %first,
                            "Fallback: provider answered after earlier failures"
                        );
                    }
                    return Ok(ChatReply {
                        message: response.message,
                        usage: response.usage,
                        provider: provider_name,
                        model: response.model,
                        fallback_used,
                        original_provider: fallback_used.then(|| first.clone()),
                    });
                }
                Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled),
                Err(e) if forwarded.load(Ordering::Relaxed) => {
                    warn!(
                        provider = %provider_name,
                        error = %e,
                        "Fallback: stream failed after partial output, not retrying"
                    );
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        provider = %provider_name,
                        error = %e,
                        "Fallback: provider failed"
                    );
                    attempted.push(provider_name);
                    last_error = Some(e);
                }
            }
        }

        let last = last_error.unwrap_or_else(|| {
            ProviderError::NotConfigured("No providers in fallback chain".into())
        });
        if attempted.len() == 1 {
            return Err(last);
        }
        Err(ProviderError::AllProvidersFailed {
            attempted,
            last: last.to_string(),
        })
    }
}
