use std::sync::Arc;

use tracing::info;

use webpilot_core::{Config, Error, Result};

use crate::{AnthropicStrategy, GeminiStrategy, ModelStrategy, VisionTextStrategy};

/// Infer the provider family from the model name prefix. `None` means the
/// model is served through an OpenAI-compatible endpoint.
pub fn infer_provider_from_model(model: &str) -> Option<&'static str> {
    if model.starts_with("anthropic/") || model.starts_with("claude-") {
        Some("anthropic")
    } else if model.starts_with("gemini/") || model.starts_with("gemini-") {
        Some("gemini")
    } else if model.starts_with("openai/") || model.starts_with("gpt-") {
        Some("openai")
    } else {
        None
    }
}

/// Build the active model strategy once at startup.
///
/// Resolution order: explicit `agent.provider` from config, then the model
/// prefix, then the OpenAI-compatible vision strategy as the fallback family.
pub fn create_strategy(config: &Config) -> Result<Arc<dyn ModelStrategy>> {
    let model = &config.agent.model;
    let provider = config
        .agent
        .provider
        .as_deref()
        .or_else(|| infer_provider_from_model(model))
        .unwrap_or("openai");

    let api_key = config
        .resolve_api_key(provider)
        .ok_or_else(|| Error::ProviderNotConfigured(provider.to_string()))?;
    let api_base = config.api_base(provider);
    let max_tokens = config.agent.max_tokens;
    let temperature = config.agent.temperature;

    info!(provider = %provider, model = %model, "Model strategy selected");

    let strategy: Arc<dyn ModelStrategy> = match provider {
        "anthropic" => Arc::new(AnthropicStrategy::new(
            &api_key,
            api_base.as_deref(),
            model,
            max_tokens,
            temperature,
        )),
        "gemini" => Arc::new(GeminiStrategy::new(
            &api_key,
            api_base.as_deref(),
            model,
            max_tokens,
            temperature,
        )),
        // Everything else speaks the OpenAI-compatible completion shape
        _ => Arc::new(VisionTextStrategy::new(
            &api_key,
            api_base.as_deref(),
            model,
            max_tokens,
            temperature,
        )),
    };
    Ok(strategy)
}
