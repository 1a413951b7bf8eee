use std::{env, time::Duration};

use types::{AgentConfig, ProviderConfig, ProviderError};

mod openai;
mod retry;
mod stream;

pub use openai::OpenAICompatibleProvider;
pub use retry::{ReliableProvider, RetryPolicy};
pub use stream::{SseDataParser, StreamParser, StreamPayload, parse_stream_payload};

#[cfg(test)]
use openai::ChatCompletionRequest;

pub(crate) const LOCAL_DEFAULT_BASE_URL: &str = types::DEFAULT_BASE_URL;
pub(crate) const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
pub(crate) const DEFAULT_STREAM_BUFFER_SIZE: usize = 64;
pub(crate) const FALLBACK_API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Resolve the bearer token for the configured endpoint.
///
/// Resolution order:
/// 1. Explicit `api_key` from the config
/// 2. Custom env var named by `api_key_env`
/// 3. `OPENAI_API_KEY`
///
/// Local servers usually need no key, so `Ok(None)` is a valid outcome. It
/// is an error only when `api_key_env` names a variable that is unset.
pub fn resolve_api_key(config: &ProviderConfig) -> Result<Option<String>, ProviderError> {
    let custom_env = config
        .api_key_env
        .as_ref()
        .and_then(|var| env::var(var).ok());
    let resolved = resolve_api_key_from_sources(
        config.api_key.clone(),
        custom_env,
        env::var(FALLBACK_API_KEY_ENV).ok(),
    );
    if resolved.is_none() && config.api_key_env.is_some() {
        return Err(ProviderError::MissingApiKey {
            provider: config.id.clone(),
        });
    }
    Ok(resolved)
}

pub fn build_provider(config: &ProviderConfig) -> Result<OpenAICompatibleProvider, ProviderError> {
    let api_key = resolve_api_key(config)?;
    OpenAICompatibleProvider::new(
        config.id.clone(),
        &config.base_url,
        api_key,
        config.extra_headers.clone(),
        Duration::from_secs(config.connect_timeout_secs),
    )
}

/// The provider stack used by the agent: the streaming client wrapped in
/// stream-setup retries.
pub fn build_reliable_provider(config: &AgentConfig) -> Result<ReliableProvider, ProviderError> {
    let provider = build_provider(&config.provider)?;
    Ok(ReliableProvider::new(
        Box::new(provider),
        RetryPolicy::from(&config.reliability),
    ))
}

fn resolve_api_key_from_sources(
    explicit_api_key: Option<String>,
    custom_env_key: Option<String>,
    fallback_env_key: Option<String>,
) -> Option<String> {
    explicit_api_key
        .and_then(non_empty)
        .or_else(|| custom_env_key.and_then(non_empty))
        .or_else(|| fallback_env_key.and_then(non_empty))
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

fn normalize_base_url_or_default(base_url: &str, default_base_url: &str) -> String {
    let trimmed = base_url.trim();
    if trimmed.is_empty() {
        default_base_url.to_owned()
    } else {
        trimmed.trim_end_matches('/').to_owned()
    }
}

fn extract_http_error_message(body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<openai::ErrorEnvelope>(body)
        && let Some(message) = non_empty(parsed.error.message)
    {
        return truncate_message(&message);
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "empty error response from provider".to_owned()
    } else {
        truncate_message(trimmed)
    }
}

fn truncate_message(message: &str) -> String {
    const MAX_LEN: usize = 512;
    if message.chars().count() <= MAX_LEN {
        return message.to_owned();
    }
    let prefix = message.chars().take(MAX_LEN).collect::<String>();
    format!("{prefix}...")
}
