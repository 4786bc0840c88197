//! Completion provider trait.

use async_trait::async_trait;

use crate::error::LlmResult;

/// A provider-agnostic completion request.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    /// System block. When `cache_system` is set, providers that support
    /// prompt caching mark this block as the cache breakpoint.
    pub system: String,
    /// The user message.
    pub user: String,
    /// Sampling temperature.
    pub temperature: f64,
    /// Hard completion token cap.
    pub max_tokens: u32,
    /// Ask the provider to cache the system block.
    pub cache_system: bool,
}

/// Raw output of one provider call, before cost accounting.
#[derive(Debug, Clone, Default)]
pub struct RawCompletion {
    /// Completion text.
    pub text: String,
    /// Prompt tokens.
    pub tokens_in: u64,
    /// Completion tokens.
    pub tokens_out: u64,
    /// Prompt tokens served from the provider cache.
    pub cached_tokens: u64,
}

/// A single model endpoint. One instance is registered per model name;
/// the instance knows its own credentials and endpoint.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// The model name this provider serves.
    fn model(&self) -> &str;

    /// Run one completion.
    async fn complete(&self, request: &ProviderRequest) -> LlmResult<RawCompletion>;
}
