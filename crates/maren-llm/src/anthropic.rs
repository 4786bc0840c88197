//! Anthropic Messages API provider.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, error};

use crate::error::{LlmError, LlmResult};
use crate::provider::{CompletionProvider, ProviderRequest, RawCompletion};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API client for one model.
pub struct AnthropicProvider {
    client: Client,
    model: String,
    api_key: String,
    base_url: Option<String>,
}

impl AnthropicProvider {
    /// Create a provider bound to one model.
    #[must_use]
    pub fn new(model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            model: model.into(),
            api_key: api_key.into(),
            base_url: None,
        }
    }

    /// Override the endpoint (proxies, test servers).
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    fn build_request(&self, request: &ProviderRequest) -> Value {
        let mut body = json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": [{"role": "user", "content": request.user}],
        });
        if !request.system.is_empty() {
            if request.cache_system {
                // Cache breakpoint after the stable span.
                body["system"] = json!([{
                    "type": "text",
                    "text": request.system,
                    "cache_control": {"type": "ephemeral"},
                }]);
            } else {
                body["system"] = Value::String(request.system.clone());
            }
        }
        body
    }
}

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ContentBlock>,
    usage: ApiUsage,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct ApiUsage {
    input_tokens: u64,
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
}

#[async_trait]
impl CompletionProvider for AnthropicProvider {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ProviderRequest) -> LlmResult<RawCompletion> {
        if self.api_key.is_empty() {
            return Err(LlmError::ApiKeyNotConfigured {
                provider: "anthropic".to_string(),
            });
        }

        let url = self.base_url.as_deref().unwrap_or(ANTHROPIC_API_URL);
        debug!(model = self.model, "anthropic completion");

        let mut api_key_header = reqwest::header::HeaderValue::try_from(&self.api_key)
            .map_err(|e| LlmError::MalformedResponse(format!("invalid API key characters: {e}")))?;
        api_key_header.set_sensitive(true);

        let response = self
            .client
            .post(url)
            .header("x-api-key", api_key_header)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&self.build_request(request))
            .send()
            .await
            .map_err(|e| LlmError::TransientProvider(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "anthropic API error");
            if status.as_u16() == 429 {
                return Err(LlmError::RateLimited {
                    retry_after_secs: 60,
                });
            }
            if status.is_server_error() {
                return Err(LlmError::TransientProvider(format!("status {status}")));
            }
            return Err(LlmError::MalformedResponse(format!(
                "status {status}: {body}"
            )));
        }

        let parsed: ApiResponse = response
            .json()
            .await
            .map_err(|e| LlmError::MalformedResponse(e.to_string()))?;

        let text: String = parsed
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Other => None,
            })
            .collect();

        Ok(RawCompletion {
            text,
            tokens_in: parsed
                .usage
                .input_tokens
                .saturating_add(parsed.usage.cache_read_input_tokens)
                .saturating_add(parsed.usage.cache_creation_input_tokens),
            tokens_out: parsed.usage.output_tokens,
            cached_tokens: parsed.usage.cache_read_input_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_hint_shapes_system_block() {
        let provider = AnthropicProvider::new("claude-sonnet-4-20250514", "key");
        let cached = provider.build_request(&ProviderRequest {
            system: "stable".to_string(),
            user: "hi".to_string(),
            temperature: 0.4,
            max_tokens: 512,
            cache_system: true,
        });
        assert!(cached["system"].is_array());
        assert_eq!(cached["system"][0]["cache_control"]["type"], "ephemeral");

        let plain = provider.build_request(&ProviderRequest {
            system: "stable".to_string(),
            user: "hi".to_string(),
            temperature: 0.4,
            max_tokens: 512,
            cache_system: false,
        });
        assert!(plain["system"].is_string());
    }

    #[tokio::test]
    async fn test_missing_api_key() {
        let provider = AnthropicProvider::new("claude-sonnet-4-20250514", "");
        let err = provider
            .complete(&ProviderRequest {
                system: String::new(),
                user: "hi".to_string(),
                temperature: 0.4,
                max_tokens: 16,
                cache_system: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::ApiKeyNotConfigured { .. }));
    }
}
