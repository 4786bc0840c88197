//! OpenAI-compatible chat completions provider.
//!
//! Used for fallback models and the small JSON-repair model; also covers
//! any self-hosted endpoint speaking the same dialect.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, error};

use crate::error::{LlmError, LlmResult};
use crate::provider::{CompletionProvider, ProviderRequest, RawCompletion};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible chat completions client for one model.
pub struct OpenAiCompatProvider {
    client: Client,
    model: String,
    api_key: String,
    base_url: Option<String>,
}

impl OpenAiCompatProvider {
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

    /// Point at a compatible non-OpenAI endpoint.
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    fn build_request(&self, request: &ProviderRequest) -> Value {
        let mut messages = Vec::new();
        if !request.system.is_empty() {
            messages.push(json!({"role": "system", "content": request.system}));
        }
        messages.push(json!({"role": "user", "content": request.user}));
        json!({
            "model": self.model,
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        })
    }
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Deserialize, Default)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}

#[async_trait]
impl CompletionProvider for OpenAiCompatProvider {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ProviderRequest) -> LlmResult<RawCompletion> {
        if self.api_key.is_empty() {
            return Err(LlmError::ApiKeyNotConfigured {
                provider: "openai".to_string(),
            });
        }

        let url = self.base_url.as_deref().unwrap_or(OPENAI_API_URL);
        debug!(model = self.model, "openai-compatible completion");

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&self.build_request(request))
            .send()
            .await
            .map_err(|e| LlmError::TransientProvider(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "openai-compatible API error");
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

        let text = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| LlmError::MalformedResponse("response had no choices".to_string()))?;

        let usage = parsed.usage.unwrap_or_default();
        Ok(RawCompletion {
            text,
            tokens_in: usage.prompt_tokens,
            tokens_out: usage.completion_tokens,
            cached_tokens: usage
                .prompt_tokens_details
                .map_or(0, |d| d.cached_tokens),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let provider = OpenAiCompatProvider::new("gpt-4o-mini", "key");
        let body = provider.build_request(&ProviderRequest {
            system: "sys".to_string(),
            user: "hi".to_string(),
            temperature: 0.2,
            max_tokens: 64,
            cache_system: true,
        });
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body["model"], "gpt-4o-mini");
    }

    #[test]
    fn test_system_omitted_when_empty() {
        let provider = OpenAiCompatProvider::new("gpt-4o-mini", "key");
        let body = provider.build_request(&ProviderRequest {
            system: String::new(),
            user: "hi".to_string(),
            temperature: 0.2,
            max_tokens: 64,
            cache_system: false,
        });
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }
}
