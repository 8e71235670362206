//! Narrow LLM generation contract plus the fake and OpenAI implementations.
//!
//! The engine only ever sees `LlmProvider`; provider choice happens once at
//! startup and test mode always forces the fake provider.

use crate::config::Settings;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
pub struct LlmRequest {
    pub game_id: String,
    pub role_id: String,
    pub status: String,
    pub prompt: String,
    pub prompt_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_context: Option<Value>,
    pub request_payload: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct LlmResponse {
    pub assistant_text: String,
    pub metadata: Option<Value>,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("invalid LLM response: {0}")]
    Validation(String),
    #[error("{0}")]
    Provider(String),
}

impl LlmError {
    /// Short tag recorded as `error_type` in trace rows.
    pub fn error_type(&self) -> &'static str {
        match self {
            LlmError::Validation(_) => "validation",
            LlmError::Provider(_) => "provider_error",
        }
    }
}

/// Structural checks every provider response must pass.
pub fn validate_response(response: LlmResponse) -> Result<LlmResponse, LlmError> {
    if response.assistant_text.trim().is_empty() {
        return Err(LlmError::Validation("assistant_text must be non-empty".to_string()));
    }
    Ok(response)
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn provider_name(&self) -> &str;

    fn model_name(&self) -> &str;

    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;
}

/// Echo provider used in tests and any environment flagged as test mode.
pub struct FakeProvider;

#[async_trait]
impl LlmProvider for FakeProvider {
    fn provider_name(&self) -> &str {
        "fake"
    }

    fn model_name(&self) -> &str {
        "fake"
    }

    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        validate_response(LlmResponse {
            assistant_text: format!("[FAKE_RESPONSE]{}", request.prompt),
            metadata: None,
        })
    }
}

pub struct OpenAiProvider {
    api_key: String,
    model: String,
    client: Client,
}

impl OpenAiProvider {
    pub fn new(api_key: &str, model: &str) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            client,
        }
    }

    fn map_api_error(status: reqwest::StatusCode, body: &str) -> String {
        match status.as_u16() {
            401 => "Invalid API key.".to_string(),
            429 => "Rate limited. Please wait a moment and try again.".to_string(),
            500 | 502 | 503 => "OpenAI is temporarily unavailable.".to_string(),
            _ => format!("API error ({}): {}", status, body),
        }
    }

    fn is_retryable(message: &str) -> bool {
        let lower = message.to_lowercase();
        lower.contains("rate") || lower.contains("timeout")
    }

    async fn call_once(&self, prompt: &str) -> Result<String, LlmError> {
        let body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
        });
        let response = self
            .client
            .post(OPENAI_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Provider("Request timeout".to_string())
                } else {
                    LlmError::Provider(format!("Network error: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Provider(Self::map_api_error(status, &text)));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| LlmError::Provider(format!("Read error: {}", e)))?;
        Ok(data["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string())
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn provider_name(&self) -> &str {
        "openai"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        // One retry on rate/timeout; validation failures never retry.
        let mut last_err: Option<LlmError> = None;
        for attempt in 0..=1 {
            match self.call_once(&request.prompt).await {
                Ok(content) => {
                    return validate_response(LlmResponse {
                        assistant_text: content,
                        metadata: Some(json!({
                            "provider": self.provider_name(),
                            "model": self.model,
                        })),
                    });
                }
                Err(LlmError::Validation(msg)) => return Err(LlmError::Validation(msg)),
                Err(LlmError::Provider(msg)) => {
                    let retryable = Self::is_retryable(&msg);
                    last_err = Some(LlmError::Provider(msg));
                    if attempt == 0 && retryable {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                    break;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| LlmError::Provider("OpenAI call failed".to_string())))
    }
}

/// Pick the provider for this process. Test mode force-disables OpenAI.
pub fn select_provider(settings: &Settings) -> Arc<dyn LlmProvider> {
    if !settings.is_test()
        && settings.llm_provider == "openai"
        && !settings.openai_api_key.is_empty()
    {
        Arc::new(OpenAiProvider::new(&settings.openai_api_key, &settings.openai_model))
    } else {
        Arc::new(FakeProvider)
    }
}
