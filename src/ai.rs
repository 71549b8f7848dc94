//! AI search provider abstraction and implementations.
//!
//! Defines the [`ChatProvider`] trait and two concrete providers:
//! - **[`PerplexityProvider`]**: Perplexity Sonar chat completions with live
//!   web search; returns citation URLs alongside the answer.
//! - **[`OpenAiCompatibleProvider`]**: any endpoint speaking the OpenAI
//!   `/chat/completions` protocol.
//!
//! # Retry Strategy
//!
//! Both providers share the same backoff loop:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: base, 2×base, 4×base, … (capped at 2^5 × base)

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AiConfig, ProviderConfig};
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Web-search tuning honoured by providers that search (Perplexity).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchOptions {
    /// Restrict (or with a leading `-`, exclude) source domains.
    pub domain_filter: Vec<String>,
    /// `day`, `week`, `month` or `year`.
    pub recency: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    /// Overrides `ai.temperature` when set.
    pub temperature: Option<f32>,
    pub search: SearchOptions,
}

impl ChatRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: Some(system.into()),
            messages: vec![ChatMessage::user(user)],
            temperature: None,
            search: SearchOptions::default(),
        }
    }

    /// The last user message, used for logging and feedback.
    pub fn question(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChatResponse {
    pub content: String,
    /// Source URLs; `[n]` markers in `content` refer to `citations[n - 1]`.
    pub citations: Vec<String>,
    pub model: String,
    pub usage: Option<Usage>,
}

/// A chat-completions backend.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Provider identifier (`"perplexity"`, `"openai"`).
    fn name(&self) -> &str;
    fn model(&self) -> &str;
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Perplexity,
    OpenAi,
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "perplexity" => Ok(ProviderKind::Perplexity),
            "openai" => Ok(ProviderKind::OpenAi),
            other => bail!("Unknown AI provider: '{}'. Use perplexity or openai.", other),
        }
    }
}

/// Instantiates a provider, reading its API key from the environment.
pub fn create_provider(config: &AiConfig, kind: ProviderKind) -> Result<Arc<dyn ChatProvider>> {
    Ok(match kind {
        ProviderKind::Perplexity => Arc::new(PerplexityProvider::new(
            HttpChatClient::from_config(&config.perplexity, config)?,
        )),
        ProviderKind::OpenAi => Arc::new(OpenAiCompatibleProvider::new(
            HttpChatClient::from_config(&config.openai, config)?,
        )),
    })
}

// ============ HTTP transport ============

/// Connection settings and retry loop shared by all providers.
#[derive(Clone)]
pub struct HttpChatClient {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
    max_retries: u32,
    temperature: f32,
    backoff_base: Duration,
}

impl HttpChatClient {
    /// # Errors
    ///
    /// Returns an error if the provider's API key variable is not set.
    pub fn from_config(provider: &ProviderConfig, ai: &AiConfig) -> Result<Self> {
        let api_key = std::env::var(&provider.api_key_env)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", provider.api_key_env))?;
        Self::new(
            &provider.url,
            &provider.model,
            &api_key,
            Duration::from_secs(ai.timeout_secs),
            ai.max_retries,
        )
        .map(|c| c.with_temperature(ai.temperature))
    }

    pub fn new(
        url: &str,
        model: &str,
        api_key: &str,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
            max_retries,
            temperature: 0.2,
            backoff_base: Duration::from_secs(1),
        })
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    fn messages(&self, request: &ChatRequest) -> Vec<Value> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        for m in &request.messages {
            messages.push(json!({ "role": m.role, "content": m.content }));
        }
        messages
    }

    fn base_body(&self, request: &ChatRequest) -> Value {
        json!({
            "model": self.model,
            "messages": self.messages(request),
            "temperature": request.temperature.unwrap_or(self.temperature),
        })
    }

    /// POSTs `body` with bearer auth, retrying transient failures.
    async fn post(&self, label: &str, body: &Value) -> Result<Value> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.backoff_base * (1u32 << (attempt - 1).min(5));
                tracing::debug!(provider = label, attempt, ?delay, "retrying chat completion");
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&self.url)
                .bearer_auth(&self.api_key)
                .json(body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: Value = response
                            .json()
                            .await
                            .with_context(|| format!("{} returned invalid JSON", label))?;
                        return Ok(json);
                    }

                    // Rate limited or server error, retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        tracing::warn!(provider = label, %status, "transient API error");
                        last_err = Some(
                            AppError::Upstream(format!(
                                "{} API error {}: {}",
                                label, status, body_text
                            ))
                            .into(),
                        );
                        continue;
                    }

                    // Client error (not 429), no retry
                    let body_text = response.text().await.unwrap_or_default();
                    return Err(AppError::Upstream(format!(
                        "{} API error {}: {}",
                        label, status, body_text
                    ))
                    .into());
                }
                Err(e) => {
                    tracing::warn!(provider = label, error = %e, "request failed");
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} request failed after retries", label)))
    }
}

/// Parses an OpenAI-style chat completion.
///
/// Citations come from `citations` (string array) when present, otherwise
/// from `search_results[].url`.
pub fn parse_chat_response(json: &Value) -> Result<ChatResponse> {
    let content = json
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("Invalid chat response: missing choices[0].message.content"))?
        .to_string();

    let mut citations: Vec<String> = json
        .get("citations")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    if citations.is_empty() {
        if let Some(results) = json.get("search_results").and_then(Value::as_array) {
            citations = results
                .iter()
                .filter_map(|r| r.get("url").and_then(Value::as_str))
                .map(str::to_string)
                .collect();
        }
    }

    let usage = json.get("usage").map(|u| Usage {
        prompt_tokens: u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
        completion_tokens: u
            .get("completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        total_tokens: u.get("total_tokens").and_then(Value::as_u64).unwrap_or(0),
    });

    Ok(ChatResponse {
        content,
        citations,
        model: json
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        usage,
    })
}

// ============ Perplexity ============

/// Perplexity Sonar: chat completions grounded in a live web search.
pub struct PerplexityProvider {
    http: HttpChatClient,
}

impl PerplexityProvider {
    pub fn new(http: HttpChatClient) -> Self {
        Self { http }
    }

    fn body(&self, request: &ChatRequest) -> Value {
        let mut body = self.http.base_body(request);
        if !request.search.domain_filter.is_empty() {
            body["search_domain_filter"] = json!(request.search.domain_filter);
        }
        if let Some(recency) = &request.search.recency {
            body["search_recency_filter"] = json!(recency);
        }
        body
    }
}

#[async_trait]
impl ChatProvider for PerplexityProvider {
    fn name(&self) -> &str {
        "perplexity"
    }

    fn model(&self) -> &str {
        &self.http.model
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let json = self.http.post("Perplexity", &self.body(request)).await?;
        parse_chat_response(&json)
    }
}

// ============ OpenAI-compatible ============

/// Any endpoint implementing the OpenAI chat-completions protocol.
///
/// Search options are ignored; these models answer from training data.
pub struct OpenAiCompatibleProvider {
    http: HttpChatClient,
}

impl OpenAiCompatibleProvider {
    pub fn new(http: HttpChatClient) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.http.model
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let json = self
            .http
            .post("OpenAI", &self.http.base_body(request))
            .await?;
        parse_chat_response(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> HttpChatClient {
        HttpChatClient::new(
            "http://127.0.0.1:9/chat",
            "sonar-pro",
            "key",
            Duration::from_secs(1),
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_perplexity_response() {
        let json = json!({
            "model": "sonar-pro",
            "citations": ["https://a.example", "https://b.example"],
            "choices": [{ "message": { "role": "assistant", "content": "| A |\n|---|\n| 1 |" } }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15 }
        });
        let resp = parse_chat_response(&json).unwrap();
        assert_eq!(resp.model, "sonar-pro");
        assert_eq!(resp.citations.len(), 2);
        assert_eq!(resp.usage.unwrap().total_tokens, 15);
    }

    #[test]
    fn test_parse_search_results_fallback() {
        let json = json!({
            "choices": [{ "message": { "content": "ok" } }],
            "search_results": [{ "title": "x", "url": "https://c.example" }]
        });
        let resp = parse_chat_response(&json).unwrap();
        assert_eq!(resp.citations, vec!["https://c.example"]);
        assert!(resp.usage.is_none());
    }

    #[test]
    fn test_parse_missing_content_fails() {
        assert!(parse_chat_response(&json!({ "choices": [] })).is_err());
    }

    #[test]
    fn test_perplexity_body_includes_search_options() {
        let provider = PerplexityProvider::new(client());
        let mut request = ChatRequest::new("sys", "find SAE 1020");
        request.search.domain_filter = vec!["matweb.com".to_string()];
        request.search.recency = Some("year".to_string());

        let body = provider.body(&request);
        assert_eq!(body["model"], "sonar-pro");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "find SAE 1020");
        assert_eq!(body["search_domain_filter"][0], "matweb.com");
        assert_eq!(body["search_recency_filter"], "year");
    }

    #[test]
    fn test_question_is_last_user_message() {
        let mut request = ChatRequest::new("sys", "first");
        request.messages.push(ChatMessage::assistant("answer"));
        request.messages.push(ChatMessage::user("second"));
        assert_eq!(request.question(), "second");
    }

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!("openai".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAi);
        assert!("claude".parse::<ProviderKind>().is_err());
    }
}
