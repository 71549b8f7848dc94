//! Client for the workflow-automation backend (n8n webhooks).
//!
//! Enrichment, transcription, report execution and (optionally) search run
//! as external workflows. Each is reached by POSTing to its webhook URL
//! (see [`WebhookConfig::url_for`]). Replies are loosely shaped, so this
//! module also normalises them:
//!
//! - [`unwrap_reply`] strips single-element array wrappers and n8n's
//!   `{ "json": … }` item envelopes;
//! - [`text_of_reply`] finds the answer text in the usual keys;
//! - [`rows_of_reply`] finds the row array of a report.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::{WebhookConfig, WebhookKind};
use crate::error::AppError;
use crate::models::MaterialRecord;
use crate::pivot::PivotQuery;

pub struct WebhookClient {
    client: reqwest::Client,
    config: WebhookConfig,
    auth: Option<(String, String)>,
    backoff_base: Duration,
}

impl WebhookClient {
    /// # Errors
    ///
    /// Returns an error if header auth is configured but its environment
    /// variable is missing.
    pub fn new(config: &WebhookConfig) -> Result<Self> {
        let auth = match (&config.auth_header, &config.auth_token_env) {
            (Some(header), Some(env)) => {
                let token = std::env::var(env)
                    .with_context(|| format!("{} environment variable not set", env))?;
                Some((header.clone(), token))
            }
            _ => None,
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            config: config.clone(),
            auth,
            backoff_base: Duration::from_secs(1),
        })
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn is_configured(&self, kind: WebhookKind) -> bool {
        self.config.is_configured(kind)
    }

    fn url(&self, kind: WebhookKind) -> Result<String> {
        self.config.url_for(kind).ok_or_else(|| {
            AppError::NotConfigured(format!("the {} workflow is not configured", kind.as_str()))
                .into()
        })
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let builder = self.client.post(url);
        match &self.auth {
            Some((header, token)) => builder.header(header.as_str(), token.as_str()),
            None => builder,
        }
    }

    /// POSTs a JSON payload to a workflow and returns its (raw) reply.
    ///
    /// Non-JSON replies come back as `Value::String`, empty replies as
    /// `Value::Null`.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        kind: WebhookKind,
        payload: &T,
    ) -> Result<Value> {
        let url = self.url(kind)?;
        let body = serde_json::to_value(payload)?;
        self.send_with_retry(kind, || self.request(&url).json(&body))
            .await
    }

    async fn send_with_retry<F>(&self, kind: WebhookKind, build: F) -> Result<Value>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = self.backoff_base * (1u32 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let started = std::time::Instant::now();
            match build().send().await {
                Ok(response) => {
                    let status = response.status();
                    tracing::debug!(
                        workflow = kind.as_str(),
                        %status,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "webhook replied"
                    );

                    if status.is_success() {
                        let text = response.text().await?;
                        return Ok(parse_body(&text));
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.is_server_error() || status.as_u16() == 429 {
                        tracing::warn!(workflow = kind.as_str(), %status, "transient webhook error");
                        last_err = Some(
                            AppError::Upstream(format!(
                                "{} workflow error {}: {}",
                                kind.as_str(),
                                status,
                                body_text
                            ))
                            .into(),
                        );
                        continue;
                    }

                    return Err(AppError::Upstream(format!(
                        "{} workflow error {}: {}",
                        kind.as_str(),
                        status,
                        body_text
                    ))
                    .into());
                }
                Err(e) => {
                    tracing::warn!(workflow = kind.as_str(), error = %e, "webhook request failed");
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            anyhow::anyhow!("{} workflow failed after retries", kind.as_str())
        }))
    }

    /// Sends a material to the enrichment workflow.
    pub async fn enrich_material(&self, record: &MaterialRecord) -> Result<Value> {
        let reply = self
            .post_json(WebhookKind::Enrich, &json!({ "material": record }))
            .await?;
        Ok(unwrap_reply(reply))
    }

    /// Uploads audio to the transcription workflow and returns the text.
    pub async fn transcribe(&self, audio: Vec<u8>, filename: &str, mime: &str) -> Result<String> {
        if audio.is_empty() {
            return Err(AppError::BadRequest("audio upload is empty".to_string()).into());
        }
        let url = self.url(WebhookKind::Transcription)?;

        // Parse the MIME type up front; a Form cannot be reused across retries
        reqwest::multipart::Part::bytes(Vec::new())
            .mime_str(mime)
            .map_err(|_| AppError::BadRequest(format!("invalid content type: {}", mime)))?;

        let reply = self
            .send_with_retry(WebhookKind::Transcription, || {
                let part = reqwest::multipart::Part::bytes(audio.clone())
                    .file_name(filename.to_string())
                    .mime_str(mime)
                    .unwrap_or_else(|_| reqwest::multipart::Part::bytes(audio.clone()));
                self.request(&url)
                    .multipart(reqwest::multipart::Form::new().part("file", part))
            })
            .await?;

        text_of_reply(&reply)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                AppError::Upstream("transcription workflow returned no text".to_string()).into()
            })
    }

    /// Runs a pivot statement through the report workflow and returns its rows.
    pub async fn run_report(&self, query: &PivotQuery) -> Result<Vec<Value>> {
        let reply = self
            .post_json(WebhookKind::Report, &json!({ "query": query.sql }))
            .await?;
        rows_of_reply(reply)
    }
}

fn parse_body(text: &str) -> Value {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(text.to_string()))
}

/// Removes single-element array wrappers and `{ "json": … }` envelopes.
pub fn unwrap_reply(mut value: Value) -> Value {
    loop {
        value = match value {
            Value::Array(mut items) if items.len() == 1 => items.remove(0),
            Value::Object(mut obj) if obj.len() == 1 && obj.contains_key("json") => {
                obj.remove("json").unwrap_or(Value::Null)
            }
            other => return other,
        };
    }
}

const TEXT_KEYS: [&str; 6] = ["output", "text", "response", "answer", "content", "result"];

/// Finds the answer text inside a workflow reply.
pub fn text_of_reply(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.first().and_then(text_of_reply),
        Value::Object(obj) => {
            if let Some(Value::Object(inner)) = obj.get("json") {
                return text_of_reply(&Value::Object(inner.clone()));
            }
            for key in TEXT_KEYS {
                if let Some(Value::String(s)) = obj.get(key) {
                    return Some(s.clone());
                }
            }
            if let Some(content) = obj
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(Value::as_str)
            {
                return Some(content.to_string());
            }
            obj.get("data").and_then(text_of_reply)
        }
        _ => None,
    }
}

/// Extracts report rows: a bare array of objects (n8n item envelopes are
/// unwrapped), or an object carrying the array in `data` or `rows`.
pub fn rows_of_reply(value: Value) -> Result<Vec<Value>> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("data").or_else(|| obj.remove("rows")) {
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(AppError::Upstream(format!(
                    "report workflow returned rows that are not an array: {}",
                    other
                ))
                .into())
            }
            None if obj.is_empty() => Vec::new(),
            None => vec![Value::Object(obj)],
        },
        Value::Null => Vec::new(),
        other => bail!("report workflow returned unexpected payload: {}", other),
    };

    items
        .into_iter()
        .map(|item| match item {
            Value::Object(mut obj) if obj.len() == 1 && obj.contains_key("json") => {
                Ok(obj.remove("json").unwrap_or(Value::Null))
            }
            Value::Object(obj) => Ok(Value::Object(obj)),
            other => bail!("report row is not an object: {}", other),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_body_variants() {
        assert_eq!(parse_body(""), Value::Null);
        assert_eq!(parse_body("{\"a\":1}"), json!({ "a": 1 }));
        assert_eq!(parse_body("plain text"), json!("plain text"));
    }

    #[test]
    fn test_unwrap_reply() {
        assert_eq!(unwrap_reply(json!([{ "json": { "a": 1 } }])), json!({ "a": 1 }));
        assert_eq!(unwrap_reply(json!([1, 2])), json!([1, 2]));
    }

    #[test]
    fn test_text_of_reply() {
        assert_eq!(text_of_reply(&json!([{ "output": "hi" }])).as_deref(), Some("hi"));
        assert_eq!(
            text_of_reply(&json!({ "message": { "content": "x" } })).as_deref(),
            Some("x")
        );
        assert_eq!(
            text_of_reply(&json!({ "data": { "text": "nested" } })).as_deref(),
            Some("nested")
        );
        assert_eq!(text_of_reply(&json!({ "rows": [] })), None);
    }

    #[test]
    fn test_rows_of_reply() {
        let rows = rows_of_reply(json!([{ "json": { "plant": "A" } }, { "plant": "B" }])).unwrap();
        assert_eq!(rows, vec![json!({ "plant": "A" }), json!({ "plant": "B" })]);

        let rows = rows_of_reply(json!({ "data": [{ "x": 1 }] })).unwrap();
        assert_eq!(rows.len(), 1);

        assert!(rows_of_reply(Value::Null).unwrap().is_empty());
        assert!(rows_of_reply(json!([1])).is_err());
    }

    #[test]
    fn test_rows_of_reply_rejects_non_array_rows() {
        for reply in [json!({ "data": { "plant": "A" } }), json!({ "rows": "none" })] {
            let err: AppError = rows_of_reply(reply).unwrap_err().into();
            assert_eq!(err.code(), "upstream");
        }
        assert_eq!(rows_of_reply(json!({ "data": [] })).unwrap(), Vec::<Value>::new());
    }

    #[tokio::test]
    async fn test_unconfigured_workflow_is_typed_error() {
        let client = WebhookClient::new(&WebhookConfig::default()).unwrap();
        let err = client
            .post_json(WebhookKind::Enrich, &json!({}))
            .await
            .unwrap_err();
        let app: AppError = err.into();
        assert_eq!(app.code(), "not_configured");
    }
}
