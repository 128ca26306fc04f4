//! OpenAI-compatible chat/completions client (DeepSeek by default).
//! Connection pooling via reqwest and a simple next-allowed-time rate limiter.
//! Failures are reported, not retried: retries are a user action.

use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{TranslateError, TranslationBackend};
use crate::config::BackendConfig;

pub struct OpenAiBackend {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    target_lang: String,
    /// Next time a request may start.
    next_allowed: tokio::sync::Mutex<Instant>,
    min_interval: Duration,
    request_timeout: Duration,
}

pub fn validate_config(config: &BackendConfig) -> Result<(), TranslateError> {
    match config.api_key.as_deref().map(str::trim) {
        None | Some("") => {
            return Err(TranslateError::Configuration(
                "API key missing (set backend.api_key or DEEPSEEK_API_KEY)".into(),
            ))
        }
        Some(_) => {}
    }
    if !config.base_url.starts_with("http://") && !config.base_url.starts_with("https://") {
        return Err(TranslateError::Configuration(format!(
            "base_url must be an http(s) URL, got {:?}",
            config.base_url
        )));
    }
    if config.model.trim().is_empty() {
        return Err(TranslateError::Configuration("model name missing".into()));
    }
    Ok(())
}

impl OpenAiBackend {
    pub fn new(config: &BackendConfig, request_timeout: Duration) -> Result<Self, TranslateError> {
        validate_config(config)?;

        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| TranslateError::Configuration(e.to_string()))?;

        Ok(Self {
            http,
            api_key: config.api_key.clone().unwrap_or_default(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            target_lang: config.target_lang.clone(),
            next_allowed: tokio::sync::Mutex::new(Instant::now()),
            min_interval: Duration::from_millis(config.min_interval_ms),
            request_timeout,
        })
    }

    /// Wait until the rate limiter allows a request.
    async fn rate_limit_wait(&self) {
        let mut next = self.next_allowed.lock().await;
        let now = Instant::now();
        if *next > now {
            tokio::time::sleep(*next - now).await;
        }
        *next = Instant::now() + self.min_interval;
    }

    async fn complete(&self, text: &str, cancel: &CancellationToken) -> Result<String, TranslateError> {
        tokio::select! {
            _ = self.rate_limit_wait() => {}
            _ = cancel.cancelled() => return Err(TranslateError::Cancelled),
        }

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt(&self.target_lang)},
                {"role": "user", "content": text}
            ],
            "max_tokens": estimate_max_tokens(text),
            "stream": false,
            "temperature": 0.1
        });

        let start = Instant::now();
        let request = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(self.request_timeout)
            .json(&body)
            .send();

        let response = tokio::select! {
            resp = request => resp?,
            _ = cancel.cancelled() => return Err(TranslateError::Cancelled),
        };

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(TranslateError::transport(
                Some(status.as_u16()),
                format!(
                    "HTTP {}: {}",
                    status,
                    body_text.chars().take(200).collect::<String>()
                ),
            ));
        }

        let parsed: ChatResponse = tokio::select! {
            parsed = response.json::<ChatResponse>() => parsed?,
            _ = cancel.cancelled() => return Err(TranslateError::Cancelled),
        };

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .unwrap_or_default();
        if content.is_empty() {
            return Err(TranslateError::EmptyResult);
        }

        debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            tokens = parsed.usage.map(|u| u.total_tokens).unwrap_or(0),
            "chat completion done"
        );
        Ok(content)
    }
}

impl TranslationBackend for OpenAiBackend {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn translate<'a>(
        &'a self,
        text: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<String, TranslateError>> {
        Box::pin(self.complete(text, cancel))
    }
}

fn system_prompt(target_lang: &str) -> String {
    format!(
        "You translate programming documentation into {target_lang}. \
         Keep Markdown, identifiers and <<PHn>> tags unchanged. \
         Output only the translation."
    )
}

/// Estimate max_tokens: (input_tokens * 1.15 + 32), clamped to [64, 2048].
fn estimate_max_tokens(text: &str) -> u32 {
    // Rough: ~4 chars/token for Latin, ~1.5 for CJK
    let estimated_input_tokens = text.len() as f64 / 3.0;
    let max = (estimated_input_tokens * 1.15 + 32.0) as u32;
    max.clamp(64, 2048)
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    total_tokens: u32,
}
