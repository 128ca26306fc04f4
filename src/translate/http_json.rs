//! Plain JSON translation endpoint (DeepLX-style).
//! POST `{"text", "source_lang", "target_lang"}`; the translation is read from
//! `data`, `text` or `result`, falling back to the raw body.

use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::{TranslateError, TranslationBackend};
use crate::config::BackendConfig;

pub struct HttpJsonBackend {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    source_lang: String,
    target_lang: String,
    request_timeout: Duration,
}

pub fn validate_config(config: &BackendConfig) -> Result<(), TranslateError> {
    let endpoint = config.endpoint.as_deref().map(str::trim).unwrap_or_default();
    if endpoint.is_empty() {
        return Err(TranslateError::Configuration(
            "endpoint missing (set backend.endpoint or HOVER_TRANSLATE_ENDPOINT)".into(),
        ));
    }
    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        return Err(TranslateError::Configuration(format!(
            "endpoint must be an http(s) URL, got {endpoint:?}"
        )));
    }
    if config.target_lang.trim().is_empty() {
        return Err(TranslateError::Configuration("target_lang missing".into()));
    }
    Ok(())
}

impl HttpJsonBackend {
    pub fn new(config: &BackendConfig, request_timeout: Duration) -> Result<Self, TranslateError> {
        validate_config(config)?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| TranslateError::Configuration(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: config.endpoint.clone().unwrap_or_default().trim().to_string(),
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            source_lang: config.source_lang.clone(),
            target_lang: config.target_lang.clone(),
            request_timeout,
        })
    }

    async fn post(&self, text: &str, cancel: &CancellationToken) -> Result<String, TranslateError> {
        let mut request = self.http.post(&self.endpoint).timeout(self.request_timeout).json(&json!({
            "text": text,
            "source_lang": self.source_lang,
            "target_lang": self.target_lang,
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = tokio::select! {
            resp = request.send() => resp?,
            _ = cancel.cancelled() => return Err(TranslateError::Cancelled),
        };
        let status = response.status();
        let body = tokio::select! {
            body = response.text() => body?,
            _ = cancel.cancelled() => return Err(TranslateError::Cancelled),
        };
        if !status.is_success() {
            return Err(TranslateError::transport(
                Some(status.as_u16()),
                format!("HTTP {}: {}", status, body.chars().take(200).collect::<String>()),
            ));
        }

        let translated = extract_translation(&body);
        if translated.trim().is_empty() {
            return Err(TranslateError::EmptyResult);
        }
        Ok(translated)
    }
}

impl TranslationBackend for HttpJsonBackend {
    fn name(&self) -> &'static str {
        "http_json"
    }

    fn translate<'a>(
        &'a self,
        text: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<String, TranslateError>> {
        Box::pin(self.post(text, cancel))
    }
}

/// Pull the translated text out of a response body.
fn extract_translation(body: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => ["data", "text", "result"]
            .iter()
            .find_map(|k| value.get(k).and_then(|v| v.as_str()))
            .map(str::to_string)
            .unwrap_or_default(),
        Err(_) => body.to_string(),
    }
}
