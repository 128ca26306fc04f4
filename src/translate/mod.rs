//! Translation backends.
//! The pipeline only sees [`TranslationBackend`]; providers are independent
//! implementations chosen by configuration.

pub mod http_json;
pub mod normalize;
pub mod openai;

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{BackendConfig, BackendKind};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranslateError {
    /// Missing credentials or endpoint. Not retried automatically.
    #[error("translation backend not configured: {0}")]
    Configuration(String),
    /// Network failure or non-success HTTP status.
    #[error("translation request failed: {message}")]
    Transport { status: Option<u16>, message: String },
    #[error("translation request timed out")]
    Timeout,
    #[error("translation backend returned no content")]
    EmptyResult,
    /// Superseded work. Never shown to the user.
    #[error("translation cancelled")]
    Cancelled,
}

impl TranslateError {
    pub fn transport(status: Option<u16>, message: impl Into<String>) -> Self {
        TranslateError::Transport {
            status,
            message: message.into(),
        }
    }

    pub fn is_user_visible(&self) -> bool {
        !matches!(self, TranslateError::Cancelled)
    }
}

impl From<reqwest::Error> for TranslateError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return TranslateError::Timeout;
        }
        TranslateError::Transport {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

/// A machine translation provider.
pub trait TranslationBackend: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &'static str;

    /// Translate `text`. Implementations abort promptly when `cancel` fires
    /// and return [`TranslateError::Cancelled`].
    fn translate<'a>(
        &'a self,
        text: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<String, TranslateError>>;
}

/// Check a backend configuration without building a client.
pub fn validate_config(config: &BackendConfig) -> Result<(), TranslateError> {
    match config.kind {
        BackendKind::OpenAi => openai::validate_config(config),
        BackendKind::HttpJson => http_json::validate_config(config),
    }
}

/// Build the configured provider, wrapped with placeholder protection and
/// same-language pass-through. HTTP calls give up after `request_timeout`.
/// An invalid configuration yields a backend whose calls fail with
/// [`TranslateError::Configuration`].
pub fn build_backend(
    config: &BackendConfig,
    request_timeout: Duration,
) -> Arc<dyn TranslationBackend> {
    let provider: Result<Arc<dyn TranslationBackend>, TranslateError> = match config.kind {
        BackendKind::OpenAi => openai::OpenAiBackend::new(config, request_timeout)
            .map(|b| Arc::new(b) as Arc<dyn TranslationBackend>),
        BackendKind::HttpJson => http_json::HttpJsonBackend::new(config, request_timeout)
            .map(|b| Arc::new(b) as Arc<dyn TranslationBackend>),
    };
    let provider = match provider {
        Ok(provider) => {
            info!(backend = provider.name(), target_lang = %config.target_lang, "translation backend ready");
            provider
        }
        Err(e) => {
            warn!(error = %e, "translation backend unavailable");
            Arc::new(Unconfigured {
                reason: e.to_string(),
            })
        }
    };
    Arc::new(normalize::Normalizing::new(provider, &config.target_lang))
}

/// Stand-in for a provider whose configuration is invalid.
pub struct Unconfigured {
    reason: String,
}

impl TranslationBackend for Unconfigured {
    fn name(&self) -> &'static str {
        "unconfigured"
    }

    fn translate<'a>(
        &'a self,
        _text: &'a str,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<String, TranslateError>> {
        Box::pin(async move { Err(TranslateError::Configuration(self.reason.clone())) })
    }
}
