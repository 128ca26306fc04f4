//! Configuration: JSON file with per-section defaults, then environment
//! overrides. Every field is optional in the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::refresh::RefreshPolicy;
use crate::task::{ExecutionPolicy, TaskOptions};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "HOVER_TRANSLATE_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub segment: SegmentConfig,
    pub cache: CacheConfig,
    pub tasks: TaskConfig,
    pub refresh: RefreshConfig,
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    pub target_size: usize,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            target_size: crate::segment::DEFAULT_TARGET_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_days: u64,
    pub flush_debounce_ms: u64,
    /// SQLite file. Absent means memory-only.
    pub db_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_days: 30,
            flush_debounce_ms: 500,
            db_path: None,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_days.saturating_mul(24 * 3600))
    }

    pub fn flush_debounce(&self) -> Duration {
        Duration::from_millis(self.flush_debounce_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    Serial,
    Parallel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub policy: PolicyKind,
    pub max_concurrency: usize,
    pub request_delay_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            policy: PolicyKind::Serial,
            max_concurrency: 3,
            request_delay_ms: 200,
            request_timeout_secs: 30,
        }
    }
}

impl TaskConfig {
    /// Shared by the task manager and the HTTP clients of every backend.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

impl From<&TaskConfig> for TaskOptions {
    fn from(cfg: &TaskConfig) -> Self {
        let policy = match cfg.policy {
            PolicyKind::Serial => ExecutionPolicy::Serial {
                delay: Duration::from_millis(cfg.request_delay_ms),
            },
            PolicyKind::Parallel => ExecutionPolicy::Parallel {
                max: cfg.max_concurrency.max(1),
            },
        };
        TaskOptions {
            policy,
            request_timeout: cfg.request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub debounce_ms: u64,
    pub cooldown_ms: u64,
    pub max_per_session: u32,
    pub quiet_reset_ms: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            cooldown_ms: 1000,
            max_per_session: 10,
            quiet_reset_ms: 5000,
        }
    }
}

impl From<&RefreshConfig> for RefreshPolicy {
    fn from(cfg: &RefreshConfig) -> Self {
        RefreshPolicy {
            debounce: Duration::from_millis(cfg.debounce_ms),
            cooldown: Duration::from_millis(cfg.cooldown_ms),
            max_per_session: cfg.max_per_session,
            quiet_reset: Duration::from_millis(cfg.quiet_reset_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// OpenAI-compatible chat completions (DeepSeek by default).
    #[serde(rename = "openai")]
    OpenAi,
    /// Plain JSON endpoint taking `{text, source_lang, target_lang}`.
    HttpJson,
}

impl std::str::FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" | "deepseek" => Ok(BackendKind::OpenAi),
            "http_json" | "http-json" | "deeplx" => Ok(BackendKind::HttpJson),
            other => Err(ConfigError::Invalid {
                field: "backend.kind",
                reason: format!("unknown backend {other:?}"),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    /// Endpoint for the plain JSON backend.
    pub endpoint: Option<String>,
    pub source_lang: String,
    pub target_lang: String,
    /// Minimum spacing between requests to the chat backend.
    pub min_interval_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::OpenAi,
            api_key: None,
            base_url: "https://api.deepseek.com".into(),
            model: "deepseek-chat".into(),
            endpoint: None,
            source_lang: "auto".into(),
            target_lang: "zh".into(),
            min_interval_ms: 100,
        }
    }
}

impl Config {
    /// Load from `path`, or from `$HOVER_TRANSLATE_CONFIG`, or defaults; then
    /// apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::from_file(&path)?,
            None => {
                debug!("no config file, using defaults");
                Self::default()
            }
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(kind) = var("HOVER_TRANSLATE_BACKEND") {
            self.backend.kind = kind.parse()?;
        }
        if let Some(key) = var("HOVER_TRANSLATE_API_KEY").or_else(|| var("DEEPSEEK_API_KEY")) {
            self.backend.api_key = Some(key);
        }
        if let Some(endpoint) = var("HOVER_TRANSLATE_ENDPOINT") {
            self.backend.endpoint = Some(endpoint);
        }
        if let Some(lang) = var("HOVER_TRANSLATE_TARGET_LANG") {
            self.backend.target_lang = lang;
        }
        if let Some(db) = var("HOVER_TRANSLATE_DB") {
            self.cache.db_path = Some(PathBuf::from(db));
        }
        Ok(())
    }
}
