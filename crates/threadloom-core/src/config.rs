use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, ThreadloomError};

/// Top-level Threadloom configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Secret used to sign and verify short-lived client tokens.
    #[serde(default)]
    pub token_secret: Option<String>,
    /// Lifetime of tokens minted by `threadloom token`.
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            token_secret: None,
            token_ttl_secs: default_token_ttl(),
            api_keys: vec![],
        }
    }
}

impl GatewayConfig {
    /// True when neither a token secret nor api keys are configured.
    pub fn is_open(&self) -> bool {
        self.token_secret.is_none() && self.api_keys.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    pub name: String,
    pub key: String,
    #[serde(default)]
    pub role: ApiKeyRole,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyRole {
    /// Read graphs and plans only
    Viewer,
    /// Read + stream + edit graphs
    #[default]
    Operator,
    /// Full access
    Admin,
}

fn default_bind() -> String { "127.0.0.1:18790".to_string() }
fn default_token_ttl() -> u64 { 3600 }

/// OpenAI-compatible chat backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Model used for title regeneration. Falls back to `default_model`.
    #[serde(default)]
    pub title_model: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            default_model: default_model(),
            title_model: None,
            request_timeout_secs: default_request_timeout(),
            retry: RetryConfig::default(),
        }
    }
}

impl ProviderConfig {
    pub fn title_model(&self) -> &str {
        self.title_model.as_deref().unwrap_or(&self.default_model)
    }
}

fn default_base_url() -> String { "https://api.openai.com/v1".to_string() }
fn default_model() -> String { "gpt-4o-mini".to_string() }
fn default_request_timeout() -> u64 { 300 }

/// Retry policy for opening a provider stream. Failures after the first
/// chunk are never retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 2 }
fn default_initial_backoff() -> u64 { 500 }
fn default_max_backoff() -> u64 { 8000 }

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
        }
    }
}

impl StoreConfig {
    /// Resolve the database path (expand ~).
    pub fn resolved_path(&self) -> PathBuf {
        if let Some(rest) = self.path.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(&self.path)
    }
}

fn default_store_path() -> String { "~/.threadloom/graphs.db".to_string() }

/// How a merge node combines its branches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMode {
    #[default]
    Full,
    Recent,
    Summary,
}

/// Defaults for synthesized merge nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    #[serde(default)]
    pub default_mode: MergeMode,
    #[serde(default = "default_recent_count")]
    pub recent_count: usize,
    /// Merge node position relative to the node it feeds.
    #[serde(default = "default_offset_x")]
    pub offset_x: f64,
    #[serde(default = "default_offset_y")]
    pub offset_y: f64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            default_mode: MergeMode::default(),
            recent_count: default_recent_count(),
            offset_x: default_offset_x(),
            offset_y: default_offset_y(),
        }
    }
}

fn default_recent_count() -> usize { 6 }
fn default_offset_x() -> f64 { -280.0 }
fn default_offset_y() -> f64 { 0.0 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String { "threadloom=info,warn".to_string() }

impl AppConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ThreadloomError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| ThreadloomError::Config(e.to_string()))
    }

    /// Load `path` if given, else the default location, else built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let default = default_config_path();
                if default.exists() {
                    Self::load(&default)
                } else {
                    debug!(path = %default.display(), "No config file, using built-in defaults");
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ThreadloomError::Config(e.to_string()))
    }
}

/// `~/.threadloom/config.toml`
pub fn default_config_path() -> PathBuf {
    dirs_home()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".threadloom")
        .join("config.toml")
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables stay literal
                Err(_) => {
                    warn!(var = %var_name, "Config references an unset environment variable");
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_THREADLOOM_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_THREADLOOM_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_THREADLOOM_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_THREADLOOM_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_THREADLOOM_VAR}\"");
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.gateway.bind, "127.0.0.1:18790");
        assert!(config.gateway.is_open());
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.merge.default_mode, MergeMode::Full);
        assert_eq!(config.merge.recent_count, 6);
        assert_eq!(config.log.filter, "threadloom=info,warn");
        assert_eq!(config.provider.title_model(), "gpt-4o-mini");
        assert_eq!(config.provider.retry.max_retries, 2);
    }

    #[test]
    fn test_full_config() {
        let toml_str = r#"
[gateway]
bind = "0.0.0.0:9000"
token_secret = "s3cret"

[[gateway.api_keys]]
name = "dashboard"
key = "tl-abc"
role = "viewer"

[provider]
base_url = "http://localhost:11434/v1"
default_model = "llama3"
title_model = "llama3-mini"

[store]
backend = "memory"

[merge]
default_mode = "recent"
recent_count = 3
offset_x = -100.0
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert!(!config.gateway.is_open());
        assert_eq!(config.gateway.api_keys[0].role, ApiKeyRole::Viewer);
        assert_eq!(config.provider.title_model(), "llama3-mini");
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.merge.default_mode, MergeMode::Recent);
        assert_eq!(config.merge.offset_x, -100.0);
        assert_eq!(config.merge.offset_y, 0.0);
    }

    #[test]
    fn test_to_toml_reloads() {
        let config = AppConfig::default();
        let text = config.to_toml().unwrap();
        let back: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.gateway.bind, config.gateway.bind);
    }
}
