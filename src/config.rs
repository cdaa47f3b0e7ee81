//! Configuration loading for the `skald` CLI.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. `--config <path>` (CLI flag)
//! 2. `~/.skald/config.toml` (user)
//! 3. `/etc/skald/config.toml` (system)
//!
//! Built-in defaults apply when no file exists.
//!
//! Secrets are loaded separately with mandatory permission checks:
//! 1. `~/.skald/secrets.toml` (user, must be 0600)
//! 2. `/etc/skald/secrets.toml` (system, must be 0600)

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::backend::{DEFAULT_BASE_URL, DEFAULT_MODEL, RetryConfig};
use crate::cache::CacheConfig;
use crate::dispatcher::SkaldBuilder;
use crate::registry::{FunctionDefinition, FunctionDescriptor};
use crate::session::SessionConfig;
use crate::sink::JsonlSink;
use crate::{Result, Skald, SkaldError};

/// CLI configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub streaming: StreamingSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub history: HistorySection,
    /// Additional functions, registered after the built-in ones.
    #[serde(default)]
    pub functions: Vec<FunctionDefinition>,
}

/// Backend connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendSection {
    /// OpenAI-compatible base URL (default: DeepSeek).
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Model used when a function names none (default: deepseek-chat).
    #[serde(default = "default_model")]
    pub model: String,
    /// Synchronous request timeout in seconds (default: 120).
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            timeout_secs: default_timeout(),
        }
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_timeout() -> u64 {
    120
}

/// Response cache settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_max_entries(),
            ttl_secs: default_ttl(),
        }
    }
}

impl From<&CacheSection> for CacheConfig {
    fn from(section: &CacheSection) -> Self {
        CacheConfig::new()
            .enabled(section.enabled)
            .max_entries(section.max_entries)
            .ttl(Duration::from_secs(section.ttl_secs))
    }
}

fn default_true() -> bool {
    true
}

fn default_max_entries() -> usize {
    1000
}

fn default_ttl() -> u64 {
    3600
}

/// Streaming session limits.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamingSection {
    #[serde(default = "default_max_streams")]
    pub max_concurrent_streams: usize,
    #[serde(default = "default_stream_timeout")]
    pub stream_timeout_secs: u64,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_reap")]
    pub reap_interval_secs: u64,
}

impl Default for StreamingSection {
    fn default() -> Self {
        Self {
            max_concurrent_streams: default_max_streams(),
            stream_timeout_secs: default_stream_timeout(),
            heartbeat_interval_secs: default_heartbeat(),
            reap_interval_secs: default_reap(),
        }
    }
}

impl From<&StreamingSection> for SessionConfig {
    fn from(section: &StreamingSection) -> Self {
        SessionConfig::new()
            .max_concurrent_streams(section.max_concurrent_streams)
            .stream_timeout(Duration::from_secs(section.stream_timeout_secs))
            .heartbeat_interval(Duration::from_secs(section.heartbeat_interval_secs.max(1)))
            .reap_interval(Duration::from_secs(section.reap_interval_secs.max(1)))
    }
}

fn default_max_streams() -> usize {
    100
}

fn default_stream_timeout() -> u64 {
    300
}

fn default_heartbeat() -> u64 {
    30
}

fn default_reap() -> u64 {
    60
}

/// Backend retry settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl From<&RetrySection> for RetryConfig {
    fn from(section: &RetrySection) -> Self {
        RetryConfig::new()
            .max_attempts(section.max_attempts)
            .initial_delay(Duration::from_millis(section.initial_delay_ms))
            .max_delay(Duration::from_millis(section.max_delay_ms))
    }
}

fn default_attempts() -> u32 {
    3
}

fn default_initial_delay() -> u64 {
    500
}

fn default_max_delay() -> u64 {
    30_000
}

/// Execution history settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistorySection {
    /// JSON-lines file receiving one record per execution. Off when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// Resolution order:
    /// 1. Explicit path (if provided, must exist)
    /// 2. `~/.skald/config.toml`
    /// 3. `/etc/skald/config.toml`
    ///
    /// Falls back to defaults when no file is found.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        match Self::resolve_config_path(explicit_path)? {
            Some(path) => Self::load_from_file(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            SkaldError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            SkaldError::Configuration(format!("Failed to parse config file {path:?}: {e}"))
        })
    }

    fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(Some(path.to_path_buf()));
            }
            return Err(SkaldError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".skald").join("config.toml");
            if user_config.exists() {
                return Ok(Some(user_config));
            }
        }

        let system_config = PathBuf::from("/etc/skald/config.toml");
        if system_config.exists() {
            return Ok(Some(system_config));
        }

        Ok(None)
    }

    /// A dispatcher builder for the OpenAI-compatible backend, with every
    /// configured section and function applied.
    pub fn builder(&self, api_key: impl Into<String>) -> SkaldBuilder {
        let mut builder = Skald::builder()
            .openai(api_key, Some(self.backend.base_url.clone()))
            .default_model(self.backend.model.clone())
            .timeout(Duration::from_secs(self.backend.timeout_secs))
            .cache(CacheConfig::from(&self.cache))
            .sessions(SessionConfig::from(&self.streaming))
            .retry(RetryConfig::from(&self.retry));
        if let Some(ref path) = self.history.path {
            builder = builder.sink(Arc::new(JsonlSink::new(path.clone())));
        }
        for def in &self.functions {
            builder = builder.function(FunctionDescriptor::from(def.clone()));
        }
        builder
    }
}

/// API credentials.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Secrets {
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Environment variables consulted, in order, when no secrets file sets a key.
const API_KEY_ENV_VARS: &[&str] = &["SKALD_API_KEY", "DEEPSEEK_API_KEY"];

impl Secrets {
    /// Load secrets from the standard locations with permission checks.
    ///
    /// Returns empty secrets if no file exists (the key may come from the
    /// environment instead).
    pub fn load() -> Result<Self> {
        if let Some(home) = dirs::home_dir() {
            let user_secrets = home.join(".skald").join("secrets.toml");
            if user_secrets.exists() {
                return Self::load_from_file(&user_secrets);
            }
        }

        let system_secrets = PathBuf::from("/etc/skald/secrets.toml");
        if system_secrets.exists() {
            return Self::load_from_file(&system_secrets);
        }

        Ok(Secrets::default())
    }

    /// Load a specific secrets file, enforcing owner-only permissions.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        Self::check_permissions(path)?;
        let content = fs::read_to_string(path).map_err(|e| {
            SkaldError::Configuration(format!("Failed to read secrets file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            SkaldError::Configuration(format!("Failed to parse secrets file {path:?}: {e}"))
        })
    }

    /// Check that the secrets file has secure permissions (0600 or 0400).
    #[cfg(unix)]
    fn check_permissions(path: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let metadata = fs::metadata(path).map_err(|e| {
            SkaldError::Configuration(format!("Failed to stat secrets file {path:?}: {e}"))
        })?;

        let mode = metadata.permissions().mode();
        if mode & 0o077 != 0 {
            return Err(SkaldError::Configuration(format!(
                "Secrets file {path:?} has insecure permissions {:o}. Must be 0600 or 0400.",
                mode & 0o777
            )));
        }

        Ok(())
    }

    #[cfg(not(unix))]
    fn check_permissions(_path: &Path) -> Result<()> {
        Ok(())
    }

    /// The API key, falling back to `SKALD_API_KEY` then `DEEPSEEK_API_KEY`.
    pub fn api_key(&self) -> Option<String> {
        self.api_key.clone().or_else(|| {
            API_KEY_ENV_VARS
                .iter()
                .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
        })
    }
}
