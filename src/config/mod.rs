//! Configuration management for chatpipe
//!
//! Loaded once in `main` from a TOML file, overlaid with environment
//! variables, then handed to the server by value. Nothing here is global.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub auth: AuthConfig,
    pub limits: LimitsConfig,
    pub upstream: UpstreamConfig,
    pub enrich: EnrichConfig,
    pub assembler: AssemblerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Seconds between SSE keep-alive comments while upstream is silent (0 disables)
    pub keepalive_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            keepalive_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file; defaults to `chatpipe.db` in the data directory
    pub path: Option<PathBuf>,
}

/// Static bearer tokens standing in for the external identity service
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// token -> user id
    pub tokens: HashMap<String, i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Messages per window for users without an explicit limit
    pub default_rate_limit: i64,
    pub window_secs: u64,
    /// Token bucket in front of OpenAI-style calls
    pub openai_rps: f64,
    pub openai_burst: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_rate_limit: 100,
            window_secs: 600,
            openai_rps: 10.0,
            openai_burst: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub timeout_secs: u64,
    pub max_stream_iterations: usize,
    pub socks_proxy_host: Option<String>,
    pub socks_proxy_port: Option<u16>,
    /// Replaces the OpenAI base URL when set
    pub reverse_proxy: Option<String>,
    /// Switches OpenAI-style models into Azure mode
    pub azure_resource_name: Option<String>,
    pub azure_api_version: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            max_stream_iterations: 10_000,
            socks_proxy_host: None,
            socks_proxy_port: None,
            reverse_proxy: None,
            azure_resource_name: None,
            azure_api_version: "2024-02-01".to_string(),
        }
    }
}

impl UpstreamConfig {
    /// `socks5h://host:port` when both halves are configured
    pub fn socks_proxy_url(&self) -> Option<String> {
        match (&self.socks_proxy_host, self.socks_proxy_port) {
            (Some(host), Some(port)) if !host.is_empty() => {
                Some(format!("socks5h://{}:{}", host, port))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichConfig {
    pub title_model: String,
    pub timeout_secs: u64,
    /// How long a streaming request waits for suggested questions before closing
    pub suggestions_wait_secs: u64,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            title_model: "gemini-2.0-flash".to_string(),
            timeout_secs: 20,
            suggestions_wait_secs: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblerConfig {
    pub artifact_instructions: bool,
    pub default_max_length: usize,
    /// Messages above this many tokens may be replaced by a stored summary
    pub summarize_threshold: i64,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            artifact_instructions: true,
            default_max_length: 10,
            summarize_threshold: 300,
        }
    }
}

impl Config {
    /// Load configuration from `path`, or the default location when `None`
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config: {}", config_path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Invalid config: {}", config_path.display()))?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        if let Ok(p) = std::env::var("CHATPIPE_CONFIG") {
            return Ok(PathBuf::from(p));
        }
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "chatpipe") {
            Ok(proj_dirs.config_dir().join("config.toml"))
        } else {
            Ok(PathBuf::from("config.toml"))
        }
    }

    /// Resolved database path
    pub fn database_path(&self) -> Result<PathBuf> {
        if let Some(p) = &self.store.path {
            return Ok(p.clone());
        }
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "chatpipe") {
            let data_dir = proj_dirs.data_dir();
            std::fs::create_dir_all(data_dir)?;
            Ok(data_dir.join("chatpipe.db"))
        } else {
            Ok(PathBuf::from("chatpipe.db"))
        }
    }

    /// Overlay process environment variables
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(host) = non_empty("SOCKS_PROXY_HOST") {
            self.upstream.socks_proxy_host = Some(host);
        }
        if let Some(port) = non_empty("SOCKS_PROXY_PORT") {
            match port.trim().parse() {
                Ok(p) => self.upstream.socks_proxy_port = Some(p),
                Err(_) => tracing::warn!("Ignoring invalid SOCKS_PROXY_PORT '{}'", port),
            }
        }
        if let Some(proxy) = non_empty("API_REVERSE_PROXY") {
            self.upstream.reverse_proxy = Some(proxy);
        }
        if let Some(name) = non_empty("AZURE_RESOURCE_NAME") {
            self.upstream.azure_resource_name = Some(name);
        }
        if let Some(limit) = non_empty("RATE_LIMIT_DEFAULT") {
            match limit.trim().parse() {
                Ok(l) => self.limits.default_rate_limit = l,
                Err(_) => tracing::warn!("Ignoring invalid RATE_LIMIT_DEFAULT '{}'", limit),
            }
        }
        if let Some(db) = non_empty("CHATPIPE_DB") {
            self.store.path = Some(PathBuf::from(db));
        }
    }

    /// Render as TOML (used by `chatpipe config`)
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
