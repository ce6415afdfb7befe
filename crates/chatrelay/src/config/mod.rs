mod env;

pub use env::apply_env_overrides;

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{RelayError, Result};

/// Main configuration structure for chatrelay
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Local HTTP listener configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Remote chat-completion API configuration
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Streaming relay behaviour
    #[serde(default)]
    pub relay: RelayConfig,
    /// Verbose logging toggles
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Log file output
    #[serde(default)]
    pub log_file: LogFileConfig,
}

impl Config {
    /// Load configuration from an explicit path, or from the first default
    /// location that exists, falling back to built-in defaults.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = config_path {
            tracing::info!("Loading config from: {}", path.display());
            return Self::from_file(path);
        }

        let default_paths = [
            dirs::home_dir().map(|h| h.join(".chatrelay").join("config.toml")),
            dirs::config_dir().map(|c| c.join("chatrelay").join("config.toml")),
            Some(PathBuf::from("config.toml")),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                tracing::info!("Loading config from: {}", path.display());
                return Self::from_file(path);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Config::default())
    }

    /// Parse a TOML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        toml::from_str(&content)
            .map_err(|e| RelayError::Config(format!("Failed to parse config: {e}")))
    }
}

/// HTTP listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind
    #[serde(default = "default_port")]
    pub port: u16,
}

impl ServerConfig {
    /// `host:port` form suitable for parsing into a socket address
    pub fn listen_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

/// Azure OpenAI deployment the relay forwards to
#[derive(Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base endpoint, e.g. `https://my-resource.openai.azure.com`
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Deployment name
    #[serde(default = "default_deployment")]
    pub deployment: String,
    /// Value sent in the `api-key` header
    #[serde(default)]
    pub api_key: String,
    /// `api-version` query parameter
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Overall request timeout in seconds; 0 disables the timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Optional egress proxy URL
    #[serde(default)]
    pub proxy_url: Option<String>,
}

impl UpstreamConfig {
    /// Overall per-request timeout, `None` when disabled
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            deployment: default_deployment(),
            api_key: String::new(),
            api_version: default_api_version(),
            timeout_secs: default_timeout_secs(),
            proxy_url: None,
        }
    }
}

// The api key never reaches log output.
impl fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("endpoint", &self.endpoint)
            .field("deployment", &self.deployment)
            .field(
                "api_key",
                &if self.api_key.is_empty() {
                    "<unset>"
                } else {
                    "<redacted>"
                },
            )
            .field("api_version", &self.api_version)
            .field("timeout_secs", &self.timeout_secs)
            .field("proxy_url", &self.proxy_url)
            .finish()
    }
}

fn default_endpoint() -> String {
    "https://fillme.net".to_string()
}

fn default_deployment() -> String {
    "o4-mini".to_string()
}

fn default_api_version() -> String {
    "2024-05-01".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

/// Streaming relay tuning
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Transient stream failures tolerated per session
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Frames buffered toward a slow client before upstream reads pause
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_channel_capacity() -> usize {
    16
}

/// Verbose logging toggles
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct LoggingConfig {
    /// Log inbound request headers and upstream response headers
    #[serde(default)]
    pub log_headers: bool,
    /// Log request bodies and every upstream stream line
    #[serde(default)]
    pub log_bodies: bool,
}

/// Log file output; stdout logging is always on
#[derive(Debug, Clone, Deserialize)]
pub struct LogFileConfig {
    /// Also write logs to `<dir>/chatrelay.log`
    #[serde(default = "default_log_file_enabled")]
    pub enabled: bool,
    /// Directory holding the log file, created on startup
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
}

impl Default for LogFileConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_file_enabled(),
            dir: default_log_dir(),
        }
    }
}

fn default_log_file_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}
