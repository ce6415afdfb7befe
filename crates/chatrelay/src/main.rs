//! chatrelay - local relay for Azure OpenAI chat completions

use std::path::PathBuf;

use clap::Parser;

use chatrelay::config::{Config, apply_env_overrides};
use chatrelay::error::Result;
use chatrelay::logging;
use chatrelay::relay::RelayServer;

/// chatrelay - OpenAI-compatible chat completions relayed to an Azure deployment
#[derive(Parser, Debug)]
#[command(name = "chatrelay")]
#[command(about = "An SSE-aware relay for Azure OpenAI chat completions")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Host to bind
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind
    #[arg(long, short = 'p')]
    pub port: Option<u16>,

    /// Egress proxy URL for upstream requests
    #[arg(long)]
    pub proxy: Option<String>,

    /// Upstream request timeout in seconds
    #[arg(long, value_name = "SECS", conflicts_with = "no_timeout")]
    pub timeout: Option<u64>,

    /// Disable the upstream request timeout
    #[arg(long)]
    pub no_timeout: bool,

    /// Log request and response headers (credentials redacted)
    #[arg(long)]
    pub log_headers: bool,

    /// Log request bodies and every upstream stream line
    #[arg(long)]
    pub log_bodies: bool,

    /// Directory for the log file
    #[arg(long, value_name = "DIR", conflicts_with = "no_log_file")]
    pub log_dir: Option<PathBuf>,

    /// Log to stdout only
    #[arg(long)]
    pub no_log_file: bool,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(proxy) = &self.proxy {
            config.upstream.proxy_url = Some(proxy.clone());
        }
        if let Some(timeout) = self.timeout {
            config.upstream.timeout_secs = timeout;
        }
        if self.no_timeout {
            config.upstream.timeout_secs = 0;
        }
        config.logging.log_headers |= self.log_headers;
        config.logging.log_bodies |= self.log_bodies;
        if let Some(dir) = &self.log_dir {
            config.log_file.dir = dir.clone();
        }
        if self.no_log_file {
            config.log_file.enabled = false;
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let dotenv = dotenvy::dotenv();

    let mut config = Config::load(cli.config.as_deref())?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    cli.apply(&mut config);

    // Flushes the log file on drop.
    let _guard = logging::init(&config.log_file);

    if let Ok(path) = dotenv {
        tracing::debug!("Loaded environment from {}", path.display());
    }
    tracing::debug!("Config loaded: {:?}", config);

    if config.upstream.api_key.is_empty() {
        tracing::warn!("No API key configured; upstream requests will likely be rejected");
    }

    let server = RelayServer::new(config);
    server.serve().await
}
