//! Configuration for the RTunnel client
//!
//! Routes come from repeated `--pattern`/`--target` flags or from the
//! `routes` list in rtunnel.yml. Flags win when both are given.

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::forward::ForwardOptions;
use crate::router::TargetRouter;

pub const DEFAULT_ENDPOINT: &str = "ws://localhost:7000/_tunnel";
pub const DEFAULT_TARGET: &str = "http://localhost:3010";
const DEFAULT_TUNNEL_PATH: &str = "/_tunnel";

#[derive(Parser, Debug, Default)]
#[command(name = "rtunnel")]
#[command(author = "RTunnel Team")]
#[command(version)]
#[command(about = "Expose local HTTP services through an RTunnel relay", long_about = None)]
pub struct ClientArgs {
    /// Relay tunnel endpoint (ws, wss, http or https)
    #[arg(short, long, env = "RTUNNEL_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Path pattern, paired by position with --target
    #[arg(short, long = "pattern")]
    pub patterns: Vec<String>,

    /// Target base URL, paired by position with --pattern
    #[arg(short, long = "target")]
    pub targets: Vec<String>,

    /// Fixed bearer token for the tunnel connection
    #[arg(long, env = "BEARER_TOKEN", hide_env_values = true)]
    pub bearer: Option<String>,

    /// Log every relayed request
    #[arg(long)]
    pub dump_request: bool,

    /// Log every target response
    #[arg(long)]
    pub dump_response: bool,

    /// Forward the public Host header to targets
    #[arg(long)]
    pub preserve_host: bool,

    /// Seconds to wait before reconnecting
    #[arg(long)]
    pub reconnect_delay_secs: Option<u64>,

    /// Seconds a target has to answer
    #[arg(long)]
    pub upstream_timeout_secs: Option<u64>,

    /// YAML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Ordered routes; the first matching pattern wins
    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    #[serde(default)]
    pub dump_request: bool,

    #[serde(default)]
    pub dump_response: bool,

    #[serde(default)]
    pub preserve_host: bool,

    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,
}

/// Single route definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// May be omitted when only one route is configured
    #[serde(default)]
    pub pattern: String,
    pub target: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            routes: Vec::new(),
            dump_request: false,
            dump_response: false,
            preserve_host: false,
            reconnect_delay_secs: default_reconnect_delay_secs(),
            upstream_timeout_secs: default_upstream_timeout_secs(),
        }
    }
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_upstream_timeout_secs() -> u64 {
    60
}

impl ClientConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ClientConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Build the effective configuration: file first, flags on top.
    pub fn from_args(args: &ClientArgs) -> Result<Self> {
        let path = args.config.clone().or_else(Self::find_config);
        let mut config = match path {
            Some(path) => Self::load(&path)?,
            None => Self::default(),
        };

        if let Some(endpoint) = &args.endpoint {
            config.endpoint = endpoint.clone();
        }
        if !args.patterns.is_empty() || !args.targets.is_empty() {
            if args.patterns.len() > args.targets.len() {
                anyhow::bail!(
                    "number of pattern({}) and target({}) does not match",
                    args.patterns.len(),
                    args.targets.len()
                );
            }
            let patterns = args.patterns.iter().map(Some).chain(std::iter::repeat(None));
            config.routes = args
                .targets
                .iter()
                .zip(patterns)
                .map(|(target, pattern)| RouteConfig {
                    pattern: pattern.cloned().unwrap_or_default(),
                    target: target.clone(),
                })
                .collect();
        }
        config.dump_request |= args.dump_request;
        config.dump_response |= args.dump_response;
        config.preserve_host |= args.preserve_host;
        if let Some(secs) = args.reconnect_delay_secs {
            config.reconnect_delay_secs = secs;
        }
        if let Some(secs) = args.upstream_timeout_secs {
            config.upstream_timeout_secs = secs;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        self.endpoint_url()?;
        self.router()?;
        if self.upstream_timeout_secs == 0 {
            anyhow::bail!("upstream_timeout_secs must be greater than zero");
        }
        Ok(())
    }

    /// Relay endpoint as a WebSocket URL. http(s) becomes ws(s) and a bare
    /// host gets the default tunnel path.
    pub fn endpoint_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.endpoint)
            .with_context(|| format!("Invalid endpoint '{}'", self.endpoint))?;

        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => anyhow::bail!("Unsupported endpoint scheme '{}'", other),
        };
        if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
            anyhow::bail!("Cannot use endpoint '{}'", self.endpoint);
        }
        if url.path().is_empty() || url.path() == "/" {
            url.set_path(DEFAULT_TUNNEL_PATH);
        }
        Ok(url)
    }

    /// Build the target router. With nothing configured, everything goes to
    /// the default local target.
    pub fn router(&self) -> Result<TargetRouter> {
        if self.routes.is_empty() {
            let target = parse_target(DEFAULT_TARGET)?;
            return Ok(TargetRouter::new(Vec::new(), vec![target])?);
        }

        let mut patterns = Vec::with_capacity(self.routes.len());
        let mut targets = Vec::with_capacity(self.routes.len());
        for route in &self.routes {
            targets.push(parse_target(&route.target)?);
            if !route.pattern.is_empty() {
                patterns.push(route.pattern.clone());
            }
        }
        Ok(TargetRouter::new(patterns, targets)?)
    }

    pub fn forward_options(&self) -> ForwardOptions {
        ForwardOptions {
            dump_request: self.dump_request,
            dump_response: self.dump_response,
            preserve_host: self.preserve_host,
            timeout: Duration::from_secs(self.upstream_timeout_secs),
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = ["rtunnel.yml", "rtunnel.yaml", ".rtunnel.yml", ".rtunnel.yaml"];

        // Check current directory
        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        // Check home directory
        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}

fn parse_target(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).with_context(|| format!("Invalid target '{}'", raw))?;
    match url.scheme() {
        "http" | "https" if url.has_host() => Ok(url),
        _ => anyhow::bail!("Target '{}' must be an absolute http(s) URL", raw),
    }
}
