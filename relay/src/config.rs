//! Configuration for RTunnel Relay
//!
//! Values come from an optional YAML file, then command-line flags and
//! environment variables override them.

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::{DEFAULT_ASSERTION_HEADER, DEFAULT_VERIFY_URL};

#[derive(Parser, Debug, Default)]
#[command(name = "rtunnel-relay")]
#[command(version)]
#[command(about = "Public relay for RTunnel reverse tunnels", long_about = None)]
pub struct RelayArgs {
    /// YAML configuration file
    #[arg(short, long, env = "RTUNNEL_RELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    pub listen: Option<IpAddr>,

    /// Port to listen on
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Seconds to wait for the client's response
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Maximum request body size in bytes
    #[arg(long)]
    pub body_limit: Option<usize>,

    /// Path clients connect their tunnel to
    #[arg(long)]
    pub tunnel_path: Option<String>,

    /// Require tunnel clients to present a verified identity token
    #[arg(long)]
    pub require_auth: bool,

    /// Expected audience of client identity tokens
    #[arg(long, env = "RTUNNEL_AUDIENCE")]
    pub audience: Option<String>,

    /// Token-info endpoint used to verify identity tokens
    #[arg(long)]
    pub verify_url: Option<String>,

    /// Header carrying an identity assertion validated upstream
    #[arg(long)]
    pub assertion_header: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_listen")]
    pub listen: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Per-request deadline in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Request body ceiling in bytes
    #[serde(default = "default_body_limit")]
    pub body_limit: usize,

    /// WebSocket upgrades here attach a client; plain requests are relayed
    #[serde(default = "default_tunnel_path")]
    pub tunnel_path: String,

    /// Time a new connection has to answer `init_request`
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Close a tunnel that has sent nothing, pings included, for this long
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default)]
    pub auth: AuthConfig,
}

/// Tunnel admission settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Verify bearer tokens on tunnel connections
    #[serde(default)]
    pub enabled: bool,

    pub audience: Option<String>,

    #[serde(default = "default_verify_url")]
    pub verify_url: String,

    #[serde(default = "default_assertion_header")]
    pub assertion_header: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            audience: None,
            verify_url: default_verify_url(),
            assertion_header: default_assertion_header(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            timeout_secs: default_timeout_secs(),
            body_limit: default_body_limit(),
            tunnel_path: default_tunnel_path(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            auth: AuthConfig::default(),
        }
    }
}

fn default_listen() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    7000
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_body_limit() -> usize {
    10 * 1024 * 1024
}

fn default_tunnel_path() -> String {
    "/_tunnel".to_string()
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_verify_url() -> String {
    DEFAULT_VERIFY_URL.to_string()
}

fn default_assertion_header() -> String {
    DEFAULT_ASSERTION_HEADER.to_string()
}

impl RelayConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: RelayConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Build the effective configuration: file first, flags on top.
    pub fn from_args(args: &RelayArgs) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };

        if let Some(listen) = args.listen {
            config.listen = listen;
        }
        if let Some(port) = args.port {
            config.port = port;
        }
        if let Some(secs) = args.timeout_secs {
            config.timeout_secs = secs;
        }
        if let Some(limit) = args.body_limit {
            config.body_limit = limit;
        }
        if let Some(path) = &args.tunnel_path {
            config.tunnel_path = path.clone();
        }
        if args.require_auth {
            config.auth.enabled = true;
        }
        if let Some(aud) = &args.audience {
            config.auth.audience = Some(aud.clone());
        }
        if let Some(url) = &args.verify_url {
            config.auth.verify_url = url.clone();
        }
        if let Some(header) = &args.assertion_header {
            config.auth.assertion_header = header.clone();
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            anyhow::bail!("timeout_secs must be greater than zero");
        }
        if self.handshake_timeout_secs == 0 {
            anyhow::bail!("handshake_timeout_secs must be greater than zero");
        }
        if self.idle_timeout_secs == 0 {
            anyhow::bail!("idle_timeout_secs must be greater than zero");
        }
        if self.body_limit == 0 {
            anyhow::bail!("body_limit must be greater than zero");
        }
        if !self.tunnel_path.starts_with('/') {
            anyhow::bail!("tunnel_path '{}' must start with '/'", self.tunnel_path);
        }
        if self.auth.assertion_header.is_empty() {
            anyhow::bail!("assertion_header cannot be empty");
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}
