use anyhow::{Context, Result};
use axum::http::HeaderName;
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rtunnel_relay::auth::{AuthGate, TokenInfoVerifier, TokenVerifier};
use rtunnel_relay::{app, AppState, RelayArgs, RelayConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let args = RelayArgs::parse();

    let default_filter = if args.verbose {
        "rtunnel_relay=debug,rtunnel_shared=debug"
    } else {
        "rtunnel_relay=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = RelayConfig::from_args(&args)?;
    let auth = build_auth_gate(&config)?;

    let state = AppState::new(&config, auth);
    let router = app(state, &config.tunnel_path);

    let addr = config.addr();
    info!(
        "RTunnel Relay on {} (tunnel: {}, timeout: {}s, auth: {})",
        addr,
        config.tunnel_path,
        config.timeout_secs,
        if config.auth.enabled { "required" } else { "open" }
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;
    Ok(())
}

fn build_auth_gate(config: &RelayConfig) -> Result<AuthGate> {
    let assertion_header = HeaderName::from_bytes(config.auth.assertion_header.as_bytes())
        .context("invalid assertion header name")?;

    let verifier: Option<Arc<dyn TokenVerifier>> = if config.auth.enabled {
        let verifier = TokenInfoVerifier::new(&config.auth.verify_url, config.auth.audience.clone())
            .context("Failed to build token verifier")?;
        Some(Arc::new(verifier))
    } else {
        None
    };

    Ok(AuthGate::new(verifier, assertion_header))
}
