use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rtunnel::forward::ForwardingExecutor;
use rtunnel::token::{TokenProvider, TokenSource};
use rtunnel::{ClientArgs, ClientConfig, Session};

#[tokio::main]
async fn main() -> Result<()> {
    // credentials usually live in .env; load it before clap reads env defaults
    let env_file = dotenvy::dotenv().ok();
    let args = ClientArgs::parse();

    let default_filter = if args.verbose {
        "rtunnel=debug,rtunnel_shared=debug"
    } else {
        "rtunnel=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    if let Some(path) = &env_file {
        info!(path = %path.display(), "loaded environment file");
    }

    let config = ClientConfig::from_args(&args)?;
    let endpoint = config.endpoint_url()?;
    let router = config.router()?;
    let tokens = TokenSource::from_env(args.bearer.clone()).context("Invalid token settings")?;
    let executor =
        ForwardingExecutor::new(config.forward_options()).context("Failed to build HTTP client")?;

    println!("\n╔══════════════════════════════════════════════════════════════╗");
    println!("║  🚀 RTunnel                                                  ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Relay:  {:<51} ║", endpoint.as_str());
    println!("║  Auth:   {:<51} ║", tokens.describe());
    for (pattern, target) in router.routes() {
        println!("║  {:<14} → {:<43} ║", pattern, target.as_str());
    }
    println!("╚══════════════════════════════════════════════════════════════╝\n");
    println!("Press Ctrl+C to stop the tunnel\n");

    let session = Session::new(
        endpoint,
        TokenProvider::new(tokens),
        router,
        executor,
        config.reconnect_delay(),
    );
    info!(channel_id = %session.channel_id(), "starting tunnel");

    session
        .run(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
}
