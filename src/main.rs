//! Keyed gateway entry point.
//!
//! Loads configuration, assembles the proxy and runs it alongside the
//! health server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keyed_gateway::config::GatewayConfig;
use keyed_gateway::health::start_health_server;
use keyed_gateway::{build_server, Gateway};

#[derive(Debug, Parser)]
#[command(name = "keyed-gateway", version, about)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON).
    #[arg(short, long, env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides the proxy listen address.
    #[arg(long)]
    listen: Option<String>,

    /// Overrides the health server listen address.
    #[arg(long)]
    health_listen: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = GatewayConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(health_listen) = cli.health_listen {
        config.health_listen = Some(health_listen);
    }

    tracing::info!("keyed-gateway starting");

    let gateway = Gateway::from_config(&config)?;
    let (proxy, pins) = gateway.into_parts();
    for pending in pins.pending() {
        tracing::warn!(pin = pending.as_str(), "pinned server not published");
    }

    if let Some(health_listen) = &config.health_listen {
        let addr: SocketAddr = health_listen
            .parse()
            .with_context(|| format!("invalid health listen address '{health_listen}'"))?;
        let pins = Arc::new(pins);
        std::thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    tracing::error!(error = %e, "failed to start health runtime");
                    return;
                }
            };
            if let Err(e) = runtime.block_on(start_health_server(addr, pins)) {
                tracing::error!(error = %e, "health server stopped");
            }
        });
    }

    build_server(proxy, &config.listen)?.run_forever()
}
