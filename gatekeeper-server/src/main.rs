// SPDX-License-Identifier: MIT
//
// GateKeeper: Remotely-Controlled Firewall Gatekeeper
//
// https://github.com/gatekeeper-fw/gatekeeper

//! GateKeeper control-plane server
//!
//! Listens for operator connections on an authenticated and optionally
//! encrypted TCP control channel and applies port rules through the
//! configured firewall driver.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   control    ┌──────────────┐   rules    ┌──────────────┐
//! │   Operator   │ ────────────>│  GateKeeper  │ ──────────>│   Firewall   │
//! │   / Client   │    (TCP)     │    Server    │  (driver)  │   Backend    │
//! └──────────────┘              └──────────────┘            └──────────────┘
//! ```
//!
//! # Features
//!
//! - Two-stage authentication (key exchange + hashed access-key proof)
//! - Salt-chained encrypted channel without on-wire IVs
//! - Per-remote abuse tracking with a temporary blocklist
//! - Pluggable firewall drivers (mock, iptables)
//! - Graceful shutdown on Ctrl-C

use anyhow::{Context, Result};
use clap::Parser;
use gatekeeper_core::config::ServerConfig;
use gatekeeper_core::server::Server;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "gatekeeper-server")]
#[command(about = "GateKeeper - Remotely-controlled firewall gatekeeper", long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    info!("GateKeeper server v{}", env!("CARGO_PKG_VERSION"));

    info!("Loading configuration from environment variables");
    let config = ServerConfig::from_env().context("Failed to load configuration from environment")?;

    info!("Listen address: {}:{}", config.listen_address, config.listen_port);
    info!("Driver: {}", config.driver);
    info!("Secure channel: {}", config.secure);
    if config.allow_all_ports {
        info!("Allowed ports: all");
    } else {
        info!("Allowed ports: {:?}", config.allowed_ports);
    }

    let driver = Server::resolve_driver(&config.driver)?;
    let server = Server::bind(config, driver)
        .await
        .context("Failed to start server")?;

    // Handle Ctrl+C for graceful shutdown
    let cancel = server.cancellation_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down");
                cancel.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    server.run().await?;
    Ok(())
}
