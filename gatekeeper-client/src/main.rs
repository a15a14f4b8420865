// SPDX-License-Identifier: MIT
//
// GateKeeper: Remotely-Controlled Firewall Gatekeeper
//
// https://github.com/gatekeeper-fw/gatekeeper

//! Command-line client for the GateKeeper control channel
//!
//! Connects, runs the key exchange when the channel is secure, logs in with
//! the shared access key, then either executes one command and exits or
//! reads commands interactively from stdin.
//!
//! The access key is taken from `GATEKEEPER_ACCESS_KEY`; it never appears
//! on the command line.

use anyhow::{bail, Context, Result};
use clap::Parser;
use gatekeeper_core::client::Client;
use gatekeeper_core::config::ClientConfig;
use gatekeeper_core::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "gatekeeper-client")]
#[command(about = "GateKeeper client - Manage firewall rules over the control channel", long_about = None)]
struct Args {
    /// Server host name or address
    #[arg(short, long, default_value = "127.0.0.1")]
    server: String,

    /// Server control port
    #[arg(short, long, default_value_t = 2243)]
    port: u16,

    /// Skip the key exchange and talk in the clear
    #[arg(long)]
    plain: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    /// Command to execute (e.g. `block 2223`); interactive when omitted
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::WARN);

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let access_key = std::env::var("GATEKEEPER_ACCESS_KEY")
        .context("GATEKEEPER_ACCESS_KEY must be set")?;

    let config = ClientConfig {
        server_address: args.server.clone(),
        server_port: args.port,
        access_key,
        secure: !args.plain,
    };

    let client = Client::connect_and_login(&config)
        .await
        .context("Failed to connect and log in")?;
    info!(server = %args.server, port = args.port, "Logged in");

    if args.command.is_empty() {
        interactive(&client).await
    } else {
        let cmd = args.command[0].clone();
        let rest = args.command[1..].join(" ");
        let output = execute(&client, &cmd, &rest).await?;
        println!("{}", output);
        Ok(())
    }
}

/// Run one command through the typed client API
async fn execute(client: &Client, cmd: &str, args: &str) -> Result<String> {
    let out = match (cmd, args) {
        ("list", "ports") => {
            let ports = client.list_blocked_tcp_ports().await?;
            format!(
                "blocked: {}",
                ports
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        }
        ("list", "accepts") => {
            let accepts = client.list_accepted_addresses_on_tcp_ports().await?;
            accepts
                .iter()
                .map(|(addr, port)| format!("{}:{}", addr, port))
                .collect::<Vec<_>>()
                .join("; ")
        }
        ("block", port) => {
            let port = parse_port(port)?;
            format!("block: {}", client.block_tcp_port(port).await?)
        }
        ("unblock", port) => {
            let port = parse_port(port)?;
            format!("unblock: {}", client.unblock_tcp_port(port).await?)
        }
        ("accept", rest) => {
            let (addr, port) = split_addr_port(rest)?;
            let port = port.context("accept needs an address and a port")?;
            format!(
                "accepted: {}",
                client.accept_address_on_tcp_port(&addr, port).await?
            )
        }
        ("unaccept", rest) => {
            let (addr, port) = split_addr_port(rest)?;
            format!(
                "unaccepted: {}",
                client.unaccept_address_on_tcp_port(&addr, port).await?
            )
        }
        ("disconnect", _) => format!("disconnect: {}", client.disconnect().await?),
        _ => bail!("Unknown command '{} {}'", cmd, args),
    };
    Ok(out)
}

/// Read commands from stdin until EOF or `quit`
async fn interactive(client: &Client) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("Connected; commands: list ports | list accepts | block P | unblock P | accept A P | unaccept A [P] | disconnect | quit");

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" || line == "exit" {
            break;
        }

        let (cmd, args) = line.split_once(' ').unwrap_or((line, ""));
        match execute(client, cmd, args).await {
            Ok(output) => println!("{}", output),
            Err(e) => match e.downcast_ref::<Error>() {
                Some(Error::Timeout) => println!("no response"),
                _ => println!("error: {}", e),
            },
        }
        if cmd == "disconnect" {
            break;
        }
    }
    Ok(())
}

fn parse_port(s: &str) -> Result<u16> {
    s.trim()
        .parse::<u16>()
        .with_context(|| format!("Invalid port '{}'", s))
}

fn split_addr_port(s: &str) -> Result<(String, Option<u16>)> {
    let mut parts = s.split_whitespace();
    let addr = parts.next().context("Missing address")?.to_string();
    let port = match parts.next() {
        Some(p) => Some(parse_port(p)?),
        None => None,
    };
    Ok((addr, port))
}
