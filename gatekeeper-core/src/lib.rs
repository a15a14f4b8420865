// SPDX-License-Identifier: MIT
//
// GateKeeper: Remotely-Controlled Firewall Gatekeeper
//
// https://github.com/gatekeeper-fw/gatekeeper

//! GateKeeper Core Library
//!
//! This crate provides the control-plane server and client for the GateKeeper
//! firewall gatekeeper. An operator (or an automation client) can list, add,
//! and remove per-port TCP drop rules and per-(address, port) accept
//! exceptions on a host through an authenticated and optionally encrypted TCP
//! control channel. Enforcement is delegated to a pluggable firewall driver.
//!
//! # Architecture
//!
//! The library is organized into modules representing core concerns:
//! - `crypto`: Cryptographic primitives (PBKDF2, AES-CBC, SHA-2)
//! - `cipher`: Static and salt-chained symmetric message channels
//! - `codec`: Line framing and the secure envelope
//! - `connection`: Per-connection state machine and command dispatch
//! - `guard`: Per-remote abuse counters and the temporary blocklist
//! - `driver`: Abstract firewall rule engine with in-memory implementations
//! - `iptables`: Concrete driver shelling out to the iptables CLI
//! - `server`: Accept loop and handler supervision
//! - `client`: Client-side protocol mirror with single-flight requests
//! - `config`: Configuration management with validation
//! - `error`: Unified error types

pub mod cipher;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod driver;
pub mod error;
pub mod guard;
pub mod iptables;
pub mod server;

pub use error::{Error, Result};

/// Library version, reported in the `login: true` reply
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Per-connection accumulation buffer cap in octets
pub const MAX_LINE_BYTES: usize = 1024;

/// Minimum access key length in octets
pub const MIN_ACCESS_KEY_LEN: usize = 32;

/// Ports below this value are rejected as malformed input
pub const MIN_TCP_PORT: u16 = 10;

/// Fixed delay before every login attempt is evaluated
pub const LOGIN_DELAY_MS: u64 = 300;

/// A connection that has not logged in within this window is closed
pub const LOGIN_TIMEOUT_SECS: u64 = 30;

/// How long the client waits for a reply before clearing the pending slot
pub const REPLY_TIMEOUT_SECS: u64 = 30;
