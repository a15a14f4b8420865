// SPDX-License-Identifier: MIT
//
// GateKeeper: Remotely-Controlled Firewall Gatekeeper
//
// https://github.com/gatekeeper-fw/gatekeeper

//! Control-plane server: accept loop and handler supervision
//!
//! One task per accepted connection. Handler faults are logged and counted
//! but never terminate the server. Shutdown closes the listener; handlers
//! already running close on their own through their state machine.

use crate::cipher::static_key_from_access_key;
use crate::config::ServerConfig;
use crate::connection::ConnectionHandler;
use crate::crypto::AES_KEY_LEN;
use crate::driver::{FirewallDriver, MockDriver};
use crate::guard::AbuseGuard;
use crate::iptables::IptablesDriver;
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Accept-loop counters, reported at shutdown
#[derive(Debug, Default)]
pub struct ServerStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    faulted: AtomicU64,
}

impl ServerStats {
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn faulted(&self) -> u64 {
        self.faulted.load(Ordering::Relaxed)
    }
}

/// The GateKeeper control-plane server
pub struct Server {
    config: Arc<ServerConfig>,
    driver: Arc<dyn FirewallDriver>,
    guard: Arc<AbuseGuard>,
    static_key: [u8; AES_KEY_LEN],
    listener: TcpListener,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    stats: Arc<ServerStats>,
}

impl Server {
    /// Resolve a firewall driver by configured name
    pub fn resolve_driver(name: &str) -> Result<Arc<dyn FirewallDriver>> {
        match name {
            "mock" => Ok(Arc::new(MockDriver::new())),
            "iptables" => Ok(Arc::new(IptablesDriver::default())),
            other => Err(Error::Config(format!("Unknown driver '{}'", other))),
        }
    }

    /// Bind the listening socket and prepare shared state.
    ///
    /// Fails when the configured driver's backing tool is unavailable.
    pub async fn bind(config: ServerConfig, driver: Arc<dyn FirewallDriver>) -> Result<Self> {
        config.validate()?;

        let resolved = {
            let driver = Arc::clone(&driver);
            tokio::task::spawn_blocking(move || driver.resolve())
                .await
                .map_err(|e| Error::Internal(format!("Driver resolution failed: {}", e)))?
        };
        if !resolved {
            return Err(Error::Config(format!(
                "Driver '{}' did not resolve on this host",
                driver.name()
            )));
        }

        let static_key = static_key_from_access_key(&config.access_key)?;
        let guard = Arc::new(AbuseGuard::new(
            config.login_error_limit,
            config.blocking_time(),
        ));

        let bind_addr = format!("{}:{}", config.listen_address, config.listen_port);
        let listener = TcpListener::bind(&bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            addr = %local_addr,
            driver = driver.name(),
            secure = config.secure,
            login_error_limit = guard.login_error_limit(),
            blocking_time_secs = guard.blocking_time().as_secs(),
            "GateKeeper server bound"
        );

        Ok(Self {
            config: Arc::new(config),
            driver,
            guard,
            static_key,
            listener,
            local_addr,
            cancel: CancellationToken::new(),
            stats: Arc::new(ServerStats::default()),
        })
    }

    /// The bound address (the port doubles as `seed1` for the chained
    /// cipher)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Token that stops the accept loop when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    /// Run the accept loop until the cancellation token fires
    pub async fn run(self) -> Result<()> {
        let listen_port = self.local_addr.port();

        loop {
            let (stream, peer) = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Server is shutting down");
                    break;
                }
                res = self.listener.accept() => res?,
            };

            let remote_ip = peer.ip().to_string();
            if self.guard.is_blocked(&remote_ip) {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(remote = %remote_ip, "Rejected blocklisted remote");
                drop(stream);
                continue;
            }

            self.stats.accepted.fetch_add(1, Ordering::Relaxed);
            debug!(remote = %peer, "Accepted connection");

            let config = Arc::clone(&self.config);
            let driver = Arc::clone(&self.driver);
            let guard = Arc::clone(&self.guard);
            let stats = Arc::clone(&self.stats);
            let static_key = self.static_key;

            tokio::spawn(async move {
                let mut handler = ConnectionHandler::new(
                    config,
                    driver,
                    Arc::clone(&guard),
                    static_key,
                    remote_ip.clone(),
                    listen_port,
                );
                match handler.run(stream).await {
                    Ok(()) => debug!(remote = %remote_ip, "Connection closed"),
                    Err(e) => {
                        if e.counts_as_socket_error() {
                            guard.record_socket_error(&remote_ip);
                        }
                        stats.faulted.fetch_add(1, Ordering::Relaxed);
                        error!(remote = %remote_ip, error = %e, "Connection handler failed");
                    }
                }
            });
        }

        info!(
            accepted = self.stats.accepted(),
            rejected = self.stats.rejected(),
            faulted = self.stats.faulted(),
            "Server stopped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ServerConfig {
        ServerConfig {
            listen_address: "127.0.0.1".to_string(),
            listen_port: 0,
            access_key: "0123456789abcdefghijklmnopqrstuvwxyz".to_string(),
            secure: false,
            login_error_limit: 3,
            blocking_time_secs: 600,
            allowed_ports: vec![2223, 2224],
            allow_all_ports: false,
            sudo: false,
            driver: "mock".to_string(),
        }
    }

    #[tokio::test]
    async fn test_bind_and_shutdown() {
        let driver = Server::resolve_driver("mock").unwrap();
        let server = Server::bind(test_config(), driver).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);

        let cancel = server.cancellation_token();
        let task = tokio::spawn(server.run());
        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[test]
    fn test_driver_resolution() {
        assert!(Server::resolve_driver("mock").is_ok());
        assert!(Server::resolve_driver("iptables").is_ok());
        assert!(Server::resolve_driver("pf").is_err());
    }
}
