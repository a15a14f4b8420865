// SPDX-License-Identifier: MIT
//
// GateKeeper: Remotely-Controlled Firewall Gatekeeper
//
// https://github.com/gatekeeper-fw/gatekeeper

//! Per-connection state machine and command dispatch
//!
//! Every connection walks a prefix of
//! `Connected -> KeyExchanged -> LoggedIn -> Closed`; a non-secure server
//! skips the exchange. Any invalid transition, malformed line, buffer
//! overflow, or command in the wrong state closes the connection and counts
//! one socket error against the remote. Commands are processed strictly in
//! arrival order, so salt advancement is deterministic without locking.

use crate::cipher::{self, ChainedCipher};
use crate::codec::{self, LineBuffer, Record};
use crate::config::ServerConfig;
use crate::crypto::{self, AES_KEY_LEN};
use crate::driver::{FirewallDriver, PortSet};
use crate::guard::AbuseGuard;
use crate::{Error, Result, LOGIN_DELAY_MS, LOGIN_TIMEOUT_SECS, MIN_TCP_PORT, VERSION};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    KeyExchanged,
    LoggedIn,
    Closed,
}

/// Whether the handler keeps serving after a record
enum Flow {
    Continue,
    Close,
}

/// Handles one accepted connection until it closes
pub struct ConnectionHandler {
    config: Arc<ServerConfig>,
    driver: Arc<dyn FirewallDriver>,
    guard: Arc<AbuseGuard>,
    remote_ip: String,
    state: ConnectionState,
    login_attempts: u32,
    cipher: ChainedCipher,
    static_key: [u8; AES_KEY_LEN],
    allowed_ports: PortSet,
}

impl ConnectionHandler {
    pub fn new(
        config: Arc<ServerConfig>,
        driver: Arc<dyn FirewallDriver>,
        guard: Arc<AbuseGuard>,
        static_key: [u8; AES_KEY_LEN],
        remote_ip: String,
        listen_port: u16,
    ) -> Self {
        let allowed_ports = config.allowed_port_set();
        Self {
            config,
            driver,
            guard,
            remote_ip,
            state: ConnectionState::Connected,
            login_attempts: 0,
            cipher: ChainedCipher::new(listen_port, cipher::utc_day_millis()),
            static_key,
            allowed_ports,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Serve the connection until it closes.
    ///
    /// A connection that has not logged in after thirty seconds is closed
    /// by the watchdog and reported as a protocol error.
    pub async fn run<S>(&mut self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let deadline = Instant::now() + Duration::from_secs(LOGIN_TIMEOUT_SECS);
        let mut buf = LineBuffer::new();
        let mut chunk = [0u8; 512];

        loop {
            while let Some(record) = buf.next_record()? {
                match self.handle_record(record, &mut stream).await? {
                    Flow::Continue => {}
                    Flow::Close => {
                        self.state = ConnectionState::Closed;
                        return Ok(());
                    }
                }
            }

            let n = if self.state == ConnectionState::LoggedIn {
                stream.read(&mut chunk).await?
            } else {
                tokio::select! {
                    _ = sleep_until(deadline) => {
                        warn!(remote = %self.remote_ip, "Login watchdog expired");
                        self.state = ConnectionState::Closed;
                        return Err(Error::Timeout);
                    }
                    res = stream.read(&mut chunk) => res?,
                }
            };

            if n == 0 {
                debug!(remote = %self.remote_ip, "Peer closed the connection");
                self.state = ConnectionState::Closed;
                return Ok(());
            }
            buf.extend(&chunk[..n])?;
        }
    }

    async fn handle_record<S>(&mut self, record: Record, stream: &mut S) -> Result<Flow>
    where
        S: AsyncWrite + Unpin + Send,
    {
        if record.is_secure() {
            if !self.config.secure {
                return Err(Error::Malformed(
                    "Secure envelope on a non-secure server".to_string(),
                ));
            }
            if self.state == ConnectionState::Connected {
                return self.handle_key_exchange(&record.args, stream).await;
            }
            let inner = self.cipher.decrypt_message(&record.args)?;
            let inner = codec::parse_inner(&inner)?;
            return self.dispatch(inner, stream).await;
        }

        // A secure server accepts nothing outside the envelope
        if self.config.secure {
            return Err(Error::Malformed(
                "Unframed line on a secure channel".to_string(),
            ));
        }
        self.dispatch(record, stream).await
    }

    async fn dispatch<S>(&mut self, record: Record, stream: &mut S) -> Result<Flow>
    where
        S: AsyncWrite + Unpin + Send,
    {
        const OPERATIONAL: [&str; 6] = ["list", "block", "unblock", "accept", "unaccept", "disconnect"];

        if record.cmd == "login" {
            return self.handle_login(&record.args, stream).await;
        }
        if !OPERATIONAL.contains(&record.cmd.as_str()) {
            return Err(Error::Malformed(format!("Unknown command '{}'", record.cmd)));
        }
        if self.state != ConnectionState::LoggedIn {
            return Err(Error::Malformed(format!(
                "Command '{}' before login",
                record.cmd
            )));
        }
        self.handle_operational(record, stream).await
    }

    /// The server side of the key exchange.
    ///
    /// The first envelope carries the client's exchange key wrapped under
    /// the static key. The reply carries the fresh session key, wrapped
    /// first under the static key and again under the exchange key.
    async fn handle_key_exchange<S>(&mut self, args: &str, stream: &mut S) -> Result<Flow>
    where
        S: AsyncWrite + Unpin + Send,
    {
        let ciphertext = crypto::decode_base64(args)?;
        let wrap_iv = cipher::session_wrap_iv(cipher::utc_day_millis());

        let mut exchange_key = crypto::decrypt_bytes(&self.static_key, &wrap_iv, &ciphertext)?;
        if exchange_key.len() < AES_KEY_LEN {
            return Err(Error::Crypto("Exchange key too short".to_string()));
        }
        exchange_key.truncate(AES_KEY_LEN);

        let mut session_key = [0u8; AES_KEY_LEN];
        session_key.copy_from_slice(&crypto::random_bytes(AES_KEY_LEN));

        let inner = crypto::encrypt_bytes(&self.static_key, &wrap_iv, &session_key)?;
        let wrapped = crypto::encrypt_bytes(&exchange_key, &wrap_iv, &inner)?;
        let line = codec::encode_secure(&crypto::encode_base64(&wrapped));
        stream.write_all(line.as_bytes()).await?;

        self.cipher.set_session_key(session_key);
        self.state = ConnectionState::KeyExchanged;
        debug!(remote = %self.remote_ip, "Key exchange completed");
        Ok(Flow::Continue)
    }

    async fn handle_login<S>(&mut self, args: &str, stream: &mut S) -> Result<Flow>
    where
        S: AsyncWrite + Unpin + Send,
    {
        if self.state == ConnectionState::LoggedIn {
            return Err(Error::Malformed("Login on an authenticated connection".to_string()));
        }

        // Fixed padding against online guessing; a mitigation, not a
        // constant-time guarantee
        sleep(Duration::from_millis(LOGIN_DELAY_MS)).await;
        self.login_attempts += 1;

        let expected = crypto::hash_access_key(
            &self.config.access_key,
            self.cipher.session_key().map(|k| k.as_slice()),
        );
        let ok = match crypto::decode_base64(args) {
            Ok(candidate) if candidate.len() == expected.len() => {
                candidate.as_slice().ct_eq(&expected[..]).unwrap_u8() == 1
            }
            _ => false,
        };

        if ok {
            self.state = ConnectionState::LoggedIn;
            info!(remote = %self.remote_ip, "Login succeeded");
            self.send_reply(&format!("login: true {}", VERSION), stream)
                .await?;
            return Ok(Flow::Continue);
        }

        warn!(
            remote = %self.remote_ip,
            attempts = self.login_attempts,
            "Login failed"
        );
        self.send_reply("login: false", stream).await?;

        if self.login_attempts >= self.guard.login_error_limit() {
            self.guard.record_login_errors(&self.remote_ip);
            warn!(remote = %self.remote_ip, "Login attempt limit reached, blocklisting");
            return Ok(Flow::Close);
        }
        Ok(Flow::Continue)
    }

    async fn handle_operational<S>(&mut self, record: Record, stream: &mut S) -> Result<Flow>
    where
        S: AsyncWrite + Unpin + Send,
    {
        match record.cmd.as_str() {
            "list" => match record.args.as_str() {
                "ports" => {
                    let ports = self
                        .call_driver(|driver, sudo, allowed, allow_all| {
                            let filter = if allow_all { None } else { Some(&allowed) };
                            driver.list_blocked_tcp_ports(sudo, filter)
                        })
                        .await
                        .unwrap_or_else(|e| {
                            warn!(remote = %self.remote_ip, error = %e, "Driver list failed");
                            PortSet::new()
                        });
                    let joined = ports
                        .iter()
                        .map(|p| p.to_string())
                        .collect::<Vec<_>>()
                        .join(", ");
                    self.send_reply(&format!("blocked: {}", joined), stream).await?;
                    Ok(Flow::Continue)
                }
                "accepts" => {
                    let accepts = self
                        .call_driver(|driver, sudo, allowed, allow_all| {
                            let filter = if allow_all { None } else { Some(&allowed) };
                            driver.list_accepted_addresses_on_tcp_ports(sudo, filter)
                        })
                        .await
                        .unwrap_or_else(|e| {
                            warn!(remote = %self.remote_ip, error = %e, "Driver list failed");
                            Default::default()
                        });
                    let joined = accepts
                        .iter()
                        .map(|(addr, port)| format!("{}:{}", addr, port))
                        .collect::<Vec<_>>()
                        .join("; ");
                    self.send_reply(&joined, stream).await?;
                    Ok(Flow::Continue)
                }
                other => Err(Error::Malformed(format!("Unknown list target '{}'", other))),
            },
            "block" => {
                let port = parse_port(&record.args)?;
                let blocked = self
                    .call_driver(move |driver, sudo, allowed, allow_all| {
                        driver.block_tcp_port(port, sudo, &allowed, allow_all)
                    })
                    .await
                    .unwrap_or_else(|e| {
                        warn!(remote = %self.remote_ip, port, error = %e, "Driver block failed");
                        false
                    });
                self.send_reply(&format!("block: {}", blocked), stream).await?;
                Ok(Flow::Continue)
            }
            "unblock" => {
                let port = parse_port(&record.args)?;
                let unblocked = self
                    .call_driver(move |driver, sudo, allowed, allow_all| {
                        driver.unblock_tcp_port(port, sudo, &allowed, allow_all)
                    })
                    .await
                    .unwrap_or_else(|e| {
                        warn!(remote = %self.remote_ip, port, error = %e, "Driver unblock failed");
                        false
                    });
                self.send_reply(&format!("unblock: {}", unblocked), stream)
                    .await?;
                Ok(Flow::Continue)
            }
            "accept" => {
                let (addr, port) = self.parse_accept_args(&record.args, true)?;
                let port = port.ok_or_else(|| Error::Malformed("Missing port".to_string()))?;
                let target = addr.clone();
                let accepted = self
                    .call_driver(move |driver, sudo, allowed, allow_all| {
                        driver.accept_address_on_tcp_port(&target, port, sudo, &allowed, allow_all)
                    })
                    .await
                    .unwrap_or_else(|e| {
                        warn!(remote = %self.remote_ip, %addr, port, error = %e, "Driver accept failed");
                        false
                    });
                self.send_reply(
                    &format!("accepted: {} ({} -> {})", accepted, addr, port),
                    stream,
                )
                .await?;
                Ok(Flow::Continue)
            }
            "unaccept" => {
                let (addr, port) = self.parse_accept_args(&record.args, false)?;
                let target = addr.clone();
                let unaccepted = self
                    .call_driver(move |driver, sudo, allowed, allow_all| {
                        driver.unaccept_address_on_tcp_port(&target, port, sudo, &allowed, allow_all)
                    })
                    .await
                    .unwrap_or_else(|e| {
                        warn!(remote = %self.remote_ip, %addr, error = %e, "Driver unaccept failed");
                        false
                    });
                let port_text = port.map_or("null".to_string(), |p| p.to_string());
                self.send_reply(
                    &format!("unaccepted: {} ({} -> {})", unaccepted, addr, port_text),
                    stream,
                )
                .await?;
                Ok(Flow::Continue)
            }
            "disconnect" => {
                self.send_reply("disconnect: true", stream).await?;
                info!(remote = %self.remote_ip, "Disconnect requested");
                Ok(Flow::Close)
            }
            _ => unreachable!("dispatch() filters commands"),
        }
    }

    /// Split `addr port` (or `addr [port]`), substituting the remote
    /// address for `.`
    fn parse_accept_args(&self, args: &str, port_required: bool) -> Result<(String, Option<u16>)> {
        let parts: Vec<&str> = args.split_whitespace().collect();
        let (addr, port) = match parts.as_slice() {
            [addr] if !port_required => (*addr, None),
            [addr, port] => (*addr, Some(parse_port(port)?)),
            _ => {
                return Err(Error::Malformed(format!(
                    "Expected address and port, got '{}'",
                    args
                )))
            }
        };
        let addr = if addr == "." {
            self.remote_ip.clone()
        } else {
            addr.to_string()
        };
        Ok((addr, port))
    }

    /// Run a driver call on a blocking worker so a slow subprocess never
    /// starves other connections
    async fn call_driver<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn FirewallDriver>, bool, PortSet, bool) -> Result<T> + Send + 'static,
    {
        let driver = Arc::clone(&self.driver);
        let sudo = self.config.sudo;
        let allowed = self.allowed_ports.clone();
        let allow_all = self.config.allow_all_ports;
        tokio::task::spawn_blocking(move || f(driver, sudo, allowed, allow_all))
            .await
            .map_err(|e| Error::Internal(format!("Driver task failed: {}", e)))?
    }

    /// Frame a reply, encrypting it once a session key is installed
    async fn send_reply<S>(&mut self, text: &str, stream: &mut S) -> Result<()>
    where
        S: AsyncWrite + Unpin + Send,
    {
        let line = if self.config.secure && self.cipher.has_session_key() {
            codec::encode_secure(&self.cipher.encrypt_message(text)?)
        } else {
            codec::encode_reply(text)
        };
        stream.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

/// Parse a port argument; ports below 10 are malformed input, not a policy
/// decision
fn parse_port(s: &str) -> Result<u16> {
    let port = s
        .parse::<u16>()
        .map_err(|_| Error::Malformed(format!("Invalid port '{}'", s)))?;
    if port < MIN_TCP_PORT {
        return Err(Error::Malformed(format!(
            "Port {} below minimum {}",
            port, MIN_TCP_PORT
        )));
    }
    Ok(port)
}
