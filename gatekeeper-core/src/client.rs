// SPDX-License-Identifier: MIT
//
// GateKeeper: Remotely-Controlled Firewall Gatekeeper
//
// https://github.com/gatekeeper-fw/gatekeeper

//! Client side of the control channel
//!
//! Mirrors the server's codec, cipher, and state machine: connect, run the
//! key exchange when secure, log in, then issue operational commands. One
//! outstanding request at a time; a send waits until the pending-reply slot
//! clears. Every reply is awaited with a thirty-second timeout, after which
//! the slot clears and the call reports no response.

use crate::cipher::{self, ChainedCipher};
use crate::codec::{self, LineReader, SECURE_CMD};
use crate::config::ClientConfig;
use crate::crypto::{self, AES_KEY_LEN};
use crate::{Error, Result, REPLY_TIMEOUT_SECS};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};

/// Slack added to the client's exchange key; the server truncates after
/// decryption
const EXCHANGE_KEY_SLACK: usize = 16;

struct ClientInner {
    stream: TcpStream,
    reader: LineReader,
    cipher: ChainedCipher,
    static_key: [u8; AES_KEY_LEN],
    access_key: String,
    reply_timeout: Duration,
}

/// Control-channel client with single-flight request/response
pub struct Client {
    inner: Mutex<ClientInner>,
    secure: bool,
}

impl Client {
    /// Connect to the server. The remote port of the socket becomes
    /// `seed1` of the chained cipher, matching the server's listen port.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        config.validate()?;

        let stream =
            TcpStream::connect((config.server_address.as_str(), config.server_port)).await?;
        let peer_port = stream.peer_addr()?.port();
        let static_key = cipher::static_key_from_access_key(&config.access_key)?;

        debug!(server = %config.server_address, port = config.server_port, "Connected");

        Ok(Self {
            inner: Mutex::new(ClientInner {
                stream,
                reader: LineReader::new(),
                cipher: ChainedCipher::new(peer_port, cipher::utc_day_millis()),
                static_key,
                access_key: config.access_key.clone(),
                reply_timeout: Duration::from_secs(REPLY_TIMEOUT_SECS),
            }),
            secure: config.secure,
        })
    }

    /// Connect, exchange keys when secure, and log in
    pub async fn connect_and_login(config: &ClientConfig) -> Result<Self> {
        let client = Self::connect(config).await?;
        if client.secure {
            client.key_exchange().await?;
        }
        if !client.login().await? {
            return Err(Error::Authentication);
        }
        Ok(client)
    }

    /// Run the key exchange: send our random exchange key wrapped under
    /// the static key, unwrap the session key from the reply
    pub async fn key_exchange(&self) -> Result<()> {
        if !self.secure {
            return Err(Error::Internal(
                "Key exchange on a non-secure client".to_string(),
            ));
        }
        let mut inner = self.inner.lock().await;

        let exchange_key = crypto::random_aes_key(Some(EXCHANGE_KEY_SLACK));
        let wrap_iv = cipher::session_wrap_iv(cipher::utc_day_millis());

        let ciphertext = crypto::encrypt_bytes(&inner.static_key, &wrap_iv, &exchange_key)?;
        let line = codec::encode_secure(&crypto::encode_base64(&ciphertext));
        inner.stream.write_all(line.as_bytes()).await?;

        let reply = match timeout(inner.reply_timeout, read_line(&mut inner)).await {
            Ok(res) => res?,
            Err(_) => return Err(Error::Timeout),
        };
        let args = reply
            .strip_prefix(SECURE_CMD)
            .map(str::trim)
            .ok_or_else(|| Error::Malformed("Exchange reply outside the envelope".to_string()))?;

        let wrapped = crypto::decode_base64(args)?;
        let inner_ct = crypto::decrypt_bytes(&exchange_key[..AES_KEY_LEN], &wrap_iv, &wrapped)?;
        let mut session = crypto::decrypt_bytes(&inner.static_key, &wrap_iv, &inner_ct)?;
        if session.len() < AES_KEY_LEN {
            return Err(Error::Crypto("Session key too short".to_string()));
        }
        session.truncate(AES_KEY_LEN);

        let mut key = [0u8; AES_KEY_LEN];
        key.copy_from_slice(&session);
        inner.cipher.set_session_key(key);

        info!("Key exchange completed");
        Ok(())
    }

    /// Prove knowledge of the access key; true when the server accepts
    pub async fn login(&self) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let digest = crypto::hash_access_key(
            &inner.access_key,
            inner.cipher.session_key().map(|k| k.as_slice()),
        );
        let args = crypto::encode_base64(&digest);
        let reply = transact(&mut inner, "login", &args).await?;
        Ok(reply.starts_with("login: true"))
    }

    /// Ports currently dropped by the gatekeeper
    pub async fn list_blocked_tcp_ports(&self) -> Result<Vec<u16>> {
        let mut inner = self.inner.lock().await;
        let reply = transact(&mut inner, "list", "ports").await?;
        Ok(parse_decimal_runs(&reply))
    }

    /// Accept exceptions currently installed
    pub async fn list_accepted_addresses_on_tcp_ports(&self) -> Result<Vec<(String, u16)>> {
        let mut inner = self.inner.lock().await;
        let reply = transact(&mut inner, "list", "accepts").await?;
        Ok(parse_accept_pairs(&reply))
    }

    pub async fn block_tcp_port(&self, port: u16) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let reply = transact(&mut inner, "block", &port.to_string()).await?;
        parse_bool_reply(&reply, "block:")
    }

    pub async fn unblock_tcp_port(&self, port: u16) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let reply = transact(&mut inner, "unblock", &port.to_string()).await?;
        parse_bool_reply(&reply, "unblock:")
    }

    pub async fn accept_address_on_tcp_port(&self, addr: &str, port: u16) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let reply = transact(&mut inner, "accept", &format!("{} {}", addr, port)).await?;
        parse_bool_reply(&reply, "accepted:")
    }

    pub async fn unaccept_address_on_tcp_port(
        &self,
        addr: &str,
        port: Option<u16>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let args = match port {
            Some(port) => format!("{} {}", addr, port),
            None => addr.to_string(),
        };
        let reply = transact(&mut inner, "unaccept", &args).await?;
        parse_bool_reply(&reply, "unaccepted:")
    }

    /// Instruct the server to close the socket
    pub async fn disconnect(&self) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let reply = transact(&mut inner, "disconnect", "now").await?;
        parse_bool_reply(&reply, "disconnect:")
    }

    /// Send a raw command and return the raw reply (interactive use)
    pub async fn send_command(&self, cmd: &str, args: &str) -> Result<String> {
        let mut inner = self.inner.lock().await;
        transact(&mut inner, cmd, args).await
    }
}

/// One request/response transaction under the pending-reply slot
async fn transact(inner: &mut ClientInner, cmd: &str, args: &str) -> Result<String> {
    let line = if inner.cipher.has_session_key() {
        let payload = format!("{} {}", cmd, args);
        codec::encode_secure(&inner.cipher.encrypt_message(&payload)?)
    } else {
        codec::encode_record(cmd, args)
    };
    inner.stream.write_all(line.as_bytes()).await?;

    let raw = match timeout(inner.reply_timeout, read_line(inner)).await {
        Ok(res) => res?,
        // The slot clears with the lock; the caller sees no response
        Err(_) => return Err(Error::Timeout),
    };

    if inner.cipher.has_session_key() {
        let ciphertext = raw
            .strip_prefix(SECURE_CMD)
            .map(str::trim)
            .ok_or_else(|| Error::Malformed("Reply outside the envelope".to_string()))?;
        inner.cipher.decrypt_message(ciphertext)
    } else {
        Ok(raw)
    }
}

/// Read one reply line from the socket
async fn read_line(inner: &mut ClientInner) -> Result<String> {
    loop {
        if let Some(line) = inner.reader.next_line() {
            return Ok(line);
        }
        let mut chunk = [0u8; 512];
        let n = inner.stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::Closed);
        }
        inner.reader.extend(&chunk[..n])?;
    }
}

/// Extract every decimal run from a reply such as `blocked: 2223, 2224`
fn parse_decimal_runs(reply: &str) -> Vec<u16> {
    let mut ports = Vec::new();
    let mut run = String::new();
    for c in reply.chars().chain(std::iter::once(' ')) {
        if c.is_ascii_digit() {
            run.push(c);
        } else if !run.is_empty() {
            if let Ok(port) = run.parse::<u16>() {
                ports.push(port);
            }
            run.clear();
        }
    }
    ports
}

/// Parse `addr:port; addr:port; ...` pairs
fn parse_accept_pairs(reply: &str) -> Vec<(String, u16)> {
    reply
        .split(';')
        .filter_map(|pair| {
            let pair = pair.trim();
            let (addr, port) = pair.rsplit_once(':')?;
            let port = port.trim().parse::<u16>().ok()?;
            Some((addr.trim().to_string(), port))
        })
        .collect()
}

/// Parse the boolean out of a `prefix: true|false ...` reply
fn parse_bool_reply(reply: &str, prefix: &str) -> Result<bool> {
    let rest = reply
        .strip_prefix(prefix)
        .ok_or_else(|| Error::Malformed(format!("Unexpected reply '{}'", reply)))?;
    match rest.trim().split_whitespace().next() {
        Some("true") => Ok(true),
        Some("false") => Ok(false),
        _ => Err(Error::Malformed(format!("Unexpected reply '{}'", reply))),
    }
}
