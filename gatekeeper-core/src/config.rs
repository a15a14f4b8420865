//! Configuration management for GateKeeper components

use crate::{Error, Result, MIN_ACCESS_KEY_LEN, MIN_TCP_PORT};
use crate::driver::PortSet;
use serde::Deserialize;
use std::time::Duration;

/// Control-plane server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the listening socket
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Listening port; also `seed1` of the chained cipher. Zero binds an
    /// ephemeral port chosen by the OS (the bound port becomes the seed)
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Shared operator secret, minimum 32 printable octets
    pub access_key: String,

    /// Require key exchange and chained-cipher traffic
    #[serde(default = "default_true")]
    pub secure: bool,

    /// Failed login attempts before a remote is blocklisted (floor 3)
    #[serde(default = "default_login_error_limit")]
    pub login_error_limit: u32,

    /// Blocklist window in seconds (values under a minute fall back to the
    /// ten-minute default)
    #[serde(default = "default_blocking_time_secs")]
    pub blocking_time_secs: u64,

    /// Ports the gatekeeper may manipulate
    #[serde(default)]
    pub allowed_ports: Vec<u16>,

    /// Permit every port, ignoring `allowed_ports`
    #[serde(default)]
    pub allow_all_ports: bool,

    /// Prefix driver subprocesses with sudo
    #[serde(default)]
    pub sudo: bool,

    /// Firewall backend to resolve (`mock` | `iptables`)
    #[serde(default = "default_driver")]
    pub driver: String,
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config: Self = envy::prefixed("GATEKEEPER_")
            .from_env()
            .map_err(|e| Error::Config(format!("Failed to parse environment variables: {}", e)))?;

        // Handle comma-separated ALLOWED_PORTS if provided as single string
        if config.allowed_ports.is_empty() {
            if let Ok(ports_str) = std::env::var("GATEKEEPER_ALLOWED_PORTS") {
                config.allowed_ports = ports_str
                    .split(',')
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .map(|s| {
                        s.parse::<u16>()
                            .map_err(|e| Error::Config(format!("Invalid allowed port '{}': {}", s, e)))
                    })
                    .collect::<Result<Vec<u16>>>()?;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        validate_access_key(&self.access_key)?;

        for &port in &self.allowed_ports {
            if port < MIN_TCP_PORT {
                return Err(Error::Config(format!(
                    "Allowed port {} below minimum {}",
                    port, MIN_TCP_PORT
                )));
            }
        }

        if !matches!(self.driver.as_str(), "mock" | "iptables") {
            return Err(Error::Config(format!(
                "Unknown driver '{}' (expected 'mock' or 'iptables')",
                self.driver
            )));
        }

        Ok(())
    }

    pub fn blocking_time(&self) -> Duration {
        Duration::from_secs(self.blocking_time_secs)
    }

    pub fn allowed_port_set(&self) -> PortSet {
        self.allowed_ports.iter().copied().collect()
    }
}

/// Client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Server host name or address
    #[serde(default = "default_server_address")]
    pub server_address: String,

    /// Server control port
    #[serde(default = "default_listen_port")]
    pub server_port: u16,

    /// Shared operator secret, minimum 32 printable octets
    pub access_key: String,

    /// Run key exchange and wrap traffic in the chained cipher
    #[serde(default = "default_true")]
    pub secure: bool,
}

impl ClientConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let config: Self = envy::prefixed("GATEKEEPER_")
            .from_env()
            .map_err(|e| Error::Config(format!("Failed to parse environment variables: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        validate_access_key(&self.access_key)?;
        if self.server_port == 0 {
            return Err(Error::Config("server_port must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Check the shared secret: at least 32 octets, all printable Latin-1
pub fn validate_access_key(key: &str) -> Result<()> {
    if key.chars().count() < MIN_ACCESS_KEY_LEN {
        return Err(Error::Config(format!(
            "access_key must be at least {} octets",
            MIN_ACCESS_KEY_LEN
        )));
    }
    for c in key.chars() {
        let cp = c as u32;
        let printable = (0x20..=0x7E).contains(&cp) || (0xA0..=0xFF).contains(&cp);
        if !printable {
            return Err(Error::Config(
                "access_key must contain only printable octets".to_string(),
            ));
        }
    }
    Ok(())
}

// Default value functions
fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    2243
}

fn default_server_address() -> String {
    "127.0.0.1".to_string()
}

fn default_login_error_limit() -> u32 {
    3
}

fn default_blocking_time_secs() -> u64 {
    600
}

fn default_driver() -> String {
    "mock".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ServerConfig {
        ServerConfig {
            listen_address: "0.0.0.0".to_string(),
            listen_port: 2243,
            access_key: "0123456789abcdefghijklmnopqrstuvwxyz".to_string(),
            secure: true,
            login_error_limit: 3,
            blocking_time_secs: 600,
            allowed_ports: vec![2223, 2224],
            allow_all_ports: false,
            sudo: false,
            driver: "mock".to_string(),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_short_access_key_rejected() {
        let mut config = base_config();
        config.access_key = "too-short".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unprintable_access_key_rejected() {
        let mut config = base_config();
        config.access_key = "0123456789abcdefghijklmnopqrstu\twxyz".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_low_allowed_port_rejected() {
        let mut config = base_config();
        config.allowed_ports = vec![9];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_driver_rejected() {
        let mut config = base_config();
        config.driver = "nftables".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_client_config() {
        let config = ClientConfig {
            server_address: "127.0.0.1".to_string(),
            server_port: 2243,
            access_key: "0123456789abcdefghijklmnopqrstuvwxyz".to_string(),
            secure: false,
        };
        assert!(config.validate().is_ok());
    }
}
