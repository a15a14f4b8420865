// SPDX-License-Identifier: MIT
//
// GateKeeper: Remotely-Controlled Firewall Gatekeeper
//
// https://github.com/gatekeeper-fw/gatekeeper

//! Abstract firewall rule engine
//!
//! The control plane depends only on this contract. Drivers may shell out
//! to external tools; callers run them on a blocking worker so a slow
//! driver never starves other connections. Implementations here are the
//! in-memory mock and a recording spy for tests; the iptables CLI driver
//! lives in its own module.

use crate::{Error, Result, MIN_TCP_PORT};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Ruleset view returned by the listing operations
pub type PortSet = BTreeSet<u16>;
pub type AcceptSet = BTreeSet<(String, u16)>;

/// Contract every firewall backend implements.
///
/// `allow_all_ports = false` with the port missing from `allowed_ports`
/// must return `false` without side effects. Ports below 10 raise an
/// invalid-argument error.
pub trait FirewallDriver: Send + Sync {
    /// Backend name for logging and resolution
    fn name(&self) -> &str;

    /// Whether the backing tool is available on this host
    fn resolve(&self) -> bool;

    fn list_blocked_tcp_ports(&self, sudo: bool, allowed_ports: Option<&PortSet>)
        -> Result<PortSet>;

    fn list_accepted_addresses_on_tcp_ports(
        &self,
        sudo: bool,
        allowed_ports: Option<&PortSet>,
    ) -> Result<AcceptSet>;

    fn block_tcp_port(
        &self,
        port: u16,
        sudo: bool,
        allowed_ports: &PortSet,
        allow_all_ports: bool,
    ) -> Result<bool>;

    fn unblock_tcp_port(
        &self,
        port: u16,
        sudo: bool,
        allowed_ports: &PortSet,
        allow_all_ports: bool,
    ) -> Result<bool>;

    fn accept_address_on_tcp_port(
        &self,
        addr: &str,
        port: u16,
        sudo: bool,
        allowed_ports: &PortSet,
        allow_all_ports: bool,
    ) -> Result<bool>;

    /// Remove an accept exception; with no port the address is removed
    /// across all ports
    fn unaccept_address_on_tcp_port(
        &self,
        addr: &str,
        port: Option<u16>,
        sudo: bool,
        allowed_ports: &PortSet,
        allow_all_ports: bool,
    ) -> Result<bool>;
}

/// Reject ports below the accepted floor
pub fn check_port(port: u16) -> Result<()> {
    if port < MIN_TCP_PORT {
        return Err(Error::InvalidArgument(format!(
            "Port {} below minimum {}",
            port, MIN_TCP_PORT
        )));
    }
    Ok(())
}

/// Allow-list policy: a port may be manipulated when every port is allowed
/// or it appears in the configured set
pub fn port_allowed(port: u16, allowed_ports: &PortSet, allow_all_ports: bool) -> bool {
    allow_all_ports || allowed_ports.contains(&port)
}

/// In-memory driver used by tests and dry runs
#[derive(Debug, Default)]
pub struct MockDriver {
    state: Mutex<MockState>,
}

#[derive(Debug, Default)]
struct MockState {
    blocked: PortSet,
    accepts: AcceptSet,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FirewallDriver for MockDriver {
    fn name(&self) -> &str {
        "mock"
    }

    fn resolve(&self) -> bool {
        true
    }

    fn list_blocked_tcp_ports(
        &self,
        _sudo: bool,
        allowed_ports: Option<&PortSet>,
    ) -> Result<PortSet> {
        let blocked = &self.state.lock().blocked;
        Ok(match allowed_ports {
            Some(allowed) => blocked.intersection(allowed).copied().collect(),
            None => blocked.clone(),
        })
    }

    fn list_accepted_addresses_on_tcp_ports(
        &self,
        _sudo: bool,
        allowed_ports: Option<&PortSet>,
    ) -> Result<AcceptSet> {
        let accepts = &self.state.lock().accepts;
        Ok(match allowed_ports {
            Some(allowed) => accepts
                .iter()
                .filter(|(_, port)| allowed.contains(port))
                .cloned()
                .collect(),
            None => accepts.clone(),
        })
    }

    fn block_tcp_port(
        &self,
        port: u16,
        _sudo: bool,
        allowed_ports: &PortSet,
        allow_all_ports: bool,
    ) -> Result<bool> {
        check_port(port)?;
        if !port_allowed(port, allowed_ports, allow_all_ports) {
            return Ok(false);
        }
        self.state.lock().blocked.insert(port);
        Ok(true)
    }

    fn unblock_tcp_port(
        &self,
        port: u16,
        _sudo: bool,
        allowed_ports: &PortSet,
        allow_all_ports: bool,
    ) -> Result<bool> {
        check_port(port)?;
        if !port_allowed(port, allowed_ports, allow_all_ports) {
            return Ok(false);
        }
        Ok(self.state.lock().blocked.remove(&port))
    }

    fn accept_address_on_tcp_port(
        &self,
        addr: &str,
        port: u16,
        _sudo: bool,
        allowed_ports: &PortSet,
        allow_all_ports: bool,
    ) -> Result<bool> {
        check_port(port)?;
        if !port_allowed(port, allowed_ports, allow_all_ports) {
            return Ok(false);
        }
        self.state.lock().accepts.insert((addr.to_string(), port));
        Ok(true)
    }

    fn unaccept_address_on_tcp_port(
        &self,
        addr: &str,
        port: Option<u16>,
        _sudo: bool,
        allowed_ports: &PortSet,
        allow_all_ports: bool,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        match port {
            Some(port) => {
                check_port(port)?;
                if !port_allowed(port, allowed_ports, allow_all_ports) {
                    return Ok(false);
                }
                Ok(state.accepts.remove(&(addr.to_string(), port)))
            }
            None => {
                let before = state.accepts.len();
                state.accepts.retain(|(a, _)| a != addr);
                Ok(state.accepts.len() < before)
            }
        }
    }
}

/// Recording wrapper that logs every call before delegating.
///
/// Test-oriented: scenarios assert on the call log to check that the core
/// declined an operation before reaching the driver.
pub struct SpyDriver {
    inner: Arc<dyn FirewallDriver>,
    calls: Mutex<Vec<String>>,
}

impl SpyDriver {
    pub fn new(inner: Arc<dyn FirewallDriver>) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Calls recorded so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

impl FirewallDriver for SpyDriver {
    fn name(&self) -> &str {
        "spy"
    }

    fn resolve(&self) -> bool {
        self.record("resolve".to_string());
        self.inner.resolve()
    }

    fn list_blocked_tcp_ports(
        &self,
        sudo: bool,
        allowed_ports: Option<&PortSet>,
    ) -> Result<PortSet> {
        self.record("list_blocked".to_string());
        self.inner.list_blocked_tcp_ports(sudo, allowed_ports)
    }

    fn list_accepted_addresses_on_tcp_ports(
        &self,
        sudo: bool,
        allowed_ports: Option<&PortSet>,
    ) -> Result<AcceptSet> {
        self.record("list_accepts".to_string());
        self.inner
            .list_accepted_addresses_on_tcp_ports(sudo, allowed_ports)
    }

    fn block_tcp_port(
        &self,
        port: u16,
        sudo: bool,
        allowed_ports: &PortSet,
        allow_all_ports: bool,
    ) -> Result<bool> {
        self.record(format!("block {}", port));
        self.inner
            .block_tcp_port(port, sudo, allowed_ports, allow_all_ports)
    }

    fn unblock_tcp_port(
        &self,
        port: u16,
        sudo: bool,
        allowed_ports: &PortSet,
        allow_all_ports: bool,
    ) -> Result<bool> {
        self.record(format!("unblock {}", port));
        self.inner
            .unblock_tcp_port(port, sudo, allowed_ports, allow_all_ports)
    }

    fn accept_address_on_tcp_port(
        &self,
        addr: &str,
        port: u16,
        sudo: bool,
        allowed_ports: &PortSet,
        allow_all_ports: bool,
    ) -> Result<bool> {
        self.record(format!("accept {} {}", addr, port));
        self.inner
            .accept_address_on_tcp_port(addr, port, sudo, allowed_ports, allow_all_ports)
    }

    fn unaccept_address_on_tcp_port(
        &self,
        addr: &str,
        port: Option<u16>,
        sudo: bool,
        allowed_ports: &PortSet,
        allow_all_ports: bool,
    ) -> Result<bool> {
        self.record(match port {
            Some(p) => format!("unaccept {} {}", addr, p),
            None => format!("unaccept {}", addr),
        });
        self.inner
            .unaccept_address_on_tcp_port(addr, port, sudo, allowed_ports, allow_all_ports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed() -> PortSet {
        [2223, 2224].into_iter().collect()
    }

    #[test]
    fn test_block_respects_allow_list() {
        let driver = MockDriver::new();
        assert!(driver.block_tcp_port(2223, false, &allowed(), false).unwrap());
        assert!(!driver.block_tcp_port(222, false, &allowed(), false).unwrap());

        let blocked = driver.list_blocked_tcp_ports(false, None).unwrap();
        assert_eq!(blocked.into_iter().collect::<Vec<_>>(), vec![2223]);
    }

    #[test]
    fn test_allow_all_ports_bypasses_the_list() {
        let driver = MockDriver::new();
        assert!(driver.block_tcp_port(4000, false, &allowed(), true).unwrap());
    }

    #[test]
    fn test_low_ports_are_invalid() {
        let driver = MockDriver::new();
        let err = driver.block_tcp_port(9, false, &allowed(), true).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(driver.list_blocked_tcp_ports(false, None).unwrap().is_empty());
    }

    #[test]
    fn test_unblock_reports_whether_present() {
        let driver = MockDriver::new();
        driver.block_tcp_port(2223, false, &allowed(), false).unwrap();
        assert!(driver.unblock_tcp_port(2223, false, &allowed(), false).unwrap());
        assert!(!driver.unblock_tcp_port(2223, false, &allowed(), false).unwrap());
    }

    #[test]
    fn test_accept_and_unaccept_by_port() {
        let driver = MockDriver::new();
        assert!(driver
            .accept_address_on_tcp_port("10.0.0.5", 2223, false, &allowed(), false)
            .unwrap());
        assert!(driver
            .accept_address_on_tcp_port("10.0.0.5", 2224, false, &allowed(), false)
            .unwrap());

        assert!(driver
            .unaccept_address_on_tcp_port("10.0.0.5", Some(2223), false, &allowed(), false)
            .unwrap());
        let accepts = driver
            .list_accepted_addresses_on_tcp_ports(false, None)
            .unwrap();
        assert_eq!(accepts.len(), 1);
        assert!(accepts.contains(&("10.0.0.5".to_string(), 2224)));
    }

    #[test]
    fn test_unaccept_without_port_removes_all() {
        let driver = MockDriver::new();
        driver
            .accept_address_on_tcp_port("10.0.0.5", 2223, false, &allowed(), false)
            .unwrap();
        driver
            .accept_address_on_tcp_port("10.0.0.5", 2224, false, &allowed(), false)
            .unwrap();
        driver
            .accept_address_on_tcp_port("10.0.0.6", 2223, false, &allowed(), false)
            .unwrap();

        assert!(driver
            .unaccept_address_on_tcp_port("10.0.0.5", None, false, &allowed(), false)
            .unwrap());
        let accepts = driver
            .list_accepted_addresses_on_tcp_ports(false, None)
            .unwrap();
        assert_eq!(accepts.len(), 1);
        assert!(accepts.contains(&("10.0.0.6".to_string(), 2223)));
    }

    #[test]
    fn test_listing_filters_by_allowed_ports() {
        let driver = MockDriver::new();
        driver.block_tcp_port(2223, false, &allowed(), false).unwrap();
        driver.block_tcp_port(4000, false, &allowed(), true).unwrap();

        let all = driver.list_blocked_tcp_ports(false, None).unwrap();
        assert_eq!(all.len(), 2);
        let filtered = driver
            .list_blocked_tcp_ports(false, Some(&allowed()))
            .unwrap();
        assert_eq!(filtered.into_iter().collect::<Vec<_>>(), vec![2223]);
    }

    #[test]
    fn test_spy_records_calls() {
        let spy = SpyDriver::new(Arc::new(MockDriver::new()));
        spy.block_tcp_port(2223, false, &allowed(), false).unwrap();
        spy.list_blocked_tcp_ports(false, None).unwrap();
        assert_eq!(spy.calls(), vec!["block 2223", "list_blocked"]);
    }
}
