//! Firewall driver shelling out to the iptables CLI
//!
//! Drop rules are appended to the filter chain as `-p tcp --dport N -j DROP`;
//! accept exceptions are inserted ahead of them as
//! `-p tcp -s ADDR --dport N -j ACCEPT`. Listing parses `iptables -S` output.
//! All subprocess work is synchronous; the connection handler runs driver
//! calls on a blocking worker.

use crate::driver::{check_port, port_allowed, AcceptSet, FirewallDriver, PortSet};
use crate::{Error, Result};
use regex::Regex;
use std::process::Command;
use tracing::{debug, warn};

/// Driver for the iptables filter table
#[derive(Debug, Clone)]
pub struct IptablesDriver {
    chain: String,
}

impl Default for IptablesDriver {
    fn default() -> Self {
        Self::new("INPUT")
    }
}

impl IptablesDriver {
    pub fn new(chain: impl Into<String>) -> Self {
        Self {
            chain: chain.into(),
        }
    }

    fn command(&self, sudo: bool, args: &[String]) -> Command {
        if sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg("iptables").args(args);
            cmd
        } else {
            let mut cmd = Command::new("iptables");
            cmd.args(args);
            cmd
        }
    }

    /// Run iptables, returning stdout on success
    fn run(&self, sudo: bool, args: &[String]) -> Result<String> {
        let output = self
            .command(sudo, args)
            .output()
            .map_err(|e| Error::Driver(format!("Failed to run iptables: {}", e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Driver(format!("iptables error: {}", stderr.trim())));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run iptables where a non-zero exit simply means "no such rule"
    fn run_check(&self, sudo: bool, args: &[String]) -> Result<bool> {
        let output = self
            .command(sudo, args)
            .output()
            .map_err(|e| Error::Driver(format!("Failed to run iptables: {}", e)))?;
        Ok(output.status.success())
    }

    fn drop_rule(&self, port: u16) -> Vec<String> {
        vec![
            self.chain.clone(),
            "-p".into(),
            "tcp".into(),
            "--dport".into(),
            port.to_string(),
            "-j".into(),
            "DROP".into(),
        ]
    }

    fn accept_rule(&self, addr: &str, port: u16) -> Vec<String> {
        vec![
            self.chain.clone(),
            "-p".into(),
            "tcp".into(),
            "-s".into(),
            addr.to_string(),
            "--dport".into(),
            port.to_string(),
            "-j".into(),
            "ACCEPT".into(),
        ]
    }

    fn with_op(op: &str, rule: &[String]) -> Vec<String> {
        let mut args = vec![op.to_string()];
        args.extend_from_slice(rule);
        args
    }

    /// Dump the chain in `iptables -S` form
    fn list_rules(&self, sudo: bool) -> Result<String> {
        self.run(sudo, &["-S".to_string(), self.chain.clone()])
    }
}

impl FirewallDriver for IptablesDriver {
    fn name(&self) -> &str {
        "iptables"
    }

    fn resolve(&self) -> bool {
        Command::new("iptables")
            .arg("--version")
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    fn list_blocked_tcp_ports(
        &self,
        sudo: bool,
        allowed_ports: Option<&PortSet>,
    ) -> Result<PortSet> {
        let rules = self.list_rules(sudo)?;
        let re = Regex::new(r"--dport (\d+)\b.*-j DROP")
            .map_err(|e| Error::Internal(e.to_string()))?;

        let mut ports = PortSet::new();
        for line in rules.lines() {
            // Drop rules carry no source; those are accept exceptions
            if line.contains(" -s ") {
                continue;
            }
            if let Some(caps) = re.captures(line) {
                if let Ok(port) = caps[1].parse::<u16>() {
                    if allowed_ports.map_or(true, |allowed| allowed.contains(&port)) {
                        ports.insert(port);
                    }
                }
            }
        }
        debug!(count = ports.len(), "Listed blocked ports");
        Ok(ports)
    }

    fn list_accepted_addresses_on_tcp_ports(
        &self,
        sudo: bool,
        allowed_ports: Option<&PortSet>,
    ) -> Result<AcceptSet> {
        let rules = self.list_rules(sudo)?;
        let re = Regex::new(r"-s ([0-9a-fA-F:\.\/]+)\b.*--dport (\d+)\b.*-j ACCEPT")
            .map_err(|e| Error::Internal(e.to_string()))?;

        let mut accepts = AcceptSet::new();
        for line in rules.lines() {
            if let Some(caps) = re.captures(line) {
                if let Ok(port) = caps[2].parse::<u16>() {
                    if allowed_ports.map_or(true, |allowed| allowed.contains(&port)) {
                        let addr = caps[1].trim_end_matches("/32").to_string();
                        accepts.insert((addr, port));
                    }
                }
            }
        }
        debug!(count = accepts.len(), "Listed accept exceptions");
        Ok(accepts)
    }

    fn block_tcp_port(
        &self,
        port: u16,
        sudo: bool,
        allowed_ports: &PortSet,
        allow_all_ports: bool,
    ) -> Result<bool> {
        check_port(port)?;
        if !port_allowed(port, allowed_ports, allow_all_ports) {
            return Ok(false);
        }
        let rule = self.drop_rule(port);
        if self.run_check(sudo, &Self::with_op("-C", &rule))? {
            debug!(port, "Drop rule already present");
            return Ok(true);
        }
        self.run(sudo, &Self::with_op("-A", &rule))?;
        Ok(true)
    }

    fn unblock_tcp_port(
        &self,
        port: u16,
        sudo: bool,
        allowed_ports: &PortSet,
        allow_all_ports: bool,
    ) -> Result<bool> {
        check_port(port)?;
        if !port_allowed(port, allowed_ports, allow_all_ports) {
            return Ok(false);
        }
        let removed = self.run_check(sudo, &Self::with_op("-D", &self.drop_rule(port)))?;
        if !removed {
            warn!(port, "No drop rule to remove");
        }
        Ok(removed)
    }

    fn accept_address_on_tcp_port(
        &self,
        addr: &str,
        port: u16,
        sudo: bool,
        allowed_ports: &PortSet,
        allow_all_ports: bool,
    ) -> Result<bool> {
        check_port(port)?;
        if !port_allowed(port, allowed_ports, allow_all_ports) {
            return Ok(false);
        }
        let rule = self.accept_rule(addr, port);
        if self.run_check(sudo, &Self::with_op("-C", &rule))? {
            debug!(addr, port, "Accept exception already present");
            return Ok(true);
        }
        // Inserted at the head so it takes effect ahead of the drop rules
        self.run(sudo, &Self::with_op("-I", &rule))?;
        Ok(true)
    }

    fn unaccept_address_on_tcp_port(
        &self,
        addr: &str,
        port: Option<u16>,
        sudo: bool,
        allowed_ports: &PortSet,
        allow_all_ports: bool,
    ) -> Result<bool> {
        match port {
            Some(port) => {
                check_port(port)?;
                if !port_allowed(port, allowed_ports, allow_all_ports) {
                    return Ok(false);
                }
                self.run_check(sudo, &Self::with_op("-D", &self.accept_rule(addr, port)))
            }
            None => {
                // Remove the address across all ports it is accepted on
                let accepts = self.list_accepted_addresses_on_tcp_ports(sudo, None)?;
                let mut removed = false;
                for (rule_addr, rule_port) in accepts {
                    if rule_addr == addr {
                        removed |= self
                            .run_check(sudo, &Self::with_op("-D", &self.accept_rule(addr, rule_port)))?;
                    }
                }
                Ok(removed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_argument_shape() {
        let driver = IptablesDriver::default();
        assert_eq!(
            driver.drop_rule(2223),
            ["INPUT", "-p", "tcp", "--dport", "2223", "-j", "DROP"]
        );
        assert_eq!(
            IptablesDriver::with_op("-A", &driver.drop_rule(2223))[0],
            "-A"
        );
        assert_eq!(
            driver.accept_rule("10.0.0.5", 2224),
            ["INPUT", "-p", "tcp", "-s", "10.0.0.5", "--dport", "2224", "-j", "ACCEPT"]
        );
    }

    #[test]
    fn test_low_port_rejected_without_subprocess() {
        let driver = IptablesDriver::default();
        let err = driver
            .block_tcp_port(9, false, &PortSet::new(), true)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_disallowed_port_declined_without_subprocess() {
        let driver = IptablesDriver::default();
        let allowed: PortSet = [2223].into_iter().collect();
        assert!(!driver.block_tcp_port(4000, false, &allowed, false).unwrap());
    }
}
