//! Bridge interface discovery.
//!
//! The replica runs as a VM behind a flannel bridge on the host network.
//! Flannel hands out addresses deterministically, and the address right after
//! the bridge's own IPv4 address belongs to the VM. This backend therefore
//! yields exactly one unnamed replica.

use std::net::{IpAddr, Ipv4Addr};

use nix::ifaddrs::getifaddrs;

use super::PodInfo;
use crate::error::{Error, Result};

/// Discovers the replica behind a local bridge interface.
#[derive(Clone, Debug)]
pub struct BridgeProvider {
    bridge_name: String,
}

impl BridgeProvider {
    /// Creates a provider inspecting the named interface.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the name is empty.
    pub fn new(bridge_name: &str) -> Result<Self> {
        if bridge_name.is_empty() {
            return Err(Error::invalid_config("bridge name must not be empty"));
        }

        Ok(Self {
            bridge_name: bridge_name.to_string(),
        })
    }

    /// Returns the single replica following the bridge address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Discovery`] if the interfaces cannot be listed or the
    /// bridge carries no IPv4 address.
    pub fn lookup(&self) -> Result<Vec<PodInfo>> {
        let addrs = interface_addresses(&self.bridge_name)?;

        let Some(bridge_ip) = first_ipv4(addrs) else {
            return Err(Error::discovery(format!(
                "interface {} has no IPv4 address",
                self.bridge_name
            )));
        };

        let ip = next_ipv4(bridge_ip);
        tracing::debug!(
            bridge = %self.bridge_name,
            %bridge_ip,
            %ip,
            "derived replica address from bridge"
        );

        Ok(vec![PodInfo::unnamed(IpAddr::V4(ip))])
    }
}

fn interface_addresses(name: &str) -> Result<Vec<IpAddr>> {
    let ifaddrs = getifaddrs()
        .map_err(|e| Error::discovery(format!("listing interface addresses: {e}")))?;

    let mut found = false;
    let mut addrs = Vec::new();

    for ifaddr in ifaddrs.filter(|a| a.interface_name == name) {
        found = true;

        let Some(address) = ifaddr.address else {
            continue;
        };

        if let Some(sin) = address.as_sockaddr_in() {
            addrs.push(IpAddr::V4(Ipv4Addr::from(sin.ip())));
        } else if let Some(sin6) = address.as_sockaddr_in6() {
            addrs.push(IpAddr::V6(sin6.ip()));
        }
    }

    if !found {
        return Err(Error::discovery(format!("interface {name} not found")));
    }

    Ok(addrs)
}

/// Picks the first IPv4 address, including IPv4-mapped IPv6 ones.
fn first_ipv4(addrs: impl IntoIterator<Item = IpAddr>) -> Option<Ipv4Addr> {
    addrs.into_iter().find_map(|addr| match addr {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    })
}

/// Returns the numerically next address, carrying across octets.
fn next_ipv4(ip: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip).wrapping_add(1))
}
