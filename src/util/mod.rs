use std::net::IpAddr;

use anyhow::{bail, Context, Result};
use systemstat::{Platform, System};

/// Pick an IPv4 address that can be shared with a remote ICE peer.
///
/// Iterates over all network interfaces provided by `systemstat`, skipping any
/// loopback, link-local or broadcast addresses. The first routable interface is
/// returned.
pub fn select_host_address() -> Result<IpAddr> {
    let system = System::new();
    let networks = system.networks().context("listing network interfaces")?;

    for net in networks.values() {
        for n in &net.addrs {
            if let systemstat::IpAddr::V4(v) = n.addr {
                if !v.is_loopback() && !v.is_link_local() && !v.is_broadcast() {
                    return Ok(IpAddr::V4(v));
                }
            }
        }
    }

    bail!("found no usable network interface, set media_host in the config")
}
