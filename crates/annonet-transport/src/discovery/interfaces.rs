//! Local network facts used by the announcer: broadcast addresses of the
//! usable IPv4 interfaces, and the host name.

use std::net::{Ipv4Addr, SocketAddr};

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use socket2::{Domain, Protocol, Socket, Type};

const FALLBACK_HOST_NAME: &str = "Server";

/// Where to announce, and which local address to advertise there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastTarget {
    pub broadcast: Ipv4Addr,
    pub local: Ipv4Addr,
}

/// Directed broadcast address of `ip`'s subnet.
pub fn broadcast_address(ip: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(mask))
}

/// One target per distinct broadcast address across all up, non-loopback
/// IPv4 interfaces.
pub fn interface_targets() -> std::io::Result<Vec<BroadcastTarget>> {
    let mut targets: Vec<BroadcastTarget> = Vec::new();
    for ifa in getifaddrs().map_err(std::io::Error::from)? {
        if !ifa.flags.contains(InterfaceFlags::IFF_UP)
            || ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK)
        {
            continue;
        }
        let Some(ip) = ifa.address.as_ref().and_then(|a| a.as_sockaddr_in()).map(|a| a.ip()) else {
            continue;
        };
        let Some(mask) = ifa.netmask.as_ref().and_then(|a| a.as_sockaddr_in()).map(|a| a.ip()) else {
            continue;
        };
        if ip.is_loopback() || ip.is_unspecified() {
            continue;
        }

        let broadcast = broadcast_address(ip, mask);
        if targets.iter().any(|t| t.broadcast == broadcast) {
            continue;
        }
        tracing::debug!(interface = %ifa.interface_name, %ip, %broadcast, "announce target");
        targets.push(BroadcastTarget { broadcast, local: ip });
    }
    Ok(targets)
}

/// Resolve announce targets. Explicit addresses win over interface
/// enumeration; for each one the advertised local address is whichever
/// address the OS would route from.
pub fn resolve_targets(explicit: &[Ipv4Addr], port: u16) -> Vec<BroadcastTarget> {
    if explicit.is_empty() {
        return match interface_targets() {
            Ok(targets) => targets,
            Err(e) => {
                tracing::warn!(error = %e, "interface enumeration failed");
                Vec::new()
            }
        };
    }

    explicit
        .iter()
        .filter_map(|&broadcast| match route_source(broadcast, port) {
            Ok(local) => Some(BroadcastTarget { broadcast, local }),
            Err(e) => {
                tracing::warn!(%broadcast, error = %e, "no route to announce address");
                None
            }
        })
        .collect()
}

/// Local IPv4 address the OS picks for traffic to `dest`. No packet is sent.
fn route_source(dest: Ipv4Addr, port: u16) -> std::io::Result<Ipv4Addr> {
    let probe = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    probe.set_broadcast(true)?;
    probe.connect(&SocketAddr::from((dest, port.max(1))).into())?;
    let local = probe
        .local_addr()?
        .as_socket_ipv4()
        .map(|a| *a.ip())
        .unwrap_or(Ipv4Addr::UNSPECIFIED);
    Ok(local)
}

/// This machine's host name, or "Server" if it cannot be read.
pub fn host_name() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_HOST_NAME.to_string())
}
