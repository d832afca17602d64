//! Translation between multiaddrs and OS socket addresses.
//!
//! Only `/ip4/<addr>/udp/<port>/quic` and `/ip6/<addr>/udp/<port>/quic` are understood by this
//! transport; anything else is rejected with [`Error::InvalidAddress`](crate::error::Error).
//!
//! ```rust
//! use rustp2p_quic::addr::{to_multiaddr, to_socket_addr};
//!
//! let addr = "/ip4/127.0.0.1/udp/4001/quic".parse().unwrap();
//! let socket_addr = to_socket_addr(&addr).unwrap();
//! assert_eq!(socket_addr.port(), 4001);
//! assert_eq!(to_multiaddr(socket_addr), addr);
//! ```

use std::net::{IpAddr, SocketAddr};

use multiaddr::{Multiaddr, Protocol};

use crate::error::{Error, Result};

/// Convert a QUIC multiaddr into the socket address it names.
pub fn to_socket_addr(addr: &Multiaddr) -> Result<SocketAddr> {
    let mut iter = addr.iter();
    let ip: IpAddr = match iter.next() {
        Some(Protocol::Ip4(ip)) => ip.into(),
        Some(Protocol::Ip6(ip)) => ip.into(),
        _ => return Err(invalid(addr)),
    };
    let port = match iter.next() {
        Some(Protocol::Udp(port)) => port,
        _ => return Err(invalid(addr)),
    };
    match (iter.next(), iter.next()) {
        (Some(Protocol::Quic), None) => Ok(SocketAddr::new(ip, port)),
        _ => Err(invalid(addr)),
    }
}

pub fn to_multiaddr(addr: SocketAddr) -> Multiaddr {
    let ip = match addr.ip() {
        IpAddr::V4(ip) => Protocol::Ip4(ip),
        IpAddr::V6(ip) => Protocol::Ip6(ip),
    };
    Multiaddr::empty()
        .with(ip)
        .with(Protocol::Udp(addr.port()))
        .with(Protocol::Quic)
}

/// Whether `addr` is a multiaddr this transport can dial or listen on.
pub fn is_quic_addr(addr: &Multiaddr) -> bool {
    to_socket_addr(addr).is_ok()
}

/// Whether a socket bound to `local` can send to `remote`.
///
/// Sockets never cross address families (IPv6 sockets are bound v6-only), and a loopback bind
/// only reaches loopback peers while a specific external bind never reaches loopback.
pub(crate) fn can_reach(local: SocketAddr, remote: SocketAddr) -> bool {
    if local.is_ipv4() != remote.is_ipv4() {
        return false;
    }
    let local_ip = local.ip();
    local_ip.is_unspecified() || local_ip.is_loopback() == remote.ip().is_loopback()
}

fn invalid(addr: &Multiaddr) -> Error {
    Error::InvalidAddress(addr.to_string())
}
