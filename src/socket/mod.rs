use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use socket2::{Domain, Protocol, SockRef, Socket, Type};

pub const DEFAULT_ADDRESS_V4: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
pub const DEFAULT_ADDRESS_V6: SocketAddr =
    SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0));

/// What an engine is allowed to rely on from the socket it is handed.
///
/// Batched receive paths and socket option tuning need more than a generic packet socket, so
/// the engine gets the sender-aware receive, the receive buffer knobs and the raw OS handle.
pub trait RawUdpSocket: Send + Sync {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn set_recv_buffer_size(&self, size: usize) -> io::Result<()>;
    fn recv_buffer_size(&self) -> io::Result<usize>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
    /// Borrow the raw OS socket for option tuning.
    fn raw_socket(&self) -> SockRef<'_>;
}

/// A bound, non-blocking UDP socket on its way to an engine.
#[derive(Debug)]
pub struct UdpConn {
    socket: std::net::UdpSocket,
}

impl UdpConn {
    pub(crate) fn new(socket: std::net::UdpSocket) -> Self {
        Self { socket }
    }
    pub fn into_std(self) -> std::net::UdpSocket {
        self.socket
    }
}

impl RawUdpSocket for UdpConn {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf)
    }
    fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        self.raw_socket().set_recv_buffer_size(size)
    }
    fn recv_buffer_size(&self) -> io::Result<usize> {
        self.raw_socket().recv_buffer_size()
    }
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
    fn raw_socket(&self) -> SockRef<'_> {
        SockRef::from(&self.socket)
    }
}

#[cfg(unix)]
impl std::os::fd::AsRawFd for UdpConn {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.socket.as_raw_fd()
    }
}

#[cfg(windows)]
impl std::os::windows::io::AsRawSocket for UdpConn {
    fn as_raw_socket(&self) -> std::os::windows::io::RawSocket {
        self.socket.as_raw_socket()
    }
}

/// Bind a non-blocking UDP socket. IPv6 sockets are v6-only so that `[::]` and `0.0.0.0`
/// on the same port stay distinct sockets.
pub(crate) fn bind_udp(
    addr: SocketAddr,
    recv_buffer_size: Option<usize>,
) -> io::Result<std::net::UdpSocket> {
    let socket = if addr.is_ipv4() {
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?
    } else {
        let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_only_v6(true)?;
        socket
    };
    if let Some(size) = recv_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}
