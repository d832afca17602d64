use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::engine::{Engine, EndpointOf, EngineEndpoint};
use crate::error::{Error, Result};
use crate::socket::{bind_udp, UdpConn};

/// One bound UDP socket shared by at most one listener and any number of dials.
///
/// The engine owns the receive side. A duplicate of the same OS socket is kept here for writing
/// punch packets, so they leave from the port the handshake will use.
pub struct ReuseSocket<E: Engine> {
    local_addr: SocketAddr,
    endpoint: EndpointOf<E>,
    punch_socket: Mutex<Option<Arc<UdpSocket>>>,
    state: Mutex<SocketState>,
    closed_signal: watch::Sender<bool>,
}

struct SocketState {
    associations: HashMap<u64, SocketAddr>,
    next_token: u64,
    listening: bool,
    closed: bool,
    last_active: Instant,
}

impl<E: Engine> ReuseSocket<E> {
    /// Bind a fresh socket on `addr` and hand it to the engine. Needs a tokio runtime.
    pub fn bind(
        engine: &E,
        addr: SocketAddr,
        recv_buffer_size: Option<usize>,
    ) -> Result<ReuseSocket<E>> {
        tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Unsupported, e)))?;
        let bind_err = |source: io::Error| Error::Bind { addr, source };
        let socket = bind_udp(addr, recv_buffer_size).map_err(bind_err)?;
        let local_addr = socket.local_addr().map_err(bind_err)?;
        let punch_socket = socket.try_clone().map_err(bind_err)?;
        let punch_socket = UdpSocket::from_std(punch_socket).map_err(bind_err)?;
        let endpoint = engine.endpoint(UdpConn::new(socket)).map_err(bind_err)?;
        log::debug!("bind reuse socket {local_addr}");
        Ok(Self {
            local_addr,
            endpoint,
            punch_socket: Mutex::new(Some(Arc::new(punch_socket))),
            state: Mutex::new(SocketState {
                associations: HashMap::new(),
                next_token: 0,
                listening: false,
                closed: false,
                last_active: Instant::now(),
            }),
            closed_signal: watch::Sender::new(false),
        })
    }

    /// The bound address, with the port the OS picked when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
    pub fn endpoint(&self) -> &EndpointOf<E> {
        &self.endpoint
    }
    pub(crate) fn punch_socket(&self) -> Result<Arc<UdpSocket>> {
        self.punch_socket.lock().clone().ok_or(Error::Closed)
    }

    /// Record that a session with `remote` now runs on this socket. The association holds the
    /// socket open until it is dropped.
    pub fn associate(self: &Arc<Self>, remote: SocketAddr) -> Result<Association<E>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        let token = state.next_token;
        state.next_token += 1;
        state.associations.insert(token, remote);
        state.last_active = Instant::now();
        Ok(Association {
            socket: self.clone(),
            token,
            remote,
        })
    }

    pub(crate) fn release(&self, token: u64) {
        let mut state = self.state.lock();
        if state.associations.remove(&token).is_some() {
            state.last_active = Instant::now();
        }
    }

    /// Mark the socket as serving a listener. Only one listener may be attached at a time.
    pub(crate) fn attach_listener(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        if state.listening {
            return Err(Error::Bind {
                addr: self.local_addr,
                source: io::Error::new(io::ErrorKind::AddrInUse, "already listening"),
            });
        }
        state.listening = true;
        state.last_active = Instant::now();
        Ok(())
    }

    pub(crate) fn detach_listener(&self) {
        let mut state = self.state.lock();
        if state.listening {
            state.listening = false;
            state.last_active = Instant::now();
        }
    }

    /// Resolves once the socket has been closed.
    pub(crate) async fn closed(&self) {
        let mut closed = self.closed_signal.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    pub(crate) fn touch(&self) {
        self.state.lock().last_active = Instant::now();
    }

    pub fn is_listening(&self) -> bool {
        self.state.lock().listening
    }
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
    pub fn association_count(&self) -> usize {
        self.state.lock().associations.len()
    }
    /// Remote addresses of the sessions currently running on this socket.
    pub fn remotes(&self) -> Vec<SocketAddr> {
        self.state.lock().associations.values().copied().collect()
    }

    /// Close the socket if nothing uses it and it has been quiet for `idle_timeout`.
    /// The check and the close happen under one lock, so a concurrent `associate` either lands
    /// first and keeps the socket, or sees it closed.
    pub(crate) fn close_if_idle(&self, now: Instant, idle_timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return true;
        }
        if !state.associations.is_empty()
            || state.listening
            || now.saturating_duration_since(state.last_active) < idle_timeout
        {
            return false;
        }
        state.closed = true;
        drop(state);
        if let Err(e) = self.release_os_socket() {
            log::warn!("close idle socket {}: {e:?}", self.local_addr);
        }
        true
    }

    pub(crate) fn close(&self) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        state.listening = false;
        drop(state);
        self.release_os_socket()
    }

    /// Give the OS socket back: drop our duplicate and have the engine let go of its own.
    fn release_os_socket(&self) -> io::Result<()> {
        self.punch_socket.lock().take();
        self.closed_signal.send_replace(true);
        self.endpoint.close()
    }
}

/// A live session's claim on a [`ReuseSocket`]. Dropping it releases the claim.
pub struct Association<E: Engine> {
    socket: Arc<ReuseSocket<E>>,
    token: u64,
    remote: SocketAddr,
}

impl<E: Engine> Association<E> {
    pub fn socket(&self) -> &Arc<ReuseSocket<E>> {
        &self.socket
    }
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}

impl<E: Engine> Drop for Association<E> {
    fn drop(&mut self) {
        self.socket.release(self.token);
    }
}
