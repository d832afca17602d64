use std::net::SocketAddr;
use std::sync::Arc;

use multiaddr::Multiaddr;
use tokio::sync::watch;

use crate::addr::to_multiaddr;
use crate::engine::{Engine, EngineListener, EngineSession, ListenerOf, QuicEngine};
use crate::error::{Error, Result};
use crate::reuse::ReuseSocket;
use crate::transport::Connection;

/// Accepts inbound sessions on one reuse socket.
///
/// The socket stays shared: dials may go out from it while the listener is open, and it keeps
/// serving them after the listener is closed.
pub struct Listener<E: Engine = QuicEngine> {
    socket: Arc<ReuseSocket<E>>,
    inner: ListenerOf<E>,
    closed: watch::Sender<bool>,
}

impl<E: Engine> Listener<E> {
    pub(crate) fn new(socket: Arc<ReuseSocket<E>>, inner: ListenerOf<E>) -> Listener<E> {
        log::info!("listening on {}", socket.local_addr());
        Self {
            socket,
            inner,
            closed: watch::Sender::new(false),
        }
    }

    /// Wait for the next inbound session.
    ///
    /// Returns [`Error::ListenerClosed`] once the listener is closed, including to callers that
    /// were already waiting. Losing the underlying endpoint closes the listener too.
    pub async fn accept(&self) -> Result<Connection<E>> {
        let mut closed = self.closed.subscribe();
        let session = tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => {
                return Err(Error::ListenerClosed);
            }
            _ = self.socket.closed() => {
                let _ = self.close();
                return Err(Error::ListenerClosed);
            }
            rs = self.inner.accept() => match rs {
                Ok(session) => session,
                Err(e) => {
                    log::debug!("accept on {}: {e:?}", self.socket.local_addr());
                    let _ = self.close();
                    return Err(Error::ListenerClosed);
                }
            },
        };
        let remote = session.remote_addr();
        let association = match self.socket.associate(remote) {
            Ok(association) => association,
            Err(e) => {
                session.close();
                let _ = self.close();
                log::debug!("drop inbound {remote}: {e}");
                return Err(Error::ListenerClosed);
            }
        };
        // a close that raced the engine's accept still wins
        if self.is_closed() {
            session.close();
            log::debug!("drop inbound {remote}: listener closed");
            return Err(Error::ListenerClosed);
        }
        log::debug!("accepted {remote} on {}", self.socket.local_addr());
        Ok(Connection::new(session, association))
    }

    /// Stop accepting. Wakes every pending [`Listener::accept`]. Calling it again does nothing.
    pub fn close(&self) -> Result<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        self.inner.close();
        self.socket.detach_listener();
        log::info!("listener on {} closed", self.socket.local_addr());
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// The bound address, with the concrete port if the listener was asked for port 0.
    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }
    pub fn local_address(&self) -> Multiaddr {
        to_multiaddr(self.addr())
    }
    pub fn socket(&self) -> &Arc<ReuseSocket<E>> {
        &self.socket
    }
}

impl<E: Engine> Drop for Listener<E> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
