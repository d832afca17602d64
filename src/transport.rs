use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use multiaddr::Multiaddr;
use parking_lot::RwLock;

use crate::addr::{is_quic_addr, to_multiaddr, to_socket_addr};
use crate::config::TransportConfig;
use crate::engine::{Engine, EngineEndpoint, EngineSession, QuicEngine, SessionOf};
use crate::error::{Error, Result};
use crate::listener::Listener;
use crate::punch::Puncher;
use crate::reuse::{Association, ReuseManager};
use crate::security::{Identity, SecurityConfig};

const PROTOCOLS: &[&str] = &["quic"];

/// Listens and dials over reuse sockets, punching a path before every dial.
///
/// Each transport owns its own socket registry; several can live in one process.
pub struct Transport<E: Engine = QuicEngine> {
    manager: ReuseManager<E>,
    security: RwLock<Option<Arc<SecurityConfig>>>,
    puncher: Puncher,
    closed: AtomicBool,
}

impl Transport<QuicEngine> {
    pub fn new(identity: &Identity, config: TransportConfig) -> Result<Transport<QuicEngine>> {
        let engine = QuicEngine::new(&config);
        Transport::with_engine(engine, identity, config)
    }
}

impl<E: Engine> Transport<E> {
    pub fn with_engine(engine: E, identity: &Identity, config: TransportConfig) -> Result<Self> {
        config.check()?;
        let security = SecurityConfig::new(identity)?;
        Ok(Self {
            manager: ReuseManager::new(engine, config.reuse),
            security: RwLock::new(Some(Arc::new(security))),
            puncher: Puncher::new(&config.punch),
            closed: AtomicBool::new(false),
        })
    }

    fn security(&self) -> Result<Arc<SecurityConfig>> {
        self.security.read().clone().ok_or(Error::Closed)
    }

    /// Start accepting sessions on `addr`. Port 0 binds an ephemeral port; the listener reports
    /// the one the OS picked.
    pub fn listen(&self, addr: &Multiaddr) -> Result<Listener<E>> {
        let local_addr = to_socket_addr(addr)?;
        let security = self.security()?;
        let socket = self.manager.listen_socket(local_addr)?;
        match socket.endpoint().listen(&security) {
            Ok(inner) => Ok(Listener::new(socket, inner)),
            Err(source) => {
                socket.detach_listener();
                Err(Error::Listen {
                    addr: addr.clone(),
                    source,
                })
            }
        }
    }

    /// Punch towards `addr` and run the handshake from the chosen socket.
    ///
    /// Dropping the future stops the punch burst or the handshake; nothing stays associated.
    pub async fn dial(&self, addr: &Multiaddr) -> Result<Connection<E>> {
        let remote = to_socket_addr(addr)?;
        let security = self.security()?;
        let association = self.manager.pick_for_dial(remote)?;
        let socket = association.socket().clone();
        log::debug!("dial {remote} from {}", socket.local_addr());
        let punch_socket = socket.punch_socket()?;
        self.puncher.punch(&*punch_socket, remote).await?;
        drop(punch_socket);
        let session = socket
            .endpoint()
            .dial(remote, &security)
            .await
            .map_err(Error::Handshake)?;
        Ok(Connection::new(session, association))
    }

    pub fn can_dial(&self, addr: &Multiaddr) -> bool {
        is_quic_addr(addr)
    }

    pub fn protocols(&self) -> &'static [&'static str] {
        PROTOCOLS
    }

    pub fn reuse_manager(&self) -> &ReuseManager<E> {
        &self.manager
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close every socket and drop the TLS material. Open listeners wake up closed; later calls
    /// do nothing.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.security.write().take();
        self.manager.close_all()?;
        Ok(())
    }
}

impl<E: Engine> Drop for Transport<E> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("close transport: {e}");
        }
    }
}

/// An established session together with its claim on the socket it runs over.
pub struct Connection<E: Engine = QuicEngine> {
    session: SessionOf<E>,
    association: Association<E>,
}

impl<E: Engine> Connection<E> {
    pub(crate) fn new(session: SessionOf<E>, association: Association<E>) -> Connection<E> {
        Self {
            session,
            association,
        }
    }
    pub fn session(&self) -> &SessionOf<E> {
        &self.session
    }
    pub fn local_addr(&self) -> SocketAddr {
        self.association.socket().local_addr()
    }
    pub fn remote_addr(&self) -> SocketAddr {
        self.session.remote_addr()
    }
    pub fn local_address(&self) -> Multiaddr {
        to_multiaddr(self.local_addr())
    }
    pub fn remote_address(&self) -> Multiaddr {
        to_multiaddr(self.remote_addr())
    }
    /// Close the session and release the socket.
    pub fn close(self) {
        self.session.close();
    }
}

impl<E: Engine> Deref for Connection<E> {
    type Target = SessionOf<E>;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::Transport;
    use crate::addr::to_multiaddr;
    use crate::config::{PunchConfig, TransportConfig};
    use crate::engine::mock::MockEngine;
    use crate::error::Error;
    use crate::security::Identity;

    fn transport(engine: &MockEngine, packet_count: usize) -> Transport<MockEngine> {
        let config = TransportConfig::default().set_punch_config(
            PunchConfig::default()
                .set_packet_count(packet_count)
                .set_interval(Duration::from_millis(1)),
        );
        Transport::with_engine(engine.clone(), &Identity::generate().unwrap(), config).unwrap()
    }

    fn peer() -> (std::net::UdpSocket, SocketAddr) {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    fn total_associations(transport: &Transport<MockEngine>) -> usize {
        transport
            .reuse_manager()
            .sockets()
            .iter()
            .map(|socket| socket.association_count())
            .sum()
    }

    #[tokio::test]
    async fn listen_reports_assigned_port() {
        let engine = MockEngine::default();
        let transport = transport(&engine, 1);
        let listener = transport
            .listen(&"/ip4/127.0.0.1/udp/0/quic".parse().unwrap())
            .unwrap();
        assert_ne!(listener.addr().port(), 0);
        assert_eq!(
            listener.local_address().to_string(),
            format!("/ip4/127.0.0.1/udp/{}/quic", listener.addr().port())
        );
    }

    #[test]
    fn listen_outside_runtime_fails() {
        let engine = MockEngine::default();
        let transport = transport(&engine, 1);
        assert!(matches!(
            transport.listen(&"/ip4/127.0.0.1/udp/0/quic".parse().unwrap()),
            Err(Error::Io(_))
        ));
        assert!(transport.reuse_manager().is_empty());
    }

    #[tokio::test]
    async fn listen_rejects_other_stacks() {
        let engine = MockEngine::default();
        let transport = transport(&engine, 1);
        let addr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
        assert!(!transport.can_dial(&addr));
        assert!(matches!(
            transport.listen(&addr),
            Err(Error::InvalidAddress(_))
        ));
        assert!(matches!(
            transport.dial(&addr).await,
            Err(Error::InvalidAddress(_))
        ));
        assert_eq!(transport.protocols(), &["quic"]);
    }

    #[tokio::test]
    async fn listen_error_is_wrapped() {
        let engine = MockEngine::default();
        engine.state.fail_listen.store(true, Ordering::SeqCst);
        let transport = transport(&engine, 1);
        let addr = "/ip4/127.0.0.1/udp/0/quic".parse().unwrap();
        match transport.listen(&addr) {
            Err(Error::Listen { addr: failed, source }) => {
                assert_eq!(failed, addr);
                assert_eq!(source.to_string(), "listen error");
            }
            _ => panic!("expected listen error"),
        }
        for socket in transport.reuse_manager().sockets() {
            assert!(!socket.is_listening());
        }
    }

    #[tokio::test]
    async fn second_listen_on_same_address_fails() {
        let engine = MockEngine::default();
        let transport = transport(&engine, 1);
        let listener = transport
            .listen(&"/ip4/127.0.0.1/udp/0/quic".parse().unwrap())
            .unwrap();
        assert!(matches!(
            transport.listen(&listener.local_address()),
            Err(Error::Bind { .. })
        ));
        drop(listener);
    }

    #[tokio::test]
    async fn dial_runs_from_listening_socket() {
        let engine = MockEngine::default();
        let transport = transport(&engine, 3);
        let listener = transport
            .listen(&"/ip4/127.0.0.1/udp/0/quic".parse().unwrap())
            .unwrap();
        let (peer, remote) = peer();

        let connection = transport.dial(&to_multiaddr(remote)).await.unwrap();
        assert_eq!(connection.local_addr(), listener.addr());
        assert_eq!(connection.remote_addr(), remote);
        assert_eq!(connection.remote_address(), to_multiaddr(remote));
        assert_eq!(engine.state.dials.lock().clone(), vec![(listener.addr(), remote)]);
        assert_eq!(listener.socket().association_count(), 1);

        let mut buf = [0u8; 128];
        let (len, from) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(len, 64);
        assert_eq!(from, listener.addr());

        connection.close();
        assert_eq!(listener.socket().association_count(), 0);
    }

    #[tokio::test]
    async fn failed_handshake_releases_association() {
        let engine = MockEngine::default();
        engine.state.fail_dial.store(true, Ordering::SeqCst);
        let transport = transport(&engine, 1);
        let (_peer, remote) = peer();
        match transport.dial(&to_multiaddr(remote)).await {
            Err(Error::Handshake(e)) => assert_eq!(e.kind(), std::io::ErrorKind::TimedOut),
            _ => panic!("expected handshake error"),
        }
        assert_eq!(transport.reuse_manager().len(), 1);
        assert_eq!(total_associations(&transport), 0);
    }

    #[tokio::test]
    async fn failed_punch_skips_handshake() {
        let engine = MockEngine::default();
        let transport = transport(&engine, 5);
        // broadcast without SO_BROADCAST is refused by the OS
        let addr = "/ip4/255.255.255.255/udp/4001/quic".parse().unwrap();
        assert!(matches!(
            transport.dial(&addr).await,
            Err(Error::Punch { .. })
        ));
        assert!(engine.state.dials.lock().is_empty());
        assert_eq!(total_associations(&transport), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_dial_releases_association() {
        let engine = MockEngine::default();
        let config = TransportConfig::default();
        let transport =
            Transport::with_engine(engine.clone(), &Identity::generate().unwrap(), config)
                .unwrap();
        let (_peer, remote) = peer();
        let rs = tokio::time::timeout(
            Duration::from_millis(250),
            transport.dial(&to_multiaddr(remote)),
        )
        .await;
        assert!(rs.is_err());
        assert_eq!(transport.reuse_manager().len(), 1);
        assert_eq!(total_associations(&transport), 0);
        assert!(engine.state.dials.lock().is_empty());
    }

    #[tokio::test]
    async fn closed_transport_refuses_work() {
        let engine = MockEngine::default();
        let transport = transport(&engine, 1);
        let listener = transport
            .listen(&"/ip4/127.0.0.1/udp/0/quic".parse().unwrap())
            .unwrap();
        transport.close().unwrap();
        transport.close().unwrap();
        assert!(transport.is_closed());
        assert!(transport.reuse_manager().is_empty());
        assert_eq!(engine.state.closed_endpoints.load(Ordering::SeqCst), 1);
        assert!(matches!(
            listener.accept().await,
            Err(Error::ListenerClosed)
        ));
        assert!(matches!(
            transport.listen(&"/ip4/127.0.0.1/udp/0/quic".parse().unwrap()),
            Err(Error::Closed)
        ));
        let (_peer, remote) = peer();
        assert!(matches!(
            transport.dial(&to_multiaddr(remote)).await,
            Err(Error::Closed)
        ));
    }
}
