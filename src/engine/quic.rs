use std::io;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{Connecting, Connection, Endpoint, IdleTimeout, VarInt};
use rustls::pki_types::CertificateDer;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::config::TransportConfig;
use crate::engine::{Engine, EngineEndpoint, EngineListener, EngineSession};
use crate::security::{SecurityConfig, SERVER_NAME};
use crate::socket::UdpConn;
use crate::OwnedJoinHandle;

const ACCEPT_BACKLOG: usize = 64;

/// QUIC engine backed by quinn. Each reuse socket becomes one quinn endpoint which dials as a
/// client and, once a listener is attached, also serves inbound handshakes.
#[derive(Clone, Debug)]
pub struct QuicEngine {
    transport: Arc<quinn::TransportConfig>,
}

impl QuicEngine {
    pub fn new(config: &TransportConfig) -> QuicEngine {
        let mut transport = quinn::TransportConfig::default();
        transport
            .max_idle_timeout(IdleTimeout::try_from(config.max_idle_timeout).ok())
            .keep_alive_interval(config.keep_alive_interval);
        Self {
            transport: Arc::new(transport),
        }
    }
}

impl Default for QuicEngine {
    fn default() -> Self {
        QuicEngine::new(&TransportConfig::default())
    }
}

impl Engine for QuicEngine {
    type Endpoint = QuicEndpoint;

    fn endpoint(&self, socket: UdpConn) -> io::Result<QuicEndpoint> {
        let runtime = Handle::try_current().map_err(io::Error::other)?;
        let socket = socket.into_std();
        let local_addr = socket.local_addr()?;
        let endpoint = {
            let _guard = runtime.enter();
            Endpoint::new(
                quinn::EndpointConfig::default(),
                None,
                socket,
                Arc::new(quinn::TokioRuntime),
            )?
        };
        Ok(QuicEndpoint {
            slot: Arc::new(Mutex::new(Some(endpoint))),
            local_addr,
            runtime,
            transport: self.transport.clone(),
        })
    }
}

/// Holds the only long-lived handle to the quinn endpoint. Emptying the slot lets quinn drop
/// the OS socket once its connections have drained.
type EndpointSlot = Arc<Mutex<Option<Endpoint>>>;

pub struct QuicEndpoint {
    slot: EndpointSlot,
    local_addr: SocketAddr,
    runtime: Handle,
    transport: Arc<quinn::TransportConfig>,
}

impl QuicEndpoint {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
    /// A handle to the live endpoint, or `None` once closed.
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.slot.lock().clone()
    }
    fn live_endpoint(&self) -> io::Result<Endpoint> {
        self.endpoint()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "endpoint closed"))
    }
}

#[async_trait]
impl EngineEndpoint for QuicEndpoint {
    type Listener = QuicListener;
    type Session = QuicSession;

    fn listen(&self, security: &SecurityConfig) -> io::Result<QuicListener> {
        let endpoint = self.live_endpoint()?;
        let crypto = QuicServerConfig::try_from(security.server_tls()).map_err(io::Error::other)?;
        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
        server_config.transport_config(self.transport.clone());
        endpoint.set_server_config(Some(server_config));

        let (sender, receiver) = mpsc::channel(ACCEPT_BACKLOG);
        let handle = self.runtime.spawn(accept_loop(endpoint, sender));
        Ok(QuicListener {
            slot: self.slot.clone(),
            receiver: tokio::sync::Mutex::new(receiver),
            accept_task: OwnedJoinHandle { handle },
        })
    }

    async fn dial(&self, remote: SocketAddr, security: &SecurityConfig) -> io::Result<QuicSession> {
        let endpoint = self.live_endpoint()?;
        let crypto = QuicClientConfig::try_from(security.client_tls()).map_err(io::Error::other)?;
        let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
        client_config.transport_config(self.transport.clone());
        let connecting = endpoint
            .connect_with(client_config, remote, SERVER_NAME)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        drop(endpoint);
        let connection = connecting.await?;
        log::debug!("dialed {remote} from {}", self.local_addr);
        Ok(QuicSession { connection })
    }

    fn close(&self) -> io::Result<()> {
        if let Some(endpoint) = self.slot.lock().take() {
            endpoint.set_server_config(None);
            endpoint.close(VarInt::from_u32(0), b"closed");
        }
        Ok(())
    }
}

/// Take inbound handshakes off the endpoint and finish each one in its own task, so a peer
/// that never completes cannot hold up the others. Ends when the endpoint closes.
async fn accept_loop(endpoint: Endpoint, sender: mpsc::Sender<QuicSession>) {
    while let Some(incoming) = endpoint.accept().await {
        let remote = incoming.remote_address();
        match incoming.accept() {
            Ok(connecting) => {
                tokio::spawn(handshake(connecting, remote, sender.clone()));
            }
            Err(e) => {
                log::debug!("refused {remote}: {e:?}");
            }
        }
    }
    log::debug!("accept loop on {:?} stopped", endpoint.local_addr());
}

async fn handshake(connecting: Connecting, remote: SocketAddr, sender: mpsc::Sender<QuicSession>) {
    match connecting.await {
        Ok(connection) => {
            if sender.send(QuicSession { connection }).await.is_err() {
                log::debug!("listener gone, drop inbound {remote}");
            }
        }
        Err(e) => {
            log::debug!("inbound handshake {remote}: {e:?}");
        }
    }
}

pub struct QuicListener {
    slot: EndpointSlot,
    receiver: tokio::sync::Mutex<mpsc::Receiver<QuicSession>>,
    accept_task: OwnedJoinHandle,
}

#[async_trait]
impl EngineListener for QuicListener {
    type Session = QuicSession;

    async fn accept(&self) -> io::Result<QuicSession> {
        self.receiver
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "endpoint closed"))
    }

    fn close(&self) {
        self.accept_task.handle.abort();
        if let Some(endpoint) = self.slot.lock().as_ref() {
            endpoint.set_server_config(None);
        }
    }
}

#[derive(Clone, Debug)]
pub struct QuicSession {
    connection: Connection,
}

impl QuicSession {
    pub fn connection(&self) -> &Connection {
        &self.connection
    }
    /// The certificate chain the peer authenticated with.
    pub fn peer_certificates(&self) -> Option<Vec<CertificateDer<'static>>> {
        self.connection
            .peer_identity()?
            .downcast::<Vec<CertificateDer<'static>>>()
            .ok()
            .map(|certs| *certs)
    }
}

impl Deref for QuicSession {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl EngineSession for QuicSession {
    fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_address()
    }
    fn close(&self) {
        self.connection.close(VarInt::from_u32(0), b"closed");
    }
}
