//! The secure transport engine the reuse layer hands its sockets to.
//!
//! The engine owns the handshake, stream multiplexing and congestion control. This crate only
//! decides which socket a listener or a dial runs on, and punches a path before dialing.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;

use crate::security::SecurityConfig;
use crate::socket::UdpConn;

pub mod quic;

pub use quic::{QuicEndpoint, QuicEngine, QuicListener, QuicSession};

pub trait Engine: Send + Sync + 'static {
    type Endpoint: EngineEndpoint;

    /// Take over a freshly bound socket. Called once per reuse socket.
    fn endpoint(&self, socket: UdpConn) -> io::Result<Self::Endpoint>;
}

#[async_trait]
pub trait EngineEndpoint: Send + Sync + 'static {
    type Listener: EngineListener<Session = Self::Session>;
    type Session: EngineSession;

    fn listen(&self, security: &SecurityConfig) -> io::Result<Self::Listener>;
    async fn dial(&self, remote: SocketAddr, security: &SecurityConfig)
        -> io::Result<Self::Session>;
    /// Shut the endpoint down and release the OS socket.
    fn close(&self) -> io::Result<()>;
}

#[async_trait]
pub trait EngineListener: Send + Sync + 'static {
    type Session: EngineSession;

    async fn accept(&self) -> io::Result<Self::Session>;
    fn close(&self);
}

pub trait EngineSession: Send + Sync + 'static {
    fn remote_addr(&self) -> SocketAddr;
    fn close(&self);
}

pub type EndpointOf<E> = <E as Engine>::Endpoint;
pub type ListenerOf<E> = <EndpointOf<E> as EngineEndpoint>::Listener;
pub type SessionOf<E> = <EndpointOf<E> as EngineEndpoint>::Session;
