use std::io;
use std::net::SocketAddr;

use multiaddr::Multiaddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("hole punch to {addr}: {source}")]
    Punch {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Handshake(io::Error),
    #[error("listen on {addr}: {source}")]
    Listen {
        addr: Multiaddr,
        #[source]
        source: io::Error,
    },
    #[error("listener closed")]
    ListenerClosed,
    #[error("transport closed")]
    Closed,
    #[error("security: {0}")]
    Security(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<rcgen::Error> for Error {
    fn from(e: rcgen::Error) -> Self {
        Error::Security(e.to_string())
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Security(e.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
