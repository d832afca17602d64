//! QUIC transport over shared UDP sockets, with hole punching before every dial.
//!
//! A [`Transport`] keeps one socket per local address. Listening and dialing share it, so a
//! peer that punches towards our listening port reaches the same socket we dial from.
//!
//! ```no_run
//! use rustp2p_quic::{Identity, Transport, TransportConfig};
//!
//! # async fn run() -> rustp2p_quic::Result<()> {
//! let transport = Transport::new(&Identity::generate()?, TransportConfig::default())?;
//! let listener = transport.listen(&"/ip4/0.0.0.0/udp/0/quic".parse().unwrap())?;
//! println!("listening on {}", listener.local_address());
//!
//! let connection = transport
//!     .dial(&"/ip4/192.0.2.7/udp/4001/quic".parse().unwrap())
//!     .await?;
//! let (mut send, _recv) = connection.open_bi().await.map_err(std::io::Error::from)?;
//! send.write_all(b"hello").await.map_err(std::io::Error::from)?;
//! # Ok(())
//! # }
//! ```

use tokio::task::JoinHandle;

pub mod addr;
pub mod config;
pub mod engine;
pub mod error;
pub mod listener;
pub mod punch;
pub mod reuse;
pub mod security;
pub mod socket;
pub mod transport;

pub use config::{PunchConfig, ReuseConfig, TransportConfig};
pub use error::{Error, Result};
pub use listener::Listener;
pub use security::{Identity, SecurityConfig};
pub use transport::{Connection, Transport};

pub(crate) struct OwnedJoinHandle {
    pub(crate) handle: JoinHandle<()>,
}

impl Drop for OwnedJoinHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
