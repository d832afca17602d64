use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::config::PunchConfig;
use crate::error::{Error, Result};

/// Where punch packets are written to.
#[async_trait]
pub trait PunchSink: Send + Sync {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;
}

#[async_trait]
impl PunchSink for tokio::net::UdpSocket {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        tokio::net::UdpSocket::send_to(self, buf, addr).await
    }
}

/// Fires a burst of random datagrams at a peer so that NATs and firewalls on the path hold a
/// mapping for the handshake that follows. The peer is expected to burst towards us at the same
/// time; nothing is read back.
#[derive(Clone, Debug)]
pub struct Puncher {
    packet_count: usize,
    payload_len: usize,
    interval: Duration,
}

impl Default for Puncher {
    fn default() -> Self {
        Puncher::new(&PunchConfig::default())
    }
}

impl Puncher {
    pub fn new(config: &PunchConfig) -> Puncher {
        Self {
            packet_count: config.packet_count,
            payload_len: config.payload_len,
            interval: config.interval,
        }
    }

    /// Send the burst. The first payload or send failure aborts the rest of the burst.
    ///
    /// Dropping the returned future stops the burst between packets.
    pub async fn punch<S: PunchSink + ?Sized>(&self, sink: &S, addr: SocketAddr) -> Result<()> {
        let mut payload = vec![0u8; self.payload_len];
        for i in 0..self.packet_count {
            if let Err(e) = self.send_one(sink, &mut payload, addr).await {
                log::debug!("punch {addr} aborted after {i} packets: {e:?}");
                return Err(Error::Punch { addr, source: e });
            }
            tokio::time::sleep(self.interval).await;
        }
        log::debug!("punch {addr} sent {} packets", self.packet_count);
        Ok(())
    }

    async fn send_one<S: PunchSink + ?Sized>(
        &self,
        sink: &S,
        payload: &mut [u8],
        addr: SocketAddr,
    ) -> io::Result<()> {
        OsRng.try_fill_bytes(payload).map_err(io::Error::other)?;
        let len = sink.send_to(payload, addr).await?;
        if len == 0 {
            return Err(io::Error::from(io::ErrorKind::WriteZero));
        }
        Ok(())
    }
}
