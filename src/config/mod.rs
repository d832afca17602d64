use std::io;
use std::time::Duration;

pub(crate) const GC_INTERVAL: Duration = Duration::from_secs(5);
pub(crate) const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);

pub const PUNCH_PACKET_COUNT: usize = 30;
pub const PUNCH_PAYLOAD_LEN: usize = 64;
pub const PUNCH_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub reuse: ReuseConfig,
    pub punch: PunchConfig,
    /// Connections with no traffic for this long are torn down by the engine.
    pub max_idle_timeout: Duration,
    pub keep_alive_interval: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            reuse: ReuseConfig::default(),
            punch: PunchConfig::default(),
            max_idle_timeout: MAX_IDLE_TIMEOUT,
            keep_alive_interval: Some(KEEP_ALIVE_INTERVAL),
        }
    }
}

impl TransportConfig {
    pub fn set_reuse_config(mut self, reuse: ReuseConfig) -> Self {
        self.reuse = reuse;
        self
    }
    pub fn set_punch_config(mut self, punch: PunchConfig) -> Self {
        self.punch = punch;
        self
    }
    pub fn set_max_idle_timeout(mut self, max_idle_timeout: Duration) -> Self {
        self.max_idle_timeout = max_idle_timeout;
        self
    }
    pub fn set_keep_alive_interval(mut self, keep_alive_interval: Option<Duration>) -> Self {
        self.keep_alive_interval = keep_alive_interval;
        self
    }
    pub fn check(&self) -> io::Result<()> {
        self.reuse.check()?;
        self.punch.check()?;
        if self.max_idle_timeout.is_zero() {
            return Err(io::Error::other("max_idle_timeout cannot be 0"));
        }
        if let Some(keep_alive_interval) = self.keep_alive_interval {
            if keep_alive_interval >= self.max_idle_timeout {
                return Err(io::Error::other(
                    "keep_alive_interval must be shorter than max_idle_timeout",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct ReuseConfig {
    /// How often the idle sweep runs.
    pub gc_interval: Duration,
    /// A socket with no associations and no listener is closed after this long.
    pub idle_timeout: Duration,
    pub recv_buffer_size: Option<usize>,
}

impl Default for ReuseConfig {
    fn default() -> Self {
        Self {
            gc_interval: GC_INTERVAL,
            idle_timeout: IDLE_TIMEOUT,
            recv_buffer_size: None,
        }
    }
}

impl ReuseConfig {
    pub fn set_gc_interval(mut self, gc_interval: Duration) -> Self {
        self.gc_interval = gc_interval;
        self
    }
    pub fn set_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
    pub fn set_recv_buffer_size(mut self, recv_buffer_size: usize) -> Self {
        self.recv_buffer_size = Some(recv_buffer_size);
        self
    }
    pub fn check(&self) -> io::Result<()> {
        if self.gc_interval.is_zero() {
            return Err(io::Error::other("gc_interval cannot be 0"));
        }
        if self.recv_buffer_size == Some(0) {
            return Err(io::Error::other("recv_buffer_size cannot be 0"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct PunchConfig {
    pub packet_count: usize,
    pub payload_len: usize,
    pub interval: Duration,
}

impl Default for PunchConfig {
    fn default() -> Self {
        Self {
            packet_count: PUNCH_PACKET_COUNT,
            payload_len: PUNCH_PAYLOAD_LEN,
            interval: PUNCH_INTERVAL,
        }
    }
}

impl PunchConfig {
    pub fn set_packet_count(mut self, packet_count: usize) -> Self {
        self.packet_count = packet_count;
        self
    }
    pub fn set_payload_len(mut self, payload_len: usize) -> Self {
        self.payload_len = payload_len;
        self
    }
    pub fn set_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
    pub fn check(&self) -> io::Result<()> {
        if self.payload_len == 0 {
            return Err(io::Error::other("punch payload cannot be empty"));
        }
        Ok(())
    }
}
