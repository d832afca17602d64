use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::addr::can_reach;
use crate::config::ReuseConfig;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::reuse::{Association, ReuseSocket};
use crate::socket::{DEFAULT_ADDRESS_V4, DEFAULT_ADDRESS_V6};
use crate::OwnedJoinHandle;

/// Registry of reuse sockets, keyed by their resolved local address.
///
/// Owned by one transport. Dropping it closes every socket it still holds.
pub struct ReuseManager<E: Engine> {
    inner: Arc<ManagerInner<E>>,
    gc: Mutex<Option<OwnedJoinHandle>>,
}

struct ManagerInner<E: Engine> {
    engine: E,
    config: ReuseConfig,
    sockets: DashMap<SocketAddr, Arc<ReuseSocket<E>>>,
    closed: AtomicBool,
}

impl<E: Engine> ReuseManager<E> {
    /// Create the registry. When called inside a tokio runtime the idle sweep is started on it;
    /// otherwise only [`ReuseManager::collect_garbage`] sweeps.
    pub fn new(engine: E, config: ReuseConfig) -> ReuseManager<E> {
        let inner = Arc::new(ManagerInner {
            engine,
            config,
            sockets: DashMap::new(),
            closed: AtomicBool::new(false),
        });
        let gc = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let handle = runtime.spawn(gc_loop(
                    Arc::downgrade(&inner),
                    inner.config.gc_interval,
                ));
                Some(OwnedJoinHandle { handle })
            }
            Err(_) => {
                log::warn!("no tokio runtime, reuse sockets are only swept on demand");
                None
            }
        };
        Self {
            inner,
            gc: Mutex::new(gc),
        }
    }

    pub fn engine(&self) -> &E {
        &self.inner.engine
    }

    /// Return the socket bound to `addr`, binding it first if there is none.
    ///
    /// Concurrent calls for the same address bind once and share the socket. A request for
    /// port 0 always binds a new socket, registered under the port the OS picked.
    pub fn get_or_create(&self, addr: SocketAddr) -> Result<Arc<ReuseSocket<E>>> {
        self.with_socket(addr, |socket| Ok(socket.clone()))
    }

    /// Like [`ReuseManager::get_or_create`], and attach a listener to the socket in the same
    /// step so the sweep can never observe it unattached.
    pub(crate) fn listen_socket(&self, addr: SocketAddr) -> Result<Arc<ReuseSocket<E>>> {
        self.with_socket(addr, |socket| {
            socket.attach_listener()?;
            Ok(socket.clone())
        })
    }

    fn with_socket<T>(
        &self,
        addr: SocketAddr,
        f: impl FnOnce(&Arc<ReuseSocket<E>>) -> Result<T>,
    ) -> Result<T> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let (rs, socket) = if addr.port() == 0 {
            let socket = self.bind(addr)?;
            let rs = f(&socket)?;
            self.inner.sockets.insert(socket.local_addr(), socket.clone());
            (rs, socket)
        } else {
            match self.inner.sockets.entry(addr) {
                Entry::Occupied(entry) => {
                    let socket = entry.get().clone();
                    socket.touch();
                    (f(&socket)?, socket)
                }
                Entry::Vacant(entry) => {
                    let socket = self.bind(addr)?;
                    let rs = f(&socket)?;
                    entry.insert(socket.clone());
                    (rs, socket)
                }
            }
        };
        // close_all may have drained the registry before the insert landed
        if self.is_closed() {
            self.inner.sockets.remove(&socket.local_addr());
            if let Err(e) = socket.close() {
                log::warn!("close reuse socket {}: {e:?}", socket.local_addr());
            }
            return Err(Error::Closed);
        }
        Ok(rs)
    }

    fn bind(&self, addr: SocketAddr) -> Result<Arc<ReuseSocket<E>>> {
        let inner = &self.inner;
        let socket = ReuseSocket::bind(&inner.engine, addr, inner.config.recv_buffer_size)?;
        Ok(Arc::new(socket))
    }

    /// Choose the socket to dial `remote` from and associate it with `remote`.
    ///
    /// A listening socket that can reach `remote` is preferred, so the peer sees the same
    /// source port it would answer to. Otherwise a new ephemeral socket of the right family is
    /// bound.
    pub fn pick_for_dial(&self, remote: SocketAddr) -> Result<Association<E>> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        for entry in self.inner.sockets.iter() {
            let socket = entry.value();
            if !socket.is_listening() || !can_reach(socket.local_addr(), remote) {
                continue;
            }
            if let Ok(association) = socket.associate(remote) {
                log::debug!("dial {remote} from listening socket {}", socket.local_addr());
                return Ok(association);
            }
        }
        let bind_addr = if remote.is_ipv4() {
            DEFAULT_ADDRESS_V4
        } else {
            DEFAULT_ADDRESS_V6
        };
        self.with_socket(bind_addr, |socket| socket.associate(remote))
    }

    /// Run one idle sweep now.
    pub fn collect_garbage(&self) {
        self.inner.sweep(Instant::now());
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Arc<ReuseSocket<E>>> {
        self.inner.sockets.get(addr).map(|v| v.value().clone())
    }
    pub fn sockets(&self) -> Vec<Arc<ReuseSocket<E>>> {
        self.inner
            .sockets
            .iter()
            .map(|v| v.value().clone())
            .collect()
    }
    pub fn len(&self) -> usize {
        self.inner.sockets.len()
    }
    pub fn is_empty(&self) -> bool {
        self.inner.sockets.is_empty()
    }
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Close every socket and stop the sweep. Only the first call does anything.
    pub fn close_all(&self) -> io::Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.gc.lock().take();
        let mut rs = Ok(());
        self.inner.sockets.retain(|addr, socket| {
            if let Err(e) = socket.close() {
                log::warn!("close reuse socket {addr}: {e:?}");
                if rs.is_ok() {
                    rs = Err(e);
                }
            }
            false
        });
        rs
    }
}

impl<E: Engine> ManagerInner<E> {
    fn sweep(&self, now: Instant) {
        let idle_timeout = self.config.idle_timeout;
        self.sockets.retain(|addr, socket| {
            let closed = socket.close_if_idle(now, idle_timeout);
            if closed {
                log::debug!("idle reuse socket {addr} removed");
            }
            !closed
        });
    }
}

impl<E: Engine> Drop for ReuseManager<E> {
    fn drop(&mut self) {
        let _ = self.close_all();
    }
}

async fn gc_loop<E: Engine>(manager: Weak<ManagerInner<E>>, interval: Duration) {
    let mut interval = tokio::time::interval(interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(inner) = manager.upgrade() else {
            break;
        };
        if inner.closed.load(Ordering::Acquire) {
            break;
        }
        inner.sweep(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use super::ReuseManager;
    use crate::config::ReuseConfig;
    use crate::engine::mock::MockEngine;
    use crate::error::Error;

    fn manager(engine: &MockEngine) -> ReuseManager<MockEngine> {
        ReuseManager::new(engine.clone(), ReuseConfig::default())
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn free_port() -> SocketAddr {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_get_or_create_binds_once() {
        let engine = MockEngine::default();
        let manager = Arc::new(manager(&engine));
        let addr = free_port();
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(
                async move { manager.get_or_create(addr).unwrap() },
            ));
        }
        let mut sockets = Vec::new();
        for task in tasks {
            sockets.push(task.await.unwrap());
        }
        assert_eq!(engine.state.endpoints.load(Ordering::SeqCst), 1);
        assert_eq!(manager.len(), 1);
        for socket in &sockets {
            assert!(Arc::ptr_eq(socket, &sockets[0]));
            assert_eq!(socket.local_addr(), addr);
        }
    }

    #[tokio::test]
    async fn ephemeral_requests_bind_new_sockets() {
        let engine = MockEngine::default();
        let manager = manager(&engine);
        let a = manager.get_or_create(loopback()).unwrap();
        let b = manager.get_or_create(loopback()).unwrap();
        assert_ne!(a.local_addr(), b.local_addr());
        assert_eq!(manager.len(), 2);
        let again = manager.get_or_create(a.local_addr()).unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(manager.len(), 2);
    }

    #[tokio::test]
    async fn sweep_keeps_sockets_in_use() {
        let engine = MockEngine::default();
        let manager = manager(&engine);
        let dialing = manager.get_or_create(loopback()).unwrap();
        let association = dialing.associate("127.0.0.1:9000".parse().unwrap()).unwrap();
        let listening = manager.listen_socket(loopback()).unwrap();
        let idle = manager.get_or_create(loopback()).unwrap();

        let later = Instant::now() + Duration::from_secs(24 * 3600);
        manager.inner.sweep(later);
        assert_eq!(manager.len(), 2);
        assert!(manager.get(&dialing.local_addr()).is_some());
        assert!(manager.get(&listening.local_addr()).is_some());
        assert!(manager.get(&idle.local_addr()).is_none());
        assert!(idle.is_closed());

        drop(association);
        listening.detach_listener();
        manager.inner.sweep(Instant::now());
        assert_eq!(manager.len(), 2);
        manager.inner.sweep(later);
        assert!(manager.is_empty());
        assert_eq!(engine.state.closed_endpoints.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn sweep_continues_past_close_failures() {
        let engine = MockEngine::default();
        engine.state.fail_close.store(true, Ordering::SeqCst);
        let manager = manager(&engine);
        manager.get_or_create(loopback()).unwrap();
        manager.get_or_create(loopback()).unwrap();
        manager
            .inner
            .sweep(Instant::now() + Duration::from_secs(3600));
        assert!(manager.is_empty());
        assert_eq!(engine.state.closed_endpoints.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn periodic_sweep_removes_idle_sockets() {
        let engine = MockEngine::default();
        let config = ReuseConfig::default()
            .set_gc_interval(Duration::from_millis(20))
            .set_idle_timeout(Duration::ZERO);
        let manager = ReuseManager::new(engine.clone(), config);
        let socket = manager.listen_socket(loopback()).unwrap();
        manager.get_or_create(loopback()).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(manager.len(), 1);
        assert!(!socket.is_closed());
    }

    #[tokio::test]
    async fn dial_prefers_listening_socket() {
        let engine = MockEngine::default();
        let manager = manager(&engine);
        manager.get_or_create(loopback()).unwrap();
        let listening = manager.listen_socket(loopback()).unwrap();

        let association = manager
            .pick_for_dial("127.0.0.1:9000".parse().unwrap())
            .unwrap();
        assert!(Arc::ptr_eq(association.socket(), &listening));
        assert_eq!(listening.association_count(), 1);

        // a loopback bind cannot reach a public address
        let association = manager
            .pick_for_dial("192.0.2.1:9000".parse().unwrap())
            .unwrap();
        assert!(!Arc::ptr_eq(association.socket(), &listening));
        assert!(association.socket().local_addr().ip().is_unspecified());
        assert_eq!(manager.len(), 3);
    }

    #[tokio::test]
    async fn dial_without_listener_binds_ephemeral() {
        let engine = MockEngine::default();
        let manager = manager(&engine);
        let association = manager
            .pick_for_dial("127.0.0.1:9000".parse().unwrap())
            .unwrap();
        let socket = association.socket().clone();
        assert_ne!(socket.local_addr().port(), 0);
        assert!(manager.get(&socket.local_addr()).is_some());
        drop(association);
        assert_eq!(socket.association_count(), 0);
    }

    #[tokio::test]
    async fn second_listener_on_same_socket_fails() {
        let engine = MockEngine::default();
        let manager = manager(&engine);
        let socket = manager.listen_socket(loopback()).unwrap();
        let err = manager.listen_socket(socket.local_addr()).err().unwrap();
        assert!(matches!(err, Error::Bind { .. }));
    }

    #[tokio::test]
    async fn close_all_is_idempotent() {
        let engine = MockEngine::default();
        let manager = manager(&engine);
        let socket = manager.get_or_create(loopback()).unwrap();
        let _association = socket.associate("127.0.0.1:9000".parse().unwrap()).unwrap();
        manager.close_all().unwrap();
        manager.close_all().unwrap();
        assert!(manager.is_empty());
        assert!(socket.is_closed());
        assert_eq!(engine.state.closed_endpoints.load(Ordering::SeqCst), 1);
        assert!(matches!(
            manager.get_or_create(loopback()),
            Err(Error::Closed)
        ));
        assert!(matches!(
            manager.pick_for_dial("127.0.0.1:9000".parse().unwrap()),
            Err(Error::Closed)
        ));
    }

    #[tokio::test]
    async fn close_racing_a_bind_closes_the_new_socket() {
        let engine = MockEngine::default();
        let manager = manager(&engine);
        let rs = manager.with_socket(loopback(), |socket| {
            manager.close_all().unwrap();
            Ok(socket.clone())
        });
        assert!(matches!(rs, Err(Error::Closed)));
        assert!(manager.is_empty());
        assert_eq!(engine.state.endpoints.load(Ordering::SeqCst), 1);
        assert_eq!(engine.state.closed_endpoints.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn swept_port_can_be_bound_again() {
        let engine = MockEngine::default();
        let manager = ReuseManager::new(
            engine.clone(),
            ReuseConfig::default().set_idle_timeout(Duration::ZERO),
        );
        let socket = manager.get_or_create(loopback()).unwrap();
        let addr = socket.local_addr();
        manager.collect_garbage();
        assert!(manager.is_empty());
        assert!(socket.is_closed());
        std::net::UdpSocket::bind(addr).unwrap();
        let again = manager.get_or_create(addr).unwrap();
        assert!(!Arc::ptr_eq(&socket, &again));
        assert_eq!(again.local_addr(), addr);
    }
}
