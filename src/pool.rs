//! Upstream connection pool
//!
//! A lazy, capped pool of TCP connections to a single upstream address.
//! Connections are dialed on demand through an injected dialer, reused
//! through an idle set, evicted after sitting idle too long, and bounded so
//! that at most `max_size` sockets to the device exist at once.
//!
//! Ownership model: an idle connection belongs to the pool; an acquired
//! [`PooledConn`] is exclusively lent to one caller. [`PooledConn::release`]
//! hands the socket back for reuse; dropping the guard without releasing
//! closes the socket and frees its capacity slot, which is the right move
//! after any transport error.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use log::debug;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::{sleep, sleep_until, timeout, Instant as TokioInstant};

use crate::error::{ProxyError, ProxyResult};

/// Default capacity bound when the configured one is zero
pub const DEFAULT_POOL_MAX_SIZE: usize = 10;

/// Default idle lifetime when the configured one is zero
pub const DEFAULT_POOL_MAX_IDLE: Duration = Duration::from_secs(300);

/// Default acquire deadline when the configured one is zero
pub const DEFAULT_POOL_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for each connection dialed during pool construction
const INITIAL_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Period of the background idle sweep
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Dialer seam: produces one new upstream connection per call
///
/// The dialer owns its connect timeout; the pool additionally caps dials
/// with the caller's acquire deadline.
pub type Dialer = Arc<dyn Fn() -> BoxFuture<'static, ProxyResult<TcpStream>> + Send + Sync>;

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections dialed eagerly at construction
    pub initial_size: usize,
    /// Hard cap on simultaneous sockets to the upstream
    pub max_size: usize,
    /// Idle lifetime before a connection is closed
    pub max_idle_time: Duration,
    /// How long `acquire` waits for an idle connection or free capacity
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_size: 0,
            max_size: DEFAULT_POOL_MAX_SIZE,
            max_idle_time: DEFAULT_POOL_MAX_IDLE,
            acquire_timeout: DEFAULT_POOL_ACQUIRE_TIMEOUT,
        }
    }
}

impl PoolConfig {
    fn sanitized(mut self) -> Self {
        if self.max_size == 0 {
            self.max_size = DEFAULT_POOL_MAX_SIZE;
        }
        if self.max_idle_time.is_zero() {
            self.max_idle_time = DEFAULT_POOL_MAX_IDLE;
        }
        if self.acquire_timeout.is_zero() {
            self.acquire_timeout = DEFAULT_POOL_ACQUIRE_TIMEOUT;
        }
        self.initial_size = self.initial_size.min(self.max_size);
        self
    }
}

/// Pool statistics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub active: usize,
    pub max_size: usize,
}

struct IdleConn {
    stream: TcpStream,
    last_used: Instant,
}

struct PoolState {
    idle: VecDeque<IdleConn>,
    /// Sockets in existence: idle plus lent out plus dials in flight
    size: usize,
    closed: bool,
}

struct PoolInner {
    state: Mutex<PoolState>,
    /// Woken on release and on freed capacity
    released: Notify,
    /// Woken once on close, stops the sweep task
    closed_notify: Notify,
    dialer: Dialer,
    config: PoolConfig,
}

impl PoolInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        // Lock holders never panic, so poisoning cannot occur in practice.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Undo an optimistic size increment after a failed dial
    fn forget_one(&self) {
        self.lock().size -= 1;
        self.released.notify_one();
    }

    /// Take back a socket whose lease ended
    fn put(&self, stream: TcpStream) {
        let mut state = self.lock();
        if state.closed {
            state.size -= 1;
            drop(state);
            drop(stream);
            return;
        }
        state.idle.push_back(IdleConn {
            stream,
            last_used: Instant::now(),
        });
        drop(state);
        self.released.notify_one();
    }

    /// Drop a socket whose lease ended in error
    fn discard(&self, stream: TcpStream) {
        self.lock().size -= 1;
        drop(stream);
        self.released.notify_one();
    }

    fn evict_stale(&self) {
        let mut evicted = 0;
        let stale: Vec<IdleConn> = {
            let mut state = self.lock();
            let max_idle = self.config.max_idle_time;
            let mut keep = VecDeque::with_capacity(state.idle.len());
            let mut stale = Vec::new();
            while let Some(idle) = state.idle.pop_front() {
                if idle.last_used.elapsed() > max_idle {
                    state.size -= 1;
                    evicted += 1;
                    stale.push(idle);
                } else {
                    keep.push_back(idle);
                }
            }
            state.idle = keep;
            stale
        };
        drop(stale);
        if evicted > 0 {
            debug!("pool sweep closed {} idle connection(s)", evicted);
            self.released.notify_one();
        }
    }
}

/// Connection pool for one upstream address
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a pool, eagerly dialing `initial_size` connections
    ///
    /// A failed initial dial fails construction so callers learn about an
    /// unreachable upstream at start rather than on first traffic.
    pub async fn connect(config: PoolConfig, dialer: Dialer) -> ProxyResult<Self> {
        let config = config.sanitized();
        let initial = config.initial_size;
        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState {
                idle: VecDeque::with_capacity(config.max_size),
                size: 0,
                closed: false,
            }),
            released: Notify::new(),
            closed_notify: Notify::new(),
            dialer,
            config,
        });

        for _ in 0..initial {
            let stream = timeout(INITIAL_DIAL_TIMEOUT, (inner.dialer)())
                .await
                .map_err(|_| {
                    ProxyError::timeout("initial pool dial", INITIAL_DIAL_TIMEOUT.as_millis() as u64)
                })??;
            let mut state = inner.lock();
            state.idle.push_back(IdleConn {
                stream,
                last_used: Instant::now(),
            });
            state.size += 1;
        }

        tokio::spawn(sweep_loop(Arc::downgrade(&inner)));

        Ok(Self { inner })
    }

    /// Acquire a connection, waiting up to the configured acquire timeout
    ///
    /// Preference order: a fresh-enough idle connection, then a new dial if
    /// capacity allows, then waiting for a release. Stale idles found along
    /// the way are closed and do not count against the caller's deadline.
    pub async fn acquire(&self) -> ProxyResult<PooledConn> {
        let acquire_timeout = self.inner.config.acquire_timeout;
        let deadline = TokioInstant::now() + acquire_timeout;

        loop {
            let released = self.inner.released.notified();

            enum Plan {
                Ready(TcpStream),
                Dial,
                Wait,
            }

            let plan = {
                let mut state = self.inner.lock();
                if state.closed {
                    return Err(ProxyError::PoolClosed);
                }
                loop {
                    match state.idle.pop_front() {
                        Some(idle) => {
                            if idle.last_used.elapsed() > self.inner.config.max_idle_time {
                                state.size -= 1;
                                continue;
                            }
                            break Plan::Ready(idle.stream);
                        }
                        None if state.size < self.inner.config.max_size => {
                            state.size += 1;
                            break Plan::Dial;
                        }
                        None => break Plan::Wait,
                    }
                }
            };

            match plan {
                Plan::Ready(stream) => {
                    return Ok(PooledConn::new(stream, &self.inner));
                }
                Plan::Dial => {
                    return match tokio::time::timeout_at(deadline, (self.inner.dialer)()).await {
                        Ok(Ok(stream)) => Ok(PooledConn::new(stream, &self.inner)),
                        Ok(Err(err)) => {
                            self.inner.forget_one();
                            Err(err)
                        }
                        Err(_) => {
                            self.inner.forget_one();
                            Err(ProxyError::pool_exhausted(acquire_timeout.as_millis() as u64))
                        }
                    };
                }
                Plan::Wait => {
                    tokio::select! {
                        _ = released => continue,
                        _ = sleep_until(deadline) => {
                            return Err(ProxyError::pool_exhausted(
                                acquire_timeout.as_millis() as u64,
                            ));
                        }
                    }
                }
            }
        }
    }

    /// Close the pool: idle sockets close now, future acquires fail
    ///
    /// Connections currently lent out are closed by their holders on drop.
    pub fn close(&self) {
        let drained: Vec<IdleConn> = {
            let mut state = self.inner.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.size -= state.idle.len();
            state.idle.drain(..).collect()
        };
        drop(drained);
        self.inner.released.notify_waiters();
        self.inner.closed_notify.notify_waiters();
        debug!("connection pool closed");
    }

    /// Whether `close` has run
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Current pool statistics
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        PoolStats {
            total: state.size,
            idle: state.idle.len(),
            active: state.size - state.idle.len(),
            max_size: self.inner.config.max_size,
        }
    }
}

/// Periodically close idle connections that outlived `max_idle_time`
///
/// Holds only a weak reference so an abandoned pool is collectable; exits
/// on close notification.
async fn sweep_loop(pool: Weak<PoolInner>) {
    loop {
        let Some(inner) = pool.upgrade() else { return };
        if inner.lock().closed {
            return;
        }
        let closed = inner.closed_notify.notified();
        tokio::select! {
            _ = sleep(SWEEP_INTERVAL) => inner.evict_stale(),
            _ = closed => return,
        }
    }
}

/// A pooled connection exclusively lent to one caller
///
/// Derefs to [`TcpStream`]. Call [`release`](Self::release) after a clean
/// exchange; drop the guard after an error to close the socket.
pub struct PooledConn {
    stream: Option<TcpStream>,
    pool: Arc<PoolInner>,
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn").finish()
    }
}

impl PooledConn {
    fn new(stream: TcpStream, pool: &Arc<PoolInner>) -> Self {
        Self {
            stream: Some(stream),
            pool: Arc::clone(pool),
        }
    }

    /// Return the connection to the idle set for reuse
    pub fn release(mut self) {
        if let Some(stream) = self.stream.take() {
            self.pool.put(stream);
        }
    }
}

impl std::ops::Deref for PooledConn {
    type Target = TcpStream;

    fn deref(&self) -> &TcpStream {
        self.stream.as_ref().expect("connection used after release")
    }
}

impl std::ops::DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut TcpStream {
        self.stream.as_mut().expect("connection used after release")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.pool.discard(stream);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    /// Upstream stand-in that accepts and parks connections
    async fn spawn_upstream() -> (std::net::SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        let counter = accepts.clone();
        tokio::spawn(async move {
            let mut parked = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                parked.push(stream);
            }
        });
        (addr, accepts)
    }

    fn dialer_to(addr: std::net::SocketAddr) -> Dialer {
        Arc::new(move || {
            Box::pin(async move { TcpStream::connect(addr).await.map_err(ProxyError::from) })
        })
    }

    fn quick_config() -> PoolConfig {
        PoolConfig {
            initial_size: 0,
            max_size: 2,
            max_idle_time: Duration::from_secs(60),
            acquire_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_lazy_dial_and_release() {
        let (addr, accepts) = spawn_upstream().await;
        let pool = ConnectionPool::connect(quick_config(), dialer_to(addr))
            .await
            .unwrap();

        let conn = pool.acquire().await.unwrap();
        assert_eq!(
            pool.stats(),
            PoolStats { total: 1, idle: 0, active: 1, max_size: 2 }
        );

        conn.release();
        assert_eq!(
            pool.stats(),
            PoolStats { total: 1, idle: 1, active: 0, max_size: 2 }
        );

        // reuse must not dial again
        let conn = pool.acquire().await.unwrap();
        conn.release();
        assert_eq!(accepts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_initial_size_prepopulates() {
        let (addr, accepts) = spawn_upstream().await;
        let config = PoolConfig {
            initial_size: 2,
            ..quick_config()
        };
        let pool = ConnectionPool::connect(config, dialer_to(addr)).await.unwrap();
        assert_eq!(
            pool.stats(),
            PoolStats { total: 2, idle: 2, active: 0, max_size: 2 }
        );
        assert_eq!(accepts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_capacity_bound_and_exhaustion() {
        let (addr, _) = spawn_upstream().await;
        let config = PoolConfig {
            max_size: 1,
            ..quick_config()
        };
        let pool = ConnectionPool::connect(config, dialer_to(addr)).await.unwrap();

        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, ProxyError::PoolExhausted { .. }));
        assert_eq!(pool.stats().total, 1);

        held.release();
        let conn = pool.acquire().await.unwrap();
        conn.release();
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let (addr, _) = spawn_upstream().await;
        let config = PoolConfig {
            max_size: 1,
            acquire_timeout: Duration::from_secs(5),
            ..quick_config()
        };
        let pool = ConnectionPool::connect(config, dialer_to(addr)).await.unwrap();

        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        held.release();

        let conn = waiter.await.unwrap().unwrap();
        conn.release();
    }

    #[tokio::test]
    async fn test_stale_idle_closed_on_acquire() {
        let (addr, accepts) = spawn_upstream().await;
        let config = PoolConfig {
            max_idle_time: Duration::from_millis(20),
            ..quick_config()
        };
        let pool = ConnectionPool::connect(config, dialer_to(addr)).await.unwrap();

        let conn = pool.acquire().await.unwrap();
        conn.release();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let conn = pool.acquire().await.unwrap();
        conn.release();
        // the stale socket was replaced by a fresh dial
        assert_eq!(accepts.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().total, 1);
    }

    #[tokio::test]
    async fn test_dial_failure_frees_capacity() {
        // no listener behind this address
        let unreachable: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
        let config = PoolConfig {
            max_size: 1,
            ..quick_config()
        };
        let pool = ConnectionPool::connect(config, dialer_to(unreachable))
            .await
            .unwrap();

        assert!(pool.acquire().await.is_err());
        assert_eq!(pool.stats().total, 0);
        // the slot must be reusable after the failure
        assert!(pool.acquire().await.is_err());
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test]
    async fn test_close_semantics() {
        let (addr, _) = spawn_upstream().await;
        let pool = ConnectionPool::connect(quick_config(), dialer_to(addr))
            .await
            .unwrap();

        let held = pool.acquire().await.unwrap();
        let idle = pool.acquire().await.unwrap();
        idle.release();

        pool.close();
        assert!(pool.is_closed());
        assert!(matches!(pool.acquire().await.unwrap_err(), ProxyError::PoolClosed));

        // releasing into a closed pool closes the socket instead
        held.release();
        assert_eq!(pool.stats().total, 0);

        // close is idempotent
        pool.close();
    }

    #[tokio::test]
    async fn test_drop_discards_and_frees_slot() {
        let (addr, accepts) = spawn_upstream().await;
        let config = PoolConfig {
            max_size: 1,
            ..quick_config()
        };
        let pool = ConnectionPool::connect(config, dialer_to(addr)).await.unwrap();

        let conn = pool.acquire().await.unwrap();
        drop(conn);
        assert_eq!(pool.stats().total, 0);

        let conn = pool.acquire().await.unwrap();
        conn.release();
        assert_eq!(accepts.load(Ordering::SeqCst), 2);
    }
}
