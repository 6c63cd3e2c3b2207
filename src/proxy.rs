//! Proxy instance: listener, session loops, forward engine, split planner
//!
//! One [`ProxyInstance`] is one tenant: a listen endpoint, a pooled path to
//! one upstream device, and the machinery between them. Every accepted
//! client runs its own session task; all sessions of an instance share one
//! upstream mutex so request/response pairing on reused sockets can never
//! interleave, even though Modbus/TCP nominally allows it. Oversize
//! register reads are split into bounded sub-reads and their payloads
//! stitched back together; everything else is forwarded byte-for-byte.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};

use crate::config::ProxyConfig;
use crate::devices::DeviceTracker;
use crate::error::{ProxyError, ProxyResult};
use crate::frame::{self, ReadPayload};
use crate::pool::{ConnectionPool, Dialer, PoolConfig, PoolStats};
use crate::utils::format::bytes_to_hex;

/// First retry delay; doubles per subsequent attempt
const RETRY_BASE_BACKOFF: Duration = Duration::from_millis(100);

/// Pause after a failed accept before trying again
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Upstream pool shape, fixed per instance
const UPSTREAM_POOL_INITIAL: usize = 1;
const UPSTREAM_POOL_MAX: usize = 10;
const UPSTREAM_POOL_IDLE: Duration = Duration::from_secs(300);

/// Runtime status of a proxy instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProxyStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl std::fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProxyStatus::Stopped => "Stopped",
            ProxyStatus::Starting => "Starting",
            ProxyStatus::Running => "Running",
            ProxyStatus::Stopping => "Stopping",
            ProxyStatus::Error => "Error",
        };
        f.write_str(name)
    }
}

/// State shared with the accept and session tasks
struct ProxyCore {
    config: ProxyConfig,
    /// Serializes the full request/response exchange on the upstream,
    /// including retries and all sub-requests of a split
    upstream_lock: AsyncMutex<()>,
    requests: AtomicU64,
    errors: AtomicU64,
    tracker: Option<Arc<DeviceTracker>>,
}

/// Handles owned by the instance only while running
struct Runtime {
    status: ProxyStatus,
    last_start: Option<Instant>,
    shutdown: Option<watch::Sender<bool>>,
    pool: Option<ConnectionPool>,
    accept_task: Option<tokio::task::JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

/// A single front-facing proxy endpoint bound to one upstream device
pub struct ProxyInstance {
    core: Arc<ProxyCore>,
    runtime: Mutex<Runtime>,
}

impl ProxyInstance {
    /// Create a stopped instance from its configuration
    pub fn new(config: ProxyConfig, tracker: Option<Arc<DeviceTracker>>) -> Self {
        Self {
            core: Arc::new(ProxyCore {
                config,
                upstream_lock: AsyncMutex::new(()),
                requests: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                tracker,
            }),
            runtime: Mutex::new(Runtime {
                status: ProxyStatus::Stopped,
                last_start: None,
                shutdown: None,
                pool: None,
                accept_task: None,
                local_addr: None,
            }),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.core.config
    }

    pub fn id(&self) -> &str {
        &self.core.config.id
    }

    pub fn status(&self) -> ProxyStatus {
        self.runtime_lock().status
    }

    /// Time since the last successful start, zero unless Running
    pub fn uptime(&self) -> Duration {
        let runtime = self.runtime_lock();
        match (runtime.status, runtime.last_start) {
            (ProxyStatus::Running, Some(started)) => started.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// Successfully proxied requests since creation
    pub fn request_count(&self) -> u64 {
        self.core.requests.load(Ordering::Relaxed)
    }

    /// Client sessions dropped on upstream failure since creation
    pub fn error_count(&self) -> u64 {
        self.core.errors.load(Ordering::Relaxed)
    }

    /// Bound listen address while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.runtime_lock().local_addr
    }

    /// Upstream pool statistics while running
    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.runtime_lock().pool.as_ref().map(|p| p.stats())
    }

    /// Bind the listener, connect the pool, spawn the accept loop
    ///
    /// A no-op when already Running or Starting. Bind or pool failure
    /// leaves the instance in `Error` status with nothing running.
    pub async fn start(&self) -> ProxyResult<()> {
        {
            let mut runtime = self.runtime_lock();
            match runtime.status {
                ProxyStatus::Running | ProxyStatus::Starting => return Ok(()),
                ProxyStatus::Stopping => {
                    return Err(ProxyError::configuration("proxy is stopping"));
                }
                ProxyStatus::Stopped | ProxyStatus::Error => {
                    runtime.status = ProxyStatus::Starting;
                }
            }
        }

        match self.start_inner().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.runtime_lock().status = ProxyStatus::Error;
                error!("[{}] start failed: {}", self.id(), err);
                Err(err)
            }
        }
    }

    async fn start_inner(&self) -> ProxyResult<()> {
        let config = &self.core.config;
        let listen = config.listen_socket()?;

        let listener = TcpListener::bind(listen)
            .await
            .map_err(|e| ProxyError::bind(format!("{}: {}", listen, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ProxyError::bind(e.to_string()))?;

        let pool = ConnectionPool::connect(
            PoolConfig {
                initial_size: UPSTREAM_POOL_INITIAL,
                max_size: UPSTREAM_POOL_MAX,
                max_idle_time: UPSTREAM_POOL_IDLE,
                acquire_timeout: config.connect_timeout(),
            },
            upstream_dialer(config.target_addr.clone(), config.connect_timeout()),
        )
        .await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(Arc::clone(&self.core).accept_loop(
            listener,
            pool.clone(),
            shutdown_rx,
        ));

        {
            let mut runtime = self.runtime_lock();
            runtime.status = ProxyStatus::Running;
            runtime.last_start = Some(Instant::now());
            runtime.shutdown = Some(shutdown_tx);
            runtime.pool = Some(pool);
            runtime.accept_task = Some(accept_task);
            runtime.local_addr = Some(local_addr);
        }

        info!(
            "[{}] proxy listening on {} -> {}",
            self.id(),
            local_addr,
            config.target_addr
        );
        Ok(())
    }

    /// Signal shutdown, close listener and pool, join every session
    ///
    /// Returns only after all spawned tasks have exited. A no-op unless
    /// the instance is Running.
    pub async fn stop(&self) {
        let (shutdown, pool, accept_task) = {
            let mut runtime = self.runtime_lock();
            if runtime.status != ProxyStatus::Running {
                return;
            }
            runtime.status = ProxyStatus::Stopping;
            runtime.local_addr = None;
            (
                runtime.shutdown.take(),
                runtime.pool.take(),
                runtime.accept_task.take(),
            )
        };

        info!("[{}] stopping proxy", self.id());
        if let Some(shutdown) = &shutdown {
            let _ = shutdown.send(true);
        }
        if let Some(pool) = &pool {
            pool.close();
        }
        if let Some(task) = accept_task {
            let _ = task.await;
        }

        self.runtime_lock().status = ProxyStatus::Stopped;
        info!("[{}] proxy stopped", self.id());
    }

    fn runtime_lock(&self) -> std::sync::MutexGuard<'_, Runtime> {
        match self.runtime.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Build the pool dialer for one upstream address
fn upstream_dialer(target: String, connect_timeout: Duration) -> Dialer {
    Arc::new(move || {
        let target = target.clone();
        Box::pin(async move {
            let stream = timeout(connect_timeout, TcpStream::connect(target.as_str()))
                .await
                .map_err(|_| {
                    ProxyError::timeout("upstream dial", connect_timeout.as_millis() as u64)
                })?
                .map_err(ProxyError::from)?;
            Ok(stream)
        })
    })
}

/// Resolve once the shutdown flag is set
///
/// The watch channel is level-triggered, so sessions spawned after the
/// signal still observe it.
async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // sender gone counts as shutdown
            return;
        }
    }
}

impl ProxyCore {
    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        pool: ConnectionPool,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown_signalled(&mut shutdown) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("[{}] accepted client {}", self.config.id, peer);
                        let core = Arc::clone(&self);
                        let pool = pool.clone();
                        let session_shutdown = shutdown.clone();
                        sessions.spawn(async move {
                            core.client_session(stream, peer, pool, session_shutdown).await;
                        });
                    }
                    Err(e) => {
                        error!("[{}] accept error: {}", self.config.id, e);
                        tokio::select! {
                            _ = shutdown_signalled(&mut shutdown) => break,
                            _ = sleep(ACCEPT_ERROR_BACKOFF) => {}
                        }
                    }
                }
            }
        }

        drop(listener);
        while sessions.join_next().await.is_some() {}
        debug!("[{}] all client sessions drained", self.config.id);
    }

    /// One accepted client: read a frame, complete the exchange, answer
    ///
    /// Strictly synchronous per connection; the next request is read only
    /// after the previous response was written.
    async fn client_session(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
        pool: ConnectionPool,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if let Some(tracker) = &self.tracker {
            tracker.track_connection(peer, &self.config.id);
        }

        let read_timeout = self.config.frame_read_timeout();

        loop {
            let request = tokio::select! {
                _ = shutdown_signalled(&mut shutdown) => return,
                result = timeout(read_timeout, frame::read_frame(&mut stream)) => match result {
                    Ok(Ok(request)) => request,
                    Ok(Err(ProxyError::ConnectionClosed)) => {
                        debug!("[{}] client {} disconnected", self.config.id, peer);
                        return;
                    }
                    Ok(Err(e)) => {
                        info!("[{}] client {} read error: {}", self.config.id, peer, e);
                        return;
                    }
                    Err(_) => {
                        info!(
                            "[{}] client {} idle past {}s read timeout",
                            self.config.id, peer, self.config.read_timeout
                        );
                        return;
                    }
                }
            };

            debug!(
                "[{}] request from {}: {}",
                self.config.id,
                peer,
                bytes_to_hex(&request)
            );

            let outcome = if self.config.max_read_size > 0 && frame::is_read_request(&request) {
                self.handle_split_read(&pool, &request).await
            } else {
                self.forward(&pool, &request).await
            };

            let response = match outcome {
                Ok(response) => response,
                Err(e) if e.is_cancellation() => return,
                Err(e) => {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    error!("[{}] dropping client {}: {}", self.config.id, peer, e);
                    return;
                }
            };

            self.requests.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = stream.write_all(&response).await {
                info!("[{}] client {} write error: {}", self.config.id, peer, e);
                return;
            }
        }
    }

    /// Forward one frame to the upstream under the pairing lock
    async fn forward(&self, pool: &ConnectionPool, request: &[u8]) -> ProxyResult<Vec<u8>> {
        let _guard = self.upstream_lock.lock().await;
        self.forward_locked(pool, request).await
    }

    /// Retry-driving exchange; the caller must hold `upstream_lock`
    ///
    /// One attempt is acquire, write under the connection timeout, read one
    /// frame under the read timeout. Any failure closes the pooled socket
    /// and, when recoverable, retries after `100ms * 2^(attempt-1)`.
    async fn forward_locked(&self, pool: &ConnectionPool, request: &[u8]) -> ProxyResult<Vec<u8>> {
        let connect_timeout = self.config.connect_timeout();
        let read_timeout = self.config.frame_read_timeout();
        let attempts = self.config.max_retries + 1;
        let mut last_err = ProxyError::io("no forward attempt executed");

        for attempt in 0..attempts {
            if attempt > 0 {
                let backoff = RETRY_BASE_BACKOFF * (1u32 << (attempt - 1));
                debug!(
                    "[{}] retrying upstream exchange in {:?} (attempt {}/{})",
                    self.config.id,
                    backoff,
                    attempt + 1,
                    attempts
                );
                sleep(backoff).await;
            }

            let mut conn = match pool.acquire().await {
                Ok(conn) => conn,
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    warn!("[{}] upstream acquire failed: {}", self.config.id, e);
                    last_err = e;
                    continue;
                }
            };

            let write_result = timeout(connect_timeout, conn.write_all(request))
                .await
                .map_err(|_| {
                    ProxyError::timeout("upstream write", connect_timeout.as_millis() as u64)
                })
                .and_then(|r| r.map_err(ProxyError::from));
            if let Err(e) = write_result {
                warn!("[{}] upstream write failed: {}", self.config.id, e);
                last_err = e;
                // dropping the guard closes the broken socket
                continue;
            }

            match timeout(read_timeout, frame::read_frame(&mut *conn)).await {
                Ok(Ok(response)) => {
                    conn.release();
                    return Ok(response);
                }
                Ok(Err(e)) => {
                    warn!("[{}] upstream read failed: {}", self.config.id, e);
                    last_err = e;
                }
                Err(_) => {
                    let e = ProxyError::timeout("upstream read", read_timeout.as_millis() as u64);
                    warn!("[{}] {}", self.config.id, e);
                    last_err = e;
                }
            }
        }

        Err(ProxyError::upstream_unavailable(attempts, &last_err))
    }

    /// Split an oversize register read into bounded sub-reads
    ///
    /// Bit-oriented reads and anything within the threshold forward whole.
    /// The pairing lock is held across the entire sub-request sequence so
    /// no other session can interleave with the chunks.
    async fn handle_split_read(
        &self,
        pool: &ConnectionPool,
        request: &[u8],
    ) -> ProxyResult<Vec<u8>> {
        let parsed = match frame::parse_read_request(request) {
            Ok(parsed) => parsed,
            // undersized read-family frame: forward as-is, the device decides
            Err(_) => return self.forward(pool, request).await,
        };

        if parsed.function.is_bit_oriented() || parsed.quantity <= self.config.max_read_size {
            return self.forward(pool, request).await;
        }

        let expected_total = parsed.function.payload_len(parsed.quantity);
        if expected_total > frame::MAX_RESPONSE_PAYLOAD {
            return Err(ProxyError::AggregationTooLarge {
                bytes: expected_total,
            });
        }

        debug!(
            "[{}] splitting read of {} registers at {} into chunks of {}",
            self.config.id, parsed.quantity, parsed.start, self.config.max_read_size
        );

        let _guard = self.upstream_lock.lock().await;

        let mut aggregated = Vec::with_capacity(expected_total);
        let mut remaining = parsed.quantity;
        let mut current = parsed.start;

        while remaining > 0 {
            let chunk = remaining.min(self.config.max_read_size);
            let sub_request =
                frame::build_read_request(0, parsed.unit_id, parsed.function, current, chunk);
            let mut sub_response = self.forward_locked(pool, &sub_request).await?;

            let exception = match frame::parse_read_response(&sub_response, parsed.function)? {
                ReadPayload::Exception(code) => {
                    debug!(
                        "[{}] upstream exception 0x{:02X} at address {}, aborting split",
                        self.config.id, code, current
                    );
                    true
                }
                ReadPayload::Data(payload) => {
                    let expected = parsed.function.payload_len(chunk);
                    if payload.len() != expected {
                        return Err(ProxyError::malformed_response(format!(
                            "chunk at {} returned {} payload bytes, expected {}",
                            current,
                            payload.len(),
                            expected
                        )));
                    }
                    aggregated.extend_from_slice(payload);
                    false
                }
            };

            if exception {
                // propagate the device's verdict verbatim, restoring the
                // client's transaction id
                frame::set_transaction_id(&mut sub_response, parsed.transaction_id);
                return Ok(sub_response);
            }

            remaining -= chunk;
            current = current.wrapping_add(chunk);
        }

        frame::build_read_response(
            parsed.transaction_id,
            parsed.unit_id,
            parsed.function,
            &aggregated,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::io::AsyncReadExt;

    /// What the scripted upstream does with the next request it receives
    #[derive(Debug, Clone, Copy)]
    enum Reply {
        /// Answer with a well-formed read response, payload bytes 0xAB
        Normal,
        /// Answer with an exception response carrying this code
        Exception(u8),
        /// Drop the connection without answering
        CloseConnection,
    }

    struct MockUpstream {
        addr: SocketAddr,
        requests: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl MockUpstream {
        /// Requests observed so far, in arrival order
        fn requests(&self) -> Vec<Vec<u8>> {
            self.requests.lock().unwrap().clone()
        }
    }

    /// Spawn a Modbus device stand-in that consumes `script` one request at
    /// a time and answers `Normal` once the script is exhausted.
    async fn spawn_upstream(script: Vec<Reply>) -> MockUpstream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let script = Arc::new(Mutex::new(VecDeque::from(script)));

        let seen = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let seen = seen.clone();
                let script = script.clone();
                tokio::spawn(async move {
                    loop {
                        let Ok(request) = frame::read_frame(&mut stream).await else {
                            return;
                        };
                        seen.lock().unwrap().push(request.clone());
                        let reply = script.lock().unwrap().pop_front().unwrap_or(Reply::Normal);
                        match reply {
                            Reply::Normal => {
                                let parsed = frame::parse_read_request(&request).unwrap();
                                let payload =
                                    vec![0xAB; parsed.function.payload_len(parsed.quantity)];
                                let response = frame::build_read_response(
                                    parsed.transaction_id,
                                    parsed.unit_id,
                                    parsed.function,
                                    &payload,
                                )
                                .unwrap();
                                if stream.write_all(&response).await.is_err() {
                                    return;
                                }
                            }
                            Reply::Exception(code) => {
                                let mut response = request[..8].to_vec();
                                response[4] = 0;
                                response[5] = 3; // unit + fc + exception code
                                response[7] |= 0x80;
                                response.push(code);
                                if stream.write_all(&response).await.is_err() {
                                    return;
                                }
                            }
                            Reply::CloseConnection => {
                                return;
                            }
                        }
                    }
                });
            }
        });

        MockUpstream { addr, requests }
    }

    fn test_config(upstream: SocketAddr, max_read_size: u16) -> ProxyConfig {
        let mut cfg = ProxyConfig::new("test", "test proxy", "127.0.0.1:0", "placeholder");
        cfg.target_addr = upstream.to_string();
        cfg.connection_timeout = 2;
        cfg.read_timeout = 2;
        cfg.max_retries = 2;
        cfg.max_read_size = max_read_size;
        cfg
    }

    async fn exchange(client: &mut TcpStream, request: &[u8]) -> Vec<u8> {
        client.write_all(request).await.unwrap();
        frame::read_frame(client).await.unwrap()
    }

    #[tokio::test]
    async fn test_start_stop_state_machine() {
        let upstream = spawn_upstream(vec![]).await;
        let proxy = ProxyInstance::new(test_config(upstream.addr, 0), None);
        assert_eq!(proxy.status(), ProxyStatus::Stopped);
        assert_eq!(proxy.uptime(), Duration::ZERO);

        proxy.start().await.unwrap();
        assert_eq!(proxy.status(), ProxyStatus::Running);
        assert!(proxy.local_addr().is_some());

        // redundant start is a no-op
        proxy.start().await.unwrap();

        proxy.stop().await;
        assert_eq!(proxy.status(), ProxyStatus::Stopped);
        assert!(proxy.local_addr().is_none());

        // redundant stop is a no-op
        proxy.stop().await;

        // restart after stop works
        proxy.start().await.unwrap();
        assert_eq!(proxy.status(), ProxyStatus::Running);
        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_start_fails_when_upstream_unreachable() {
        let mut cfg = test_config("127.0.0.1:1".parse().unwrap(), 0);
        cfg.connection_timeout = 1;
        let proxy = ProxyInstance::new(cfg, None);
        assert!(proxy.start().await.is_err());
        assert_eq!(proxy.status(), ProxyStatus::Error);

        // an instance in Error may be started again
        let upstream = spawn_upstream(vec![]).await;
        let recovered = ProxyInstance::new(test_config(upstream.addr, 0), None);
        recovered.start().await.unwrap();
        recovered.stop().await;
    }

    #[tokio::test]
    async fn test_pass_through() {
        let upstream = spawn_upstream(vec![]).await;
        let proxy = ProxyInstance::new(test_config(upstream.addr, 0), None);
        proxy.start().await.unwrap();

        let mut client = TcpStream::connect(proxy.local_addr().unwrap()).await.unwrap();
        let request = frame::build_read_request(1, 1, frame::ReadFunction::HoldingRegisters, 0, 5);
        let response = exchange(&mut client, &request).await;

        assert_eq!(frame::transaction_id(&response), 1);
        assert_eq!(response[7], 0x03);
        assert_eq!(response[8], 10); // byte count for 5 registers
        assert_eq!(upstream.requests().len(), 1);
        assert_eq!(upstream.requests()[0], request);
        assert_eq!(proxy.request_count(), 1);
        assert_eq!(proxy.error_count(), 0);

        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_split_read_chunks_and_reassembly() {
        let upstream = spawn_upstream(vec![]).await;
        let proxy = ProxyInstance::new(test_config(upstream.addr, 10), None);
        proxy.start().await.unwrap();

        let mut client = TcpStream::connect(proxy.local_addr().unwrap()).await.unwrap();
        let request =
            frame::build_read_request(2, 1, frame::ReadFunction::HoldingRegisters, 0, 25);
        let response = exchange(&mut client, &request).await;

        // client sees one response: tx 2, length 0x35, byte count 0x32
        assert_eq!(
            &response[..9],
            &[0x00, 0x02, 0x00, 0x00, 0x00, 0x35, 0x01, 0x03, 0x32]
        );
        assert_eq!(response.len(), 6 + 53);

        // upstream saw three sub-requests: qty 10, 10, 5 at 0, 10, 20
        let seen = upstream.requests();
        assert_eq!(seen.len(), 3);
        let chunks: Vec<(u16, u16)> = seen
            .iter()
            .map(|f| {
                let p = frame::parse_read_request(f).unwrap();
                assert_eq!(p.transaction_id, 0);
                (p.start, p.quantity)
            })
            .collect();
        assert_eq!(chunks, vec![(0, 10), (10, 10), (20, 5)]);

        assert_eq!(proxy.request_count(), 1);
        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_split_exception_propagates_and_stops() {
        let upstream = spawn_upstream(vec![Reply::Normal, Reply::Exception(0x02)]).await;
        let proxy = ProxyInstance::new(test_config(upstream.addr, 10), None);
        proxy.start().await.unwrap();

        let mut client = TcpStream::connect(proxy.local_addr().unwrap()).await.unwrap();
        let request =
            frame::build_read_request(2, 1, frame::ReadFunction::HoldingRegisters, 0, 25);
        let response = exchange(&mut client, &request).await;

        // the exception frame comes back with the client's transaction id
        assert_eq!(
            response,
            vec![0x00, 0x02, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02]
        );
        // no third sub-request after the exception
        assert_eq!(upstream.requests().len(), 2);

        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_bit_reads_forward_whole() {
        let upstream = spawn_upstream(vec![]).await;
        let proxy = ProxyInstance::new(test_config(upstream.addr, 10), None);
        proxy.start().await.unwrap();

        let mut client = TcpStream::connect(proxy.local_addr().unwrap()).await.unwrap();
        // 100 coils exceeds the threshold but must not split
        let request = frame::build_read_request(7, 1, frame::ReadFunction::Coils, 0, 100);
        let response = exchange(&mut client, &request).await;

        assert_eq!(upstream.requests().len(), 1);
        assert_eq!(upstream.requests()[0], request);
        assert_eq!(frame::transaction_id(&response), 7);
        assert_eq!(response[8], 13); // 100 coils pack into 13 bytes

        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_oversize_aggregate_rejected_before_upstream() {
        let upstream = spawn_upstream(vec![]).await;
        let proxy = ProxyInstance::new(test_config(upstream.addr, 10), None);
        proxy.start().await.unwrap();

        let mut client = TcpStream::connect(proxy.local_addr().unwrap()).await.unwrap();
        // 200 registers would stitch to 400 payload bytes
        let request =
            frame::build_read_request(3, 1, frame::ReadFunction::HoldingRegisters, 0, 200);
        client.write_all(&request).await.unwrap();

        // the proxy drops the session instead of emitting a bad frame
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert!(upstream.requests().is_empty());
        assert_eq!(proxy.error_count(), 1);

        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_retry_recovers_after_connection_drops() {
        // two dropped connections, then the script is exhausted -> Normal
        let upstream =
            spawn_upstream(vec![Reply::CloseConnection, Reply::CloseConnection]).await;
        let proxy = ProxyInstance::new(test_config(upstream.addr, 0), None);
        proxy.start().await.unwrap();

        let mut client = TcpStream::connect(proxy.local_addr().unwrap()).await.unwrap();
        let request = frame::build_read_request(5, 1, frame::ReadFunction::HoldingRegisters, 0, 2);
        let started = Instant::now();
        let response = exchange(&mut client, &request).await;

        assert_eq!(frame::transaction_id(&response), 5);
        assert_eq!(response[8], 4);
        assert_eq!(upstream.requests().len(), 3);
        // backoffs of 100ms and 200ms must have elapsed
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(proxy.request_count(), 1);
        assert_eq!(proxy.error_count(), 0);

        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_exhausted_retries_drop_client() {
        let upstream = spawn_upstream(vec![
            Reply::CloseConnection,
            Reply::CloseConnection,
            Reply::CloseConnection,
        ])
        .await;
        let mut cfg = test_config(upstream.addr, 0);
        cfg.max_retries = 2;
        let proxy = ProxyInstance::new(cfg, None);
        proxy.start().await.unwrap();

        let mut client = TcpStream::connect(proxy.local_addr().unwrap()).await.unwrap();
        let request = frame::build_read_request(5, 1, frame::ReadFunction::HoldingRegisters, 0, 2);
        client.write_all(&request).await.unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert_eq!(proxy.request_count(), 0);
        assert_eq!(proxy.error_count(), 1);

        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_stop_disconnects_clients_and_refuses_new() {
        let upstream = spawn_upstream(vec![]).await;
        let proxy = ProxyInstance::new(test_config(upstream.addr, 0), None);
        proxy.start().await.unwrap();
        let addr = proxy.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        // prove the session is live
        let request = frame::build_read_request(1, 1, frame::ReadFunction::HoldingRegisters, 0, 1);
        exchange(&mut client, &request).await;

        proxy.stop().await;

        // the connected client is gone
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        // and nothing accepts anymore
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_device_tracker_hook() {
        let upstream = spawn_upstream(vec![]).await;
        let tracker = Arc::new(DeviceTracker::new());
        let proxy = ProxyInstance::new(test_config(upstream.addr, 0), Some(tracker.clone()));
        proxy.start().await.unwrap();

        let mut client = TcpStream::connect(proxy.local_addr().unwrap()).await.unwrap();
        let request = frame::build_read_request(1, 1, frame::ReadFunction::HoldingRegisters, 0, 1);
        exchange(&mut client, &request).await;

        let devices = tracker.devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].proxy_id, "test");

        proxy.stop().await;
    }
}
