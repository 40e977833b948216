//! TCP listener and connection handling.
//!
//! One listener runs per proxy port. For each client it:
//! - finishes the client TLS handshake first when TLS is configured, within
//!   a bounded time
//! - asks the engine for a backend of the port (closing the client if none)
//! - dials the backend, re-originating TLS when configured
//! - captures the port's generation right after the dial succeeds
//! - splices bytes in both directions until the generation is advanced or
//!   both directions finish

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};

use super::backend::{BackendDialer, ConnectError, DEFAULT_CONNECT_TIMEOUT};
use super::tls::TlsSettings;
use crate::engine::Engine;

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default limit on the client TLS handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Copy buffer size per direction.
const COPY_BUFFER_SIZE: usize = 8192;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Timeout for dialing a backend.
    pub connect_timeout: Duration,
    /// Timeout for the client TLS handshake.
    pub handshake_timeout: Duration,
    /// Terminate client TLS and re-originate TLS to backends.
    pub tls: Option<TlsSettings>,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            tls: None,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently splicing.
    pub connections_active: AtomicU64,
    /// Total connections closed after splicing.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Connections closed because no group was active.
    pub connections_no_route: AtomicU64,
    /// Connections force-closed by a generation advance.
    pub connections_drained: AtomicU64,
    /// Backend connection successes.
    pub backend_connected: AtomicU64,
    /// Backend connection failures.
    pub backend_failed: AtomicU64,
    /// Client TLS handshake failures and timeouts.
    pub tls_failed: AtomicU64,
    /// Bytes proxied to backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backend.
    pub bytes_from_backend: AtomicU64,
}

/// Point-in-time copy of [`ListenerStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ListenerStatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_closed: u64,
    pub connections_rejected: u64,
    pub connections_no_route: u64,
    pub connections_drained: u64,
    pub backend_connected: u64,
    pub backend_failed: u64,
    pub tls_failed: u64,
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
}

impl ListenerStats {
    /// Read every counter.
    pub fn snapshot(&self) -> ListenerStatsSnapshot {
        ListenerStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            connections_no_route: self.connections_no_route.load(Ordering::Relaxed),
            connections_drained: self.connections_drained.load(Ordering::Relaxed),
            backend_connected: self.backend_connected.load(Ordering::Relaxed),
            backend_failed: self.backend_failed.load(Ordering::Relaxed),
            tls_failed: self.tls_failed.load(Ordering::Relaxed),
            bytes_to_backend: self.bytes_to_backend.load(Ordering::Relaxed),
            bytes_from_backend: self.bytes_from_backend.load(Ordering::Relaxed),
        }
    }
}

/// Direction of a copy task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ToBackend,
    ToClient,
}

impl Direction {
    fn counter(self, stats: &ListenerStats) -> &AtomicU64 {
        match self {
            Direction::ToBackend => &stats.bytes_to_backend,
            Direction::ToClient => &stats.bytes_from_backend,
        }
    }
}

/// How a spliced connection ended.
#[derive(Debug)]
enum SpliceEnd {
    /// The captured generation was advanced.
    Drained,
    /// Both directions reached end of stream.
    Finished,
    /// A direction failed.
    Failed(io::Error),
}

/// A TCP listener for one proxy port.
pub struct Listener {
    /// Listener configuration.
    config: ListenerConfig,
    /// The TCP listener.
    listener: TcpListener,
    /// Port whose groups route this listener's traffic.
    port: u16,
    /// Routing state shared with the control plane.
    engine: Engine,
    /// Backend dialer.
    dialer: BackendDialer,
    /// Connection semaphore for limiting concurrent connections.
    conn_semaphore: Arc<Semaphore>,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind a listener and register its port with the engine.
    ///
    /// The routing port is the locally bound port, so binding port 0 routes by
    /// whatever port the OS picked.
    pub async fn bind(config: ListenerConfig, engine: Engine) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let port = local_addr.port();
        let stats = engine.register(port).await;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            tls = config.tls.is_some(),
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            dialer: BackendDialer::with_timeout(config.connect_timeout),
            listener,
            port,
            engine,
            config,
            stats,
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The routing port of this listener.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Run the listener forever.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run the listener until `shutdown` completes.
    ///
    /// Connections already being spliced are not touched by shutdown.
    pub async fn run_until(self: Arc<Self>, shutdown: impl Future<Output = ()>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, port = self.port, "Listener started");

        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                _ = &mut shutdown => {
                    debug!(port = self.port, "Listener closed");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    // Try to acquire a permit
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);

                    tokio::spawn(
                        async move {
                            listener.handle_connection(stream).await;
                            drop(permit);
                        }
                        .instrument(tracing::info_span!(
                            "connection",
                            port = self.port,
                            peer = %peer_addr
                        )),
                    );
                }
                Err(e) => {
                    error!(port = self.port, error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    /// Handle a single client from selection to teardown.
    ///
    /// Selection happens only once the client is ready to splice, so the
    /// window between picking a backend and capturing the generation is
    /// bounded by the backend dial.
    async fn handle_connection(&self, client: TcpStream) {
        match &self.config.tls {
            None => {
                let Some(backend_addr) = self.select().await else {
                    return;
                };
                let backend = match self.dialer.connect(&backend_addr).await {
                    Ok(stream) => stream,
                    Err(e) => return self.backend_failed(&e),
                };
                self.splice(client, backend, &backend_addr).await;
            }
            Some(tls) => {
                let accept = tls.acceptor().accept(client);
                let client = match timeout(self.config.handshake_timeout, accept).await {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        self.stats.tls_failed.fetch_add(1, Ordering::Relaxed);
                        debug!(error = %e, "Client TLS handshake failed");
                        return;
                    }
                    Err(_) => {
                        self.stats.tls_failed.fetch_add(1, Ordering::Relaxed);
                        warn!("Client TLS handshake timeout");
                        return;
                    }
                };
                let Some(backend_addr) = self.select().await else {
                    return;
                };
                let backend = match self.dialer.connect_tls(&backend_addr, tls.connector()).await {
                    Ok(stream) => stream,
                    Err(e) => return self.backend_failed(&e),
                };
                self.splice(client, backend, &backend_addr).await;
            }
        }
    }

    /// Pick a backend, counting the client as unrouted if there is none.
    async fn select(&self) -> Option<String> {
        let backend_addr = self.engine.select(self.port).await;
        if backend_addr.is_none() {
            self.stats
                .connections_no_route
                .fetch_add(1, Ordering::Relaxed);
            debug!("No active route, closing client");
        }
        backend_addr
    }

    fn backend_failed(&self, e: &ConnectError) {
        self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
        // Visible to the client as a dropped connection.
        debug!(error = %e, "Backend connection failed");
    }

    /// Splice a connected client/backend pair until drained or finished.
    async fn splice<C, B>(&self, client: C, backend: B, backend_addr: &str)
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
        B: AsyncRead + AsyncWrite + Send + 'static,
    {
        // The connection belongs to the generation live right now.
        let mut generation = self.engine.drains().current_token(self.port).await;
        self.stats.backend_connected.fetch_add(1, Ordering::Relaxed);

        debug!(
            backend = %backend_addr,
            generation = generation.id(),
            "Connected to backend"
        );

        let (client_read, client_write) = tokio::io::split(client);
        let (backend_read, backend_write) = tokio::io::split(backend);

        let mut to_backend = tokio::spawn(copy_half(
            client_read,
            backend_write,
            Arc::clone(&self.stats),
            Direction::ToBackend,
        ));
        let mut to_client = tokio::spawn(copy_half(
            backend_read,
            client_write,
            Arc::clone(&self.stats),
            Direction::ToClient,
        ));

        self.stats
            .connections_active
            .fetch_add(1, Ordering::Relaxed);

        let end = tokio::select! {
            _ = generation.closed() => SpliceEnd::Drained,
            result = async { tokio::try_join!(joined(&mut to_backend), joined(&mut to_client)) } => {
                match result {
                    Ok(_) => SpliceEnd::Finished,
                    Err(e) => SpliceEnd::Failed(e),
                }
            }
        };

        // Aborted tasks drop their halves, which closes both sockets.
        to_backend.abort();
        to_client.abort();

        self.stats
            .connections_active
            .fetch_sub(1, Ordering::Relaxed);
        self.stats
            .connections_closed
            .fetch_add(1, Ordering::Relaxed);

        match end {
            SpliceEnd::Drained => {
                self.stats
                    .connections_drained
                    .fetch_add(1, Ordering::Relaxed);
                debug!(generation = generation.id(), "Connection drained");
            }
            SpliceEnd::Finished => debug!("Connection closed"),
            SpliceEnd::Failed(e) => debug!(error = %e, "Connection closed with error"),
        }
    }
}

/// Await a copy task, folding a task failure into an IO error.
async fn joined(handle: &mut JoinHandle<io::Result<u64>>) -> io::Result<u64> {
    match handle.await {
        Ok(result) => result,
        Err(e) => Err(io::Error::other(e)),
    }
}

/// Copy one direction until end of stream, then half-close the writer.
async fn copy_half<R, W>(
    mut reader: R,
    mut writer: W,
    stats: Arc<ListenerStats>,
    direction: Direction,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
        direction
            .counter(&stats)
            .fetch_add(n as u64, Ordering::Relaxed);
    }
    writer.shutdown().await?;
    Ok(total)
}
