//! Test harness for proxy integration tests.
//!
//! Provides helpers to spawn TCP/TLS echo backends and proxy listeners on
//! loopback, and to drive the routing state behind them.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::RootCertStore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use dynamic_proxy::proxy::DEFAULT_MAX_CONNECTIONS;
use dynamic_proxy::{Engine, Listener, ListenerConfig, ListenerStatsSnapshot, TlsSettings};

static INIT_CRYPTO: Once = Once::new();

pub fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

/// Echo every byte back until the peer closes.
async fn echo<S>(mut stream: S, bytes: Arc<AtomicU64>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 8192];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                bytes.fetch_add(n as u64, Ordering::Relaxed);
                if stream.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    let _ = stream.shutdown().await;
}

pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub bytes_received: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TcpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let bytes_received = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let bytes_clone = Arc::clone(&bytes_received);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                tokio::spawn(echo(stream, Arc::clone(&bytes_clone)));
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            bytes_received,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Address in the `host:port` form groups store.
    pub fn server(&self) -> String {
        self.addr.to_string()
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Self-signed certificate for `server_name`.
pub struct TestCert {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

impl TestCert {
    pub fn generate(server_name: &str) -> Self {
        let cert = rcgen::generate_simple_self_signed(vec![server_name.to_string()])
            .expect("generate certificate");
        Self {
            cert_der: cert.cert.der().to_vec(),
            key_der: cert.key_pair.serialize_der(),
        }
    }

    pub fn chain(&self) -> Vec<CertificateDer<'static>> {
        vec![CertificateDer::from(self.cert_der.clone())]
    }

    pub fn key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }

    pub fn roots(&self) -> RootCertStore {
        roots_of(&[self])
    }
}

/// Root store trusting every given certificate.
pub fn roots_of(certs: &[&TestCert]) -> RootCertStore {
    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(CertificateDer::from(cert.cert_der.clone()))
            .expect("add root");
    }
    roots
}

pub struct TlsEchoBackend {
    pub addr: SocketAddr,
    pub cert: TestCert,
    pub connections: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TlsEchoBackend {
    pub async fn spawn(server_name: &str) -> io::Result<Self> {
        Self::spawn_delayed(server_name, Duration::ZERO).await
    }

    /// Accept TCP at once but hold each TLS handshake for `delay`.
    pub async fn spawn_delayed(server_name: &str, delay: Duration) -> io::Result<Self> {
        init_crypto_provider();

        let cert = TestCert::generate(server_name);
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert.chain(), cert.key())
            .map_err(io::Error::other)?;

        let acceptor = TlsAcceptor::from(Arc::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let connections = Arc::new(AtomicU64::new(0));
        let conn_clone = Arc::clone(&connections);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let acceptor = acceptor.clone();
                                tokio::spawn(async move {
                                    tokio::time::sleep(delay).await;
                                    if let Ok(tls_stream) = acceptor.accept(stream).await {
                                        echo(tls_stream, Arc::new(AtomicU64::new(0))).await;
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            cert,
            connections,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for TlsEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Client TLS handshake limit of spawned proxies.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(500);

pub struct ProxyHandle {
    pub listen_addr: SocketAddr,
    pub port: u16,
    pub engine: Engine,
    listener: Arc<Listener>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ProxyHandle {
    pub async fn spawn() -> io::Result<Self> {
        Self::spawn_with(None).await
    }

    pub async fn spawn_with(tls: Option<TlsSettings>) -> io::Result<Self> {
        Self::spawn_limited(tls, DEFAULT_MAX_CONNECTIONS).await
    }

    pub async fn spawn_limited(
        tls: Option<TlsSettings>,
        max_connections: usize,
    ) -> io::Result<Self> {
        let engine = Engine::new(Vec::<u16>::new());

        let mut config = ListenerConfig::new("127.0.0.1:0".parse().unwrap());
        config.max_connections = max_connections;
        config.connect_timeout = Duration::from_secs(2);
        config.handshake_timeout = HANDSHAKE_TIMEOUT;
        config.tls = tls;

        let listener = Arc::new(Listener::bind(config, engine.clone()).await?);
        let listen_addr = listener.local_addr()?;
        let port = listener.port();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let running = Arc::clone(&listener);
        tokio::spawn(async move {
            let _ = running
                .run_until(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Ok(Self {
            listen_addr,
            port,
            engine,
            listener,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub async fn set_group(&self, name: &str, servers: &[String], weight: f64) {
        self.engine
            .registry()
            .set_group_servers(self.port, name, servers.to_vec(), weight)
            .await;
    }

    pub async fn activate(&self, names: &[&str], weights: &[f64]) -> u64 {
        let names: Vec<String> = names.iter().map(|name| name.to_string()).collect();
        self.engine.activate(self.port, &names, weights).await
    }

    pub fn stats(&self) -> ListenerStatsSnapshot {
        self.listener.stats().snapshot()
    }

    pub async fn connect(&self) -> io::Result<TcpStream> {
        TcpStream::connect(self.listen_addr).await
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Write `payload` and read the same number of bytes back.
pub async fn roundtrip<S>(stream: &mut S, payload: &[u8]) -> io::Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(payload).await?;
    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "echo timed out"))??;
    Ok(buf)
}

/// True if the peer closed the stream (EOF or reset) within `within`.
pub async fn closed_within<S>(stream: &mut S, within: Duration) -> bool
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 64];
    loop {
        match tokio::time::timeout(within, stream.read(&mut buf)).await {
            Err(_) => return false,
            Ok(Ok(0)) | Ok(Err(_)) => return true,
            Ok(Ok(_)) => continue,
        }
    }
}

/// Poll `check` until it holds or `within` passes.
pub async fn eventually<F>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub async fn tls_client_connect(
    addr: SocketAddr,
    server_name: &str,
    cert_der: &[u8],
) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let stream = TcpStream::connect(addr).await?;
    tls_client_handshake(stream, server_name, cert_der).await
}

/// Run a client TLS handshake over an already connected stream.
pub async fn tls_client_handshake(
    stream: TcpStream,
    server_name: &str,
    cert_der: &[u8],
) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    init_crypto_provider();

    let mut root_store = RootCertStore::empty();
    root_store
        .add(CertificateDer::from(cert_der.to_vec()))
        .map_err(io::Error::other)?;

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(server_name.to_string()).map_err(io::Error::other)?;
    connector.connect(server_name, stream).await
}
