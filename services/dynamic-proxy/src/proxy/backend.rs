//! Backend dialing.
//!
//! Backends are plain `host:port` strings supplied by the operator. They are
//! resolved and connected on every new client; failures are not retried.

use std::io;
use std::time::Duration;

use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Floor for configured connect timeouts.
pub const MIN_CONNECT_TIMEOUT: Duration = Duration::from_millis(50);

/// Failure to reach a backend.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connect to {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("connect to {addr} timed out after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },

    #[error("no valid TLS server name in {addr}")]
    InvalidServerName { addr: String },

    #[error("TLS handshake with {addr}: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// Dials backend addresses.
#[derive(Debug, Clone)]
pub struct BackendDialer {
    connect_timeout: Duration,
}

impl BackendDialer {
    /// Create a dialer with the default connect timeout.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_CONNECT_TIMEOUT)
    }

    /// Create a dialer with a custom connect timeout.
    pub fn with_timeout(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout: connect_timeout.max(MIN_CONNECT_TIMEOUT),
        }
    }

    /// The effective connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Open a plain TCP connection.
    pub async fn connect(&self, addr: &str) -> Result<TcpStream, ConnectError> {
        match timeout(self.connect_timeout, self.dial(addr)).await {
            Ok(result) => result,
            Err(_) => Err(self.timed_out(addr)),
        }
    }

    /// Open a TCP connection and run a TLS client handshake over it.
    ///
    /// The server name presented and verified is the host part of `addr`.
    /// The connect timeout covers the TCP connect and the handshake together.
    pub async fn connect_tls(
        &self,
        addr: &str,
        connector: &TlsConnector,
    ) -> Result<TlsStream<TcpStream>, ConnectError> {
        let server_name = server_name(addr).ok_or_else(|| ConnectError::InvalidServerName {
            addr: addr.to_string(),
        })?;

        let handshake = async {
            let stream = self.dial(addr).await?;
            connector
                .connect(server_name, stream)
                .await
                .map_err(|source| ConnectError::Handshake {
                    addr: addr.to_string(),
                    source,
                })
        };

        match timeout(self.connect_timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(self.timed_out(addr)),
        }
    }

    async fn dial(&self, addr: &str) -> Result<TcpStream, ConnectError> {
        debug!(backend = %addr, "Connecting to backend");

        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ConnectError::Io {
                addr: addr.to_string(),
                source,
            })?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    fn timed_out(&self, addr: &str) -> ConnectError {
        ConnectError::Timeout {
            addr: addr.to_string(),
            timeout: self.connect_timeout,
        }
    }
}

impl Default for BackendDialer {
    fn default() -> Self {
        Self::new()
    }
}

/// Split the host out of `host:port`, `[v6]:port` or a bare host.
pub fn host_of(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split_once(']').map_or(rest, |(host, _)| host);
    }

    match addr.rsplit_once(':') {
        // A second colon means an unbracketed IPv6 literal without a port.
        Some((host, _)) if !host.contains(':') => host,
        _ => addr,
    }
}

/// TLS server name for a backend address.
pub fn server_name(addr: &str) -> Option<ServerName<'static>> {
    ServerName::try_from(host_of(addr).to_string()).ok()
}
