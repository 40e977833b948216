//! Process configuration.
//!
//! Read once at startup from flags, falling back to `DP_*` environment
//! variables. Listening ports cannot change while the process runs.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};

use crate::proxy::{TlsSettings, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_CONNECTIONS};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human readable lines.
    Pretty,
    /// One JSON object per line.
    Json,
}

/// dp - runtime-reconfigurable TCP proxy.
#[derive(Debug, Clone, Parser)]
#[command(name = "dp")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Port to proxy (repeatable).
    #[arg(
        long = "port",
        env = "DP_PORTS",
        value_delimiter = ',',
        default_value = "26257"
    )]
    pub ports: Vec<u16>,

    /// Port of the HTTP control plane.
    #[arg(long, env = "DP_CTL_PORT", default_value_t = 3000)]
    pub ctl_port: u16,

    /// Host the proxy listeners bind to.
    #[arg(long, env = "DP_BIND_HOST", default_value = "localhost")]
    pub bind_host: String,

    /// Host the control plane binds to.
    #[arg(long, env = "DP_CTL_BIND_HOST", default_value = "0.0.0.0")]
    pub ctl_bind_host: String,

    /// Backend connect timeout in milliseconds.
    #[arg(long, env = "DP_CONNECT_TIMEOUT_MS", default_value_t = 5000)]
    pub connect_timeout_ms: u64,

    /// Client TLS handshake timeout in milliseconds.
    #[arg(long, env = "DP_TLS_HANDSHAKE_TIMEOUT_MS", default_value_t = 10000)]
    pub tls_handshake_timeout_ms: u64,

    /// Maximum concurrent connections per listener.
    #[arg(long, env = "DP_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: usize,

    /// PEM certificate chain; enables TLS termination on proxy listeners.
    #[arg(long, env = "DP_TLS_CERT", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key for --tls-cert.
    #[arg(long, env = "DP_TLS_KEY", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// PEM CA bundle used to verify backends when TLS is enabled.
    #[arg(
        long,
        env = "DP_BACKEND_CA",
        default_value = "/etc/ssl/certs/ca-certificates.crt"
    )]
    pub backend_ca: PathBuf,

    /// Enable debug logging.
    #[arg(long, env = "DP_VERBOSE")]
    pub verbose: bool,

    /// Log output format.
    #[arg(long, env = "DP_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

impl Config {
    /// Check constraints clap cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.ports.is_empty() {
            bail!("At least one --port is required.");
        }

        let mut seen = HashSet::new();
        for port in &self.ports {
            if *port == 0 {
                bail!("Proxy port 0 is not allowed.");
            }
            if !seen.insert(*port) {
                bail!("Proxy port {port} is listed more than once.");
            }
        }

        if seen.contains(&self.ctl_port) {
            bail!(
                "Control plane port {} is also a proxy port.",
                self.ctl_port
            );
        }

        if self.tls_cert.is_some() != self.tls_key.is_some() {
            bail!("--tls-cert and --tls-key must be given together.");
        }

        Ok(())
    }

    /// Default log filter when RUST_LOG is unset.
    pub fn log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else {
            "info"
        }
    }

    /// Backend connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Client TLS handshake timeout.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.tls_handshake_timeout_ms)
    }

    /// TLS settings, if termination is enabled.
    pub fn tls_settings(&self) -> Result<Option<TlsSettings>> {
        let (Some(cert), Some(key)) = (&self.tls_cert, &self.tls_key) else {
            return Ok(None);
        };

        let settings = TlsSettings::from_pem_files(cert, key, &self.backend_ca)
            .context("Failed to load TLS settings")?;
        Ok(Some(settings))
    }

    /// Resolve the bind address of a proxy port.
    pub async fn proxy_addr(&self, port: u16) -> Result<SocketAddr> {
        resolve(&self.bind_host, port).await
    }

    /// Resolve the bind address of the control plane.
    pub async fn ctl_addr(&self) -> Result<SocketAddr> {
        resolve(&self.ctl_bind_host, self.ctl_port).await
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("Failed to resolve {host}:{port}"))?
        .next()
        .with_context(|| format!("No address for {host}:{port}"))
}
