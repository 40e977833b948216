//! TLS termination and re-origination.
//!
//! By default the proxy splices raw bytes and never looks at TLS. When a
//! certificate is configured every proxy listener terminates client TLS and
//! opens a fresh TLS session to the selected backend, verified against a CA
//! bundle.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use thiserror::Error;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Failure to build TLS settings.
#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no certificates found in {path}")]
    NoCertificates { path: PathBuf },

    #[error("no private key found in {path}")]
    NoPrivateKey { path: PathBuf },

    #[error("no usable CA certificates in {path}")]
    NoRoots { path: PathBuf },

    #[error("tls configuration: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Acceptor for client sessions plus connector for backend sessions.
#[derive(Clone)]
pub struct TlsSettings {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
}

impl TlsSettings {
    /// Build settings from an in-memory certificate chain, key and backend roots.
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        backend_roots: RootCertStore,
    ) -> Result<Self, TlsConfigError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let server = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)?;

        let client = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_root_certificates(backend_roots)
            .with_no_client_auth();

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server)),
            connector: TlsConnector::from(Arc::new(client)),
        })
    }

    /// Build settings from PEM files.
    pub fn from_pem_files(cert: &Path, key: &Path, backend_ca: &Path) -> Result<Self, TlsConfigError> {
        let cert_chain = load_certs(cert)?;
        if cert_chain.is_empty() {
            return Err(TlsConfigError::NoCertificates {
                path: cert.to_path_buf(),
            });
        }

        let key = load_private_key(key)?;

        let mut roots = RootCertStore::empty();
        let (added, _ignored) = roots.add_parsable_certificates(load_certs(backend_ca)?);
        if added == 0 {
            return Err(TlsConfigError::NoRoots {
                path: backend_ca.to_path_buf(),
            });
        }

        Self::new(cert_chain, key, roots)
    }

    /// Acceptor for client connections.
    pub fn acceptor(&self) -> &TlsAcceptor {
        &self.acceptor
    }

    /// Connector for backend connections.
    pub fn connector(&self) -> &TlsConnector {
        &self.connector
    }
}

impl fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSettings").finish_non_exhaustive()
    }
}

fn open(path: &Path) -> Result<BufReader<File>, TlsConfigError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsConfigError::Read {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsConfigError> {
    let mut reader = open(path)?;
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsConfigError::Read {
            path: path.to_path_buf(),
            source,
        })
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsConfigError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsConfigError::NoPrivateKey {
            path: path.to_path_buf(),
        })
}
