//! Transport factories for cluster links: plain TCP or TLS over TCP.
//!
//! Binding and raw `accept()` are shared; the factory only upgrades an
//! accepted or connected socket, so a failed TLS handshake never disturbs
//! the accept loop.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{info, warn};

use super::types::BrokerAddress;
use crate::config::{ClusterConfig, TlsConfig, TransportKind};

/// Byte stream of one cluster link.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type ClusterStream = Box<dyn AsyncStream>;

/// Creates listening sockets and upgrades raw sockets into link streams.
///
/// Used as `Arc<dyn TransportFactory>`.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn bind(&self, host: &str, port: u16) -> io::Result<TcpListener> {
        TcpListener::bind((host, port)).await
    }

    /// Completes the server side of an accepted socket.
    async fn accept(&self, stream: TcpStream) -> io::Result<ClusterStream>;

    /// Opens a link to `peer`'s cluster service.
    async fn connect(&self, peer: &BrokerAddress) -> io::Result<ClusterStream>;
}

/// Plain TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTransport;

#[async_trait]
impl TransportFactory for PlainTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    async fn accept(&self, stream: TcpStream) -> io::Result<ClusterStream> {
        Ok(Box::new(stream))
    }

    async fn connect(&self, peer: &BrokerAddress) -> io::Result<ClusterStream> {
        let stream = TcpStream::connect(peer.host_port()).await?;
        set_nodelay(&stream);
        Ok(Box::new(stream))
    }
}

// ---------------------------------------------------------------------------
// TLS
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("failed to read certificate or key file: {0}")]
    Read(#[from] io::Error),

    #[error("failed to parse {what}: {detail}")]
    Parse { what: &'static str, detail: String },

    #[error("TLS configuration error: {0}")]
    Config(#[from] rustls::Error),

    #[error("no certificates found in {0}")]
    NoCertificates(String),

    #[error("no private keys found in {0}")]
    NoPrivateKeys(String),
}

/// TLS over TCP. Peers trust the configured certificate chain, which the
/// whole cluster shares.
pub struct TlsTransport {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
}

impl TlsTransport {
    /// # Errors
    ///
    /// Returns [`TlsError`] if the PEM files can not be read or parsed.
    pub fn new(config: &TlsConfig) -> Result<Self, TlsError> {
        info!(
            "Initializing cluster TLS with cert: {}, key: {}",
            config.cert_path.display(),
            config.key_path.display()
        );
        let chain = load_certs(&config.cert_path)?;
        let mut keys = load_private_keys(&config.key_path)?;
        if keys.is_empty() {
            return Err(TlsError::NoPrivateKeys(config.key_path.display().to_string()));
        }

        let mut roots = RootCertStore::empty();
        for cert in &chain {
            roots.add(cert.clone())?;
        }
        let client = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let server = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, keys.remove(0))?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server)),
            connector: TlsConnector::from(Arc::new(client)),
        })
    }
}

#[async_trait]
impl TransportFactory for TlsTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tls
    }

    async fn accept(&self, stream: TcpStream) -> io::Result<ClusterStream> {
        let tls = self.acceptor.accept(stream).await?;
        Ok(Box::new(tls))
    }

    async fn connect(&self, peer: &BrokerAddress) -> io::Result<ClusterStream> {
        let name = ServerName::try_from(peer.host())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?
            .to_owned();
        let stream = TcpStream::connect(peer.host_port()).await?;
        set_nodelay(&stream);
        let tls = self.connector.connect(name, stream).await?;
        Ok(Box::new(tls))
    }
}

/// Builds the transport named by `config.transport`.
///
/// # Errors
///
/// Fails if TLS is selected and its certificate setup is missing or invalid.
pub fn build_transport(config: &ClusterConfig) -> anyhow::Result<Arc<dyn TransportFactory>> {
    match config.transport {
        TransportKind::Tcp => Ok(Arc::new(PlainTransport)),
        TransportKind::Tls => {
            let tls = config
                .tls
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("transport tls requires a tls section"))?;
            Ok(Arc::new(TlsTransport::new(tls)?))
        }
    }
}

/// Best-effort no-delay; failure is logged and ignored.
pub(crate) fn set_nodelay(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("failed to set TCP_NODELAY on cluster link: {e}");
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = BufReader::new(File::open(path)?);
    let chain: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Parse {
            what: "certificate",
            detail: e.to_string(),
        })?;
    if chain.is_empty() {
        return Err(TlsError::NoCertificates(path.display().to_string()));
    }
    Ok(chain)
}

/// PKCS#8 keys first, then RSA keys.
fn load_private_keys(path: &Path) -> Result<Vec<PrivateKeyDer<'static>>, TlsError> {
    let parse_err = |e: io::Error| TlsError::Parse {
        what: "private key",
        detail: e.to_string(),
    };
    let mut reader = BufReader::new(File::open(path)?);
    let keys: Vec<PrivateKeyDer<'static>> = pkcs8_private_keys(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(parse_err)?
        .into_iter()
        .map(Into::into)
        .collect();
    if !keys.is_empty() {
        return Ok(keys);
    }

    let mut reader = BufReader::new(File::open(path)?);
    Ok(rustls_pemfile::rsa_private_keys(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(parse_err)?
        .into_iter()
        .map(Into::into)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqcluster_core::BrokerSessionUid;
    use std::io::Write;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn plain_transport_connects_to_its_own_listener() {
        let transport = PlainTransport;
        let listener = transport.bind("127.0.0.1", 0).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut stream = PlainTransport.accept(socket).await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let peer = BrokerAddress::new("b2", "127.0.0.1", port, BrokerSessionUid(1));
        let mut client = transport.connect(&peer).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        assert_eq!(&server.await.unwrap(), b"ping");
    }

    #[test]
    fn tls_setup_reports_missing_and_empty_files() {
        let missing = TlsConfig {
            cert_path: "/nonexistent/cert.pem".into(),
            key_path: "/nonexistent/key.pem".into(),
        };
        assert!(matches!(TlsTransport::new(&missing), Err(TlsError::Read(_))));

        let mut empty = tempfile::NamedTempFile::new().unwrap();
        writeln!(empty, "not a pem file").unwrap();
        let config = TlsConfig {
            cert_path: empty.path().to_path_buf(),
            key_path: empty.path().to_path_buf(),
        };
        assert!(matches!(
            TlsTransport::new(&config),
            Err(TlsError::NoCertificates(_))
        ));
    }

    #[test]
    fn build_transport_follows_config() {
        let config = ClusterConfig::default();
        assert_eq!(build_transport(&config).unwrap().kind(), TransportKind::Tcp);

        let config = ClusterConfig {
            transport: TransportKind::Tls,
            ..ClusterConfig::default()
        };
        assert!(build_transport(&config).is_err());
    }
}
