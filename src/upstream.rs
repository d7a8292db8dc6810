//! Upstream connection agent
//!
//! Dials origins over TCP or TLS with the configured deadlines. This is the
//! engine's connection-selection collaborator: the transport is keyed on the
//! target scheme, host and port of each transaction.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket as RawSocket, Type};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{self, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

use crate::error::{Error, Result};

/// Plain or TLS upstream stream.
pub(crate) enum MaybeTlsStream {
  /// TCP
  Tcp(TcpStream),
  /// TLS with rustls
  Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
      MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for MaybeTlsStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
      MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(s) => Pin::new(s).poll_flush(cx),
      MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
      MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
    }
  }
}

/// Dials origins with configured timeouts and TLS policy.
pub(crate) struct Connector {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  tls: TlsConnector,
}

impl Connector {
  /// Build a connector.
  ///
  /// `verify_upstream = false` installs a verifier that accepts any origin
  /// certificate; the default trusts the webpki root set.
  pub fn new(connect_timeout: Option<Duration>, verify_upstream: bool) -> Result<Self> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
      .with_protocol_versions(rustls::ALL_VERSIONS)
      .map_err(|e| Error::tls(format!("invalid TLS versions: {}", e)))?;

    let config = if verify_upstream {
      let mut roots = RootCertStore::empty();
      roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
      builder.with_root_certificates(roots).with_no_client_auth()
    } else {
      builder
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier::new(provider)))
        .with_no_client_auth()
    };

    Ok(Self {
      connect_timeout,
      nodelay: true,
      tls: TlsConnector::from(Arc::new(config)),
    })
  }

  /// Open a TCP connection to `host:port`.
  ///
  /// `host` may be a name, an IP literal, or a bracketed IPv6 literal.
  pub async fn dial(&self, host: &str, port: u16) -> Result<TcpStream> {
    let target = if host.contains(':') && !host.starts_with('[') {
      format!("[{}]:{}", host, port)
    } else {
      format!("{}:{}", host, port)
    };
    let addr = tokio::net::lookup_host(&target)
      .await
      .map_err(|e| Error::upstream(format!("failed to resolve {}: {}", target, e)))?
      .next()
      .ok_or_else(|| Error::upstream(format!("no address for {}", target)))?;

    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(true)?;
    }

    let stream = match self.connect_timeout {
      None => socket.connect(addr).await,
      Some(timeout) => tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|_| Error::upstream(format!("connect to {} timed out", target)))?,
    }
    .map_err(|e| Error::upstream(format!("connect to {} failed: {}", target, e)))?;
    Ok(stream)
  }

  /// Open a connection to `host:port`, upgrading to TLS when `secure`.
  pub async fn connect(&self, secure: bool, host: &str, port: u16) -> Result<MaybeTlsStream> {
    let stream = self.dial(host, port).await?;
    if !secure {
      return Ok(MaybeTlsStream::Tcp(stream));
    }
    let sni = host.trim_start_matches('[').trim_end_matches(']');
    let server_name = ServerName::try_from(sni.to_string())
      .map_err(|e| Error::tls(format!("invalid server name {}: {}", sni, e)))?;
    let tls = self
      .tls
      .connect(server_name, stream)
      .await
      .map_err(|e| Error::upstream(format!("TLS handshake with {} failed: {}", host, e)))?;
    Ok(MaybeTlsStream::Tls(Box::new(tls)))
  }
}

/// Verifier that accepts any upstream certificate.
#[derive(Debug)]
struct NoVerifier {
  provider: Arc<CryptoProvider>,
}

impl NoVerifier {
  fn new(provider: Arc<CryptoProvider>) -> Self {
    Self { provider }
  }
}

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer,
    dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    verify_tls12_signature(
      message,
      cert,
      dss,
      &self.provider.signature_verification_algorithms,
    )
  }

  fn verify_tls13_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer,
    dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    verify_tls13_signature(
      message,
      cert,
      dss,
      &self.provider.signature_verification_algorithms,
    )
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    self
      .provider
      .signature_verification_algorithms
      .supported_schemes()
  }
}
