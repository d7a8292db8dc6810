//! Dynamic per-host TLS server
//!
//! The loopback-only TLS endpoint that impersonates remote origins.
//! Certificates are selected per SNI host from a context map that starts
//! empty and grows as `CONNECT` handling prepares hosts; terminated
//! requests are rewritten to absolute form and fed back into the request
//! engine.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::{self, ServerConfig};
use tokio_rustls::TlsAcceptor;

use crate::ca::CertificateManager;
use crate::engine;
use crate::error::{Error, Result};
use crate::http1;
use crate::proxy::Shared;

type HostContext = Arc<RwLock<HashMap<String, Arc<CertifiedKey>>>>;

/// TLS endpoint with per-host certificate contexts.
pub struct DynamicTlsServer {
  hosts: HostContext,
  certs: Arc<CertificateManager>,
  acceptor: TlsAcceptor,
  port: u16,
}

impl DynamicTlsServer {
  /// Wire the server around an already-bound listener port.
  pub(crate) fn new(certs: Arc<CertificateManager>, port: u16) -> Result<Self> {
    let hosts: HostContext = Arc::new(RwLock::new(HashMap::new()));
    let resolver = HostCertResolver {
      hosts: hosts.clone(),
    };
    let config = ServerConfig::builder_with_provider(
      rustls::crypto::ring::default_provider().into(),
    )
    .with_protocol_versions(rustls::ALL_VERSIONS)
    .map_err(|e| Error::tls(format!("invalid TLS versions: {}", e)))?
    .with_no_client_auth()
    .with_cert_resolver(Arc::new(resolver));

    Ok(Self {
      hosts,
      certs,
      acceptor: TlsAcceptor::from(Arc::new(config)),
      port,
    })
  }

  /// Port the dynamic listener is bound to.
  pub fn port(&self) -> u16 {
    self.port
  }

  /// Install a certificate context for `host` before its handshake.
  ///
  /// Idempotent: a host already in the context map returns immediately, and
  /// concurrent first calls for one host coalesce on the certificate cache
  /// so the host is signed once. Contexts are never evicted.
  pub async fn prepare(&self, host: &str) -> Result<()> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if self.contains(host) {
      return Ok(());
    }
    let key = self.certs.certified_key(host).await?;
    self
      .hosts
      .write()
      .expect("host context poisoned")
      .entry(host.to_string())
      .or_insert(key);
    Ok(())
  }

  /// Whether a certificate context is installed for `host`.
  pub fn contains(&self, host: &str) -> bool {
    self
      .hosts
      .read()
      .expect("host context poisoned")
      .contains_key(host)
  }

  /// Number of installed host contexts.
  pub fn context_len(&self) -> usize {
    self.hosts.read().expect("host context poisoned").len()
  }
}

/// SNI lookup into the host context map.
struct HostCertResolver {
  hosts: HostContext,
}

impl std::fmt::Debug for HostCertResolver {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("HostCertResolver").finish()
  }
}

impl ResolvesServerCert for HostCertResolver {
  fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
    let name = client_hello.server_name()?;
    self.hosts.read().ok()?.get(name).cloned()
  }
}

/// Accept loop for the dynamic listener.
///
/// Handshake failures end one connection; listener failures propagate and
/// are fatal.
pub(crate) async fn run(listener: TcpListener, shared: Arc<Shared>) -> Result<()> {
  loop {
    let (stream, _) = listener
      .accept()
      .await
      .map_err(|e| Error::proxy(format!("dynamic TLS listener failed: {}", e)))?;
    let shared = shared.clone();
    tokio::spawn(async move {
      match shared.dyn_tls.acceptor.accept(stream).await {
        Ok(tls_stream) => serve_terminated(tls_stream, &shared).await,
        Err(e) => tracing::warn!("dynamic TLS handshake failed: {}", e),
      }
    });
  }
}

/// Serve one terminated HTTPS connection back through the request engine.
async fn serve_terminated<S>(stream: S, shared: &Shared)
where
  S: AsyncRead + AsyncWrite + Unpin + Send,
{
  let mut reader = BufReader::new(stream);
  let mut head = match http1::read_request_head(&mut reader).await {
    Ok(head) => head,
    Err(e) => {
      tracing::warn!("failed to read terminated request: {}", e);
      return;
    }
  };

  if head.headers.contains_key(http::header::UPGRADE) {
    // WebSocket upgrades are not passed through; placeholder behavior.
    tracing::warn!("dropping websocket upgrade on dynamic TLS port");
    return;
  }

  // The path-only target becomes absolute using the Host header.
  if !head.target.starts_with("http://") && !head.target.starts_with("https://") {
    let host = match head
      .headers
      .get(http::header::HOST)
      .and_then(|v| v.to_str().ok())
    {
      Some(host) => host,
      None => {
        tracing::warn!("terminated request without Host header");
        return;
      }
    };
    head.target = format!("https://{}{}", host, head.target);
  }

  engine::handle(reader, head, shared).await;
}
