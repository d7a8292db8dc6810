//! Proxy configuration and entrypoint
//!
//! Owns the lifecycle: certificate authority first, then the dynamic TLS
//! listener, then the main listener, with request, CONNECT and upgrade
//! handling wired to the engines.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use http::Method;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_rustls::rustls::{self, ServerConfig};
use tokio_rustls::TlsAcceptor;

use crate::ca::CertificateManager;
use crate::connect;
use crate::dynamic_tls::{self, DynamicTlsServer};
use crate::engine;
use crate::error::{Error, Result};
use crate::http1;
use crate::patcher::Patcher;
use crate::upstream::Connector;
use crate::{DEFAULT_DYNAMIC_PORT, DEFAULT_MAIN_PORT};

/// Proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
  /// Address the main listener binds to; may be public.
  pub bind_addr: IpAddr,
  /// Main proxy port.
  pub main_port: u16,
  /// Dynamic TLS port; always bound to loopback.
  pub dynamic_port: u16,
  /// Serve the main listener over TLS with a root-signed local cert.
  pub use_tls: bool,
  /// Where the root CA key material lives.
  pub ca_storage_path: PathBuf,
  /// Deadline for upstream dials.
  pub connect_timeout: Option<Duration>,
  /// Deadline for reading a full upstream response.
  pub read_timeout: Option<Duration>,
  /// Deadline for writing the reply to the client.
  pub write_timeout: Option<Duration>,
  /// Cap on fully buffered request and response bodies.
  pub max_body_size: usize,
  /// Verify origin certificates against the webpki root set.
  pub verify_upstream: bool,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
      main_port: DEFAULT_MAIN_PORT,
      dynamic_port: DEFAULT_DYNAMIC_PORT,
      use_tls: false,
      ca_storage_path: PathBuf::from(".recast"),
      connect_timeout: Some(Duration::from_secs(10)),
      read_timeout: Some(Duration::from_secs(30)),
      write_timeout: Some(Duration::from_secs(30)),
      max_body_size: 16 * 1024 * 1024,
      verify_upstream: true,
    }
  }
}

impl ProxyConfig {
  /// Sets the main listener port.
  pub fn with_main_port(mut self, port: u16) -> Self {
    self.main_port = port;
    self
  }

  /// Sets the dynamic TLS port.
  pub fn with_dynamic_port(mut self, port: u16) -> Self {
    self.dynamic_port = port;
    self
  }

  /// Sets the main listener bind address.
  pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
    self.bind_addr = addr;
    self
  }

  /// Serves the main listener over TLS.
  pub fn with_tls(mut self, use_tls: bool) -> Self {
    self.use_tls = use_tls;
    self
  }

  /// Sets the CA storage directory.
  pub fn with_ca_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
    self.ca_storage_path = path.into();
    self
  }

  /// Sets the buffered body cap.
  pub fn with_max_body_size(mut self, size: usize) -> Self {
    self.max_body_size = size;
    self
  }

  /// Controls origin certificate verification.
  pub fn with_verify_upstream(mut self, verify: bool) -> Self {
    self.verify_upstream = verify;
    self
  }
}

/// State shared by every connection task.
pub(crate) struct Shared {
  pub(crate) config: ProxyConfig,
  pub(crate) patcher: Arc<dyn Patcher>,
  pub(crate) connector: Connector,
  pub(crate) certs: Arc<CertificateManager>,
  pub(crate) dyn_tls: Arc<DynamicTlsServer>,
  pub(crate) main_port: u16,
}

/// The intercepting proxy.
pub struct Proxy {
  shared: Arc<Shared>,
  main_listener: TcpListener,
  dyn_listener: TcpListener,
  tls_acceptor: Option<TlsAcceptor>,
  main_addr: SocketAddr,
  dyn_addr: SocketAddr,
}

impl Proxy {
  /// Prepare a proxy: CA material first, then both listeners.
  ///
  /// Nothing is accepted until [`run`](Self::run) or
  /// [`start`](Self::start).
  pub async fn new(config: ProxyConfig, patcher: Arc<dyn Patcher>) -> Result<Self> {
    // The authority must be ready before any listener accepts.
    let certs = Arc::new(CertificateManager::new(&config.ca_storage_path).await?);

    let connector = Connector::new(config.connect_timeout, config.verify_upstream)?;

    let dyn_listener = TcpListener::bind((Ipv4Addr::LOCALHOST, config.dynamic_port))
      .await
      .map_err(|e| Error::proxy(format!("failed to bind dynamic port: {}", e)))?;
    let dyn_addr = dyn_listener
      .local_addr()
      .map_err(|e| Error::proxy(e.to_string()))?;

    let dyn_tls = Arc::new(DynamicTlsServer::new(certs.clone(), dyn_addr.port())?);

    let main_listener = TcpListener::bind((config.bind_addr, config.main_port))
      .await
      .map_err(|e| Error::proxy(format!("failed to bind main port: {}", e)))?;
    let main_addr = main_listener
      .local_addr()
      .map_err(|e| Error::proxy(e.to_string()))?;

    let tls_acceptor = if config.use_tls {
      let (chain, key) = certs.local_cert()?;
      let server_config = ServerConfig::builder_with_provider(
        rustls::crypto::ring::default_provider().into(),
      )
      .with_protocol_versions(rustls::ALL_VERSIONS)
      .map_err(|e| Error::tls(format!("invalid TLS versions: {}", e)))?
      .with_no_client_auth()
      .with_single_cert(chain, key)
      .map_err(|e| Error::tls(format!("unusable local certificate: {}", e)))?;
      Some(TlsAcceptor::from(Arc::new(server_config)))
    } else {
      None
    };

    let shared = Arc::new(Shared {
      config,
      patcher,
      connector,
      certs,
      dyn_tls,
      main_port: main_addr.port(),
    });

    Ok(Self {
      shared,
      main_listener,
      dyn_listener,
      tls_acceptor,
      main_addr,
      dyn_addr,
    })
  }

  /// Address of the main listener.
  pub fn main_addr(&self) -> SocketAddr {
    self.main_addr
  }

  /// Address of the dynamic TLS listener.
  pub fn dynamic_addr(&self) -> SocketAddr {
    self.dyn_addr
  }

  /// Root certificate in PEM form, for client trust-store installation.
  pub fn ca_cert_pem(&self) -> Result<String> {
    self.shared.certs.ca_cert_pem()
  }

  /// Path of the persisted root certificate.
  pub fn ca_cert_path(&self) -> PathBuf {
    self.shared.certs.ca_cert_path()
  }

  /// Run the proxy until a listener-level fault.
  ///
  /// Per-connection failures are contained; listener errors are fatal and
  /// propagate out of this call.
  pub async fn run(self) -> Result<()> {
    let Proxy {
      shared,
      main_listener,
      dyn_listener,
      tls_acceptor,
      main_addr,
      dyn_addr,
    } = self;

    tracing::info!("intercepting proxy on {}", main_addr);
    tracing::info!("dynamic TLS endpoint on {}", dyn_addr);

    tokio::select! {
      result = dynamic_tls::run(dyn_listener, shared.clone()) => result,
      result = main_accept(main_listener, tls_acceptor, shared) => result,
    }
  }

  /// Run the proxy in the background, returning a control handle.
  pub fn start(self) -> ProxyHandle {
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut shutdown_rx = shutdown_tx.subscribe();
    let main_addr = self.main_addr;
    let dynamic_addr = self.dyn_addr;

    let handle = tokio::spawn(async move {
      tokio::select! {
        result = self.run() => {
          if let Err(e) = result {
            tracing::error!("proxy terminated: {}", e);
          }
        }
        _ = shutdown_rx.recv() => {
          tracing::info!("proxy shutdown signal received");
        }
      }
    });

    ProxyHandle {
      shutdown_tx,
      main_addr,
      dynamic_addr,
      handle,
    }
  }
}

/// Handle for controlling a running proxy.
pub struct ProxyHandle {
  shutdown_tx: broadcast::Sender<()>,
  main_addr: SocketAddr,
  dynamic_addr: SocketAddr,
  handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
  /// Address of the main listener.
  pub fn main_addr(&self) -> SocketAddr {
    self.main_addr
  }

  /// Address of the dynamic TLS listener.
  pub fn dynamic_addr(&self) -> SocketAddr {
    self.dynamic_addr
  }

  /// Signal the proxy to shut down.
  pub fn shutdown(&self) {
    let _ = self.shutdown_tx.send(());
  }

  /// Wait for the proxy to finish.
  pub async fn wait(self) {
    let _ = self.handle.await;
  }

  /// Shut down and wait.
  pub async fn stop(self) {
    self.shutdown();
    self.wait().await;
  }
}

async fn main_accept(
  listener: TcpListener,
  tls_acceptor: Option<TlsAcceptor>,
  shared: Arc<Shared>,
) -> Result<()> {
  loop {
    let (stream, _) = listener
      .accept()
      .await
      .map_err(|e| Error::proxy(format!("main listener failed: {}", e)))?;
    let shared = shared.clone();
    let tls_acceptor = tls_acceptor.clone();
    tokio::spawn(async move {
      match tls_acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
          Ok(tls_stream) => serve_connection(tls_stream, shared).await,
          Err(e) => tracing::warn!("main TLS handshake failed: {}", e),
        },
        None => serve_connection(stream, shared).await,
      }
    });
  }
}

/// Route one accepted connection to the matching engine.
async fn serve_connection<S>(stream: S, shared: Arc<Shared>)
where
  S: AsyncRead + AsyncWrite + Unpin + Send,
{
  let mut reader = BufReader::new(stream);
  let head = match http1::read_request_head(&mut reader).await {
    Ok(head) => head,
    Err(e) => {
      tracing::warn!("failed to read request: {}", e);
      return;
    }
  };

  if head.method == Method::CONNECT {
    let buffered = reader.buffer().to_vec();
    let stream = reader.into_inner();
    connect::handle(stream, buffered, head, &shared).await;
  } else if head.headers.contains_key(http::header::UPGRADE) {
    // WebSocket upgrade handling is a placeholder.
    tracing::warn!("dropping upgrade request on main listener");
  } else {
    engine::handle(reader, head, &shared).await;
  }
}
