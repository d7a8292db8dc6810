//! Integration tests for recast
//!
//! Each scenario drives a real proxy over loopback sockets against a
//! scripted origin server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use recast::{Decision, Passthrough, Patcher, Proxy, ProxyConfig, ProxyHandle, Transaction};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Scripted origin: serves one canned response per connection and records
/// what it received.
struct Origin {
  addr: SocketAddr,
  hits: Arc<AtomicUsize>,
  requests: Arc<Mutex<Vec<String>>>,
}

impl Origin {
  async fn spawn(response: Vec<u8>) -> Self {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let requests: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let hits_clone = hits.clone();
    let requests_clone = requests.clone();
    tokio::spawn(async move {
      loop {
        let (mut socket, _) = match listener.accept().await {
          Ok(pair) => pair,
          Err(_) => return,
        };
        hits_clone.fetch_add(1, Ordering::SeqCst);
        let response = response.clone();
        let requests = requests_clone.clone();
        tokio::spawn(async move {
          let mut buf = Vec::new();
          let mut chunk = [0u8; 1024];
          while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
            match socket.read(&mut chunk).await {
              Ok(0) | Err(_) => break,
              Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
          }
          requests
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(&buf).into_owned());
          socket.write_all(&response).await.ok();
        });
      }
    });

    Self {
      addr,
      hits,
      requests,
    }
  }

  fn request_text(&self) -> String {
    self.requests.lock().unwrap().join("\n")
  }
}

async fn start_proxy(patcher: Arc<dyn Patcher>) -> (ProxyHandle, String, TempDir) {
  let dir = TempDir::new().unwrap();
  let config = ProxyConfig::default()
    .with_main_port(0)
    .with_dynamic_port(0)
    .with_ca_storage_path(dir.path());
  let proxy = Proxy::new(config, patcher).await.unwrap();
  let ca_pem = proxy.ca_cert_pem().unwrap();
  let handle = proxy.start();
  (handle, ca_pem, dir)
}

async fn send_and_collect(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
  let mut stream = TcpStream::connect(addr).await.unwrap();
  stream.write_all(request).await.unwrap();
  let mut response = Vec::new();
  stream.read_to_end(&mut response).await.unwrap();
  response
}

/// Read from the stream until the end of an HTTP header block.
async fn read_header_block(stream: &mut TcpStream) -> Vec<u8> {
  let mut buf = Vec::new();
  let mut byte = [0u8; 1];
  while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
    match stream.read(&mut byte).await {
      Ok(0) | Err(_) => break,
      Ok(_) => buf.push(byte[0]),
    }
  }
  buf
}

#[tokio::test]
async fn plain_http_allow_passthrough() {
  let origin = Origin::spawn(
    b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\nPublic-Key-Pins: pin-sha256=\"x\"\r\n\r\nhello".to_vec(),
  )
  .await;
  let (proxy, _ca, _dir) = start_proxy(Arc::new(Passthrough)).await;

  let request = format!(
    "GET http://{}/ HTTP/1.1\r\nHost: {}\r\n\r\n",
    origin.addr, origin.addr
  );
  let response = send_and_collect(proxy.main_addr(), request.as_bytes()).await;
  let text = String::from_utf8_lossy(&response);

  assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {}", text);
  assert!(text.ends_with("hello"));
  assert!(text.to_lowercase().contains("content-length: 5"));
  assert!(
    !text.to_lowercase().contains("public-key-pins"),
    "pinning header must be dropped"
  );

  // The outgoing request carries the forced Accept-Encoding.
  let sent = origin.request_text();
  assert!(sent.to_lowercase().contains("accept-encoding: gzip, deflate"));
  proxy.stop().await;
}

struct UppercasePatcher;

#[async_trait::async_trait]
impl Patcher for UppercasePatcher {
  async fn on_connect(&self, _host_port: &str, _id: u64) -> Decision {
    Decision::Allow
  }
  async fn on_request(&self, _tx: &Transaction) -> (Decision, Option<Bytes>) {
    (Decision::Allow, None)
  }
  async fn on_text_response(&self, _tx: &Transaction, body: &str) -> Bytes {
    Bytes::from(body.to_uppercase())
  }
  async fn on_other_response(&self, _tx: &Transaction, body: &Bytes) -> Bytes {
    body.clone()
  }
}

#[tokio::test]
async fn gzip_text_response_is_inflated_and_patched() {
  use flate2::write::GzEncoder;
  use flate2::Compression;
  use std::io::Write;

  let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
  encoder.write_all(b"<b>hi</b>").unwrap();
  let compressed = encoder.finish().unwrap();

  let mut response = format!(
    "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
    compressed.len()
  )
  .into_bytes();
  response.extend_from_slice(&compressed);

  let origin = Origin::spawn(response).await;
  let (proxy, _ca, _dir) = start_proxy(Arc::new(UppercasePatcher)).await;

  let request = format!(
    "GET http://{}/ HTTP/1.1\r\nHost: {}\r\n\r\n",
    origin.addr, origin.addr
  );
  let body_expected = "<B>HI</B>";
  let text =
    String::from_utf8_lossy(&send_and_collect(proxy.main_addr(), request.as_bytes()).await)
      .into_owned();

  assert!(text.ends_with(body_expected), "got: {}", text);
  assert!(text.to_lowercase().contains("content-encoding: identity"));
  assert!(text
    .to_lowercase()
    .contains(&format!("content-length: {}", body_expected.len())));
  proxy.stop().await;
}

struct DenyPatcher;

#[async_trait::async_trait]
impl Patcher for DenyPatcher {
  async fn on_connect(&self, _host_port: &str, _id: u64) -> Decision {
    Decision::Deny
  }
  async fn on_request(&self, _tx: &Transaction) -> (Decision, Option<Bytes>) {
    (Decision::Deny, None)
  }
  async fn on_text_response(&self, _tx: &Transaction, body: &str) -> Bytes {
    Bytes::from(body.to_string())
  }
  async fn on_other_response(&self, _tx: &Transaction, body: &Bytes) -> Bytes {
    body.clone()
  }
}

#[tokio::test]
async fn denied_request_closes_without_reply() {
  let origin = Origin::spawn(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec()).await;
  let (proxy, _ca, _dir) = start_proxy(Arc::new(DenyPatcher)).await;

  let request = format!(
    "GET http://{}/ HTTP/1.1\r\nHost: {}\r\n\r\n",
    origin.addr, origin.addr
  );
  let response = send_and_collect(proxy.main_addr(), request.as_bytes()).await;
  assert!(response.is_empty(), "deny must not write any bytes");

  tokio::time::sleep(Duration::from_millis(50)).await;
  assert_eq!(
    origin.hits.load(Ordering::SeqCst),
    0,
    "deny must not contact the origin"
  );
  proxy.stop().await;
}

#[tokio::test]
async fn denied_connect_closes_without_reply() {
  let (proxy, _ca, _dir) = start_proxy(Arc::new(DenyPatcher)).await;
  let response = send_and_collect(
    proxy.main_addr(),
    b"CONNECT example.test:443 HTTP/1.1\r\n\r\n",
  )
  .await;
  assert!(response.is_empty());
  proxy.stop().await;
}

struct EmptyPatcher;

#[async_trait::async_trait]
impl Patcher for EmptyPatcher {
  async fn on_connect(&self, _host_port: &str, _id: u64) -> Decision {
    Decision::Allow
  }
  async fn on_request(&self, _tx: &Transaction) -> (Decision, Option<Bytes>) {
    (Decision::Empty { headers: None }, None)
  }
  async fn on_text_response(&self, _tx: &Transaction, body: &str) -> Bytes {
    Bytes::from(body.to_string())
  }
  async fn on_other_response(&self, _tx: &Transaction, body: &Bytes) -> Bytes {
    body.clone()
  }
}

#[tokio::test]
async fn empty_decision_synthesizes_negotiated_reply() {
  let origin = Origin::spawn(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec()).await;
  let (proxy, _ca, _dir) = start_proxy(Arc::new(EmptyPatcher)).await;

  let request = format!(
    "GET http://{}/img HTTP/1.1\r\nHost: {}\r\nAccept: image/png, */*\r\n\r\n",
    origin.addr, origin.addr
  );
  let text =
    String::from_utf8_lossy(&send_and_collect(proxy.main_addr(), request.as_bytes()).await)
      .into_owned();

  assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
  assert!(text.to_lowercase().contains("content-type: image/png"));
  assert!(text.contains("Apache/2.4.7 (Ubuntu)"));
  assert!(text.to_lowercase().contains("content-length: 0"));
  assert_eq!(origin.hits.load(Ordering::SeqCst), 0);
  proxy.stop().await;
}

struct RedirectPatcher {
  target: String,
}

#[async_trait::async_trait]
impl Patcher for RedirectPatcher {
  async fn on_connect(&self, _host_port: &str, _id: u64) -> Decision {
    Decision::Allow
  }
  async fn on_request(&self, _tx: &Transaction) -> (Decision, Option<Bytes>) {
    (
      Decision::Redirect {
        location: Some(self.target.parse().unwrap()),
        text: None,
        headers: None,
      },
      None,
    )
  }
  async fn on_text_response(&self, _tx: &Transaction, body: &str) -> Bytes {
    Bytes::from(body.to_string())
  }
  async fn on_other_response(&self, _tx: &Transaction, body: &Bytes) -> Bytes {
    body.clone()
  }
}

#[tokio::test]
async fn redirect_decision_retargets_upstream() {
  let origin = Origin::spawn(
    b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 9\r\n\r\nredirected".to_vec(),
  )
  .await;
  let (proxy, _ca, _dir) = start_proxy(Arc::new(RedirectPatcher {
    target: format!("http://{}/elsewhere", origin.addr),
  }))
  .await;

  // The original target does not exist; only the redirect target answers.
  let request = b"GET http://192.0.2.1:9/ HTTP/1.1\r\nHost: 192.0.2.1\r\n\r\n";
  let text = String::from_utf8_lossy(&send_and_collect(proxy.main_addr(), request).await)
    .into_owned();

  assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {}", text);
  assert!(origin.request_text().contains("GET /elsewhere HTTP/1.1"));
  proxy.stop().await;
}

struct PipePatcher;

#[async_trait::async_trait]
impl Patcher for PipePatcher {
  async fn on_connect(&self, _host_port: &str, _id: u64) -> Decision {
    Decision::Pipe
  }
  async fn on_request(&self, _tx: &Transaction) -> (Decision, Option<Bytes>) {
    (Decision::Allow, None)
  }
  async fn on_text_response(&self, _tx: &Transaction, body: &str) -> Bytes {
    Bytes::from(body.to_string())
  }
  async fn on_other_response(&self, _tx: &Transaction, body: &Bytes) -> Bytes {
    body.clone()
  }
}

#[tokio::test]
async fn connect_pipe_is_an_opaque_splice() {
  // A banner-first protocol, the way SSH talks.
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    loop {
      let (mut socket, _) = match listener.accept().await {
        Ok(pair) => pair,
        Err(_) => return,
      };
      tokio::spawn(async move {
        socket.write_all(b"SSH-2.0-origin\r\n").await.ok();
        let mut buf = [0u8; 64];
        let _ = socket.read(&mut buf).await;
      });
    }
  });

  let (proxy, _ca, _dir) = start_proxy(Arc::new(PipePatcher)).await;

  let mut stream = TcpStream::connect(proxy.main_addr()).await.unwrap();
  let connect = format!("CONNECT {} HTTP/1.1\r\n\r\n", addr);
  stream.write_all(connect.as_bytes()).await.unwrap();
  stream.write_all(b"SSH-2.0-client\r\n").await.unwrap();

  let mut response = vec![0u8; 64];
  let n = stream.read(&mut response).await.unwrap();
  let text = String::from_utf8_lossy(&response[..n]).into_owned();

  assert!(
    text.starts_with("SSH-2.0-origin"),
    "pipe must not interpose a 200 reply, got: {}",
    text
  );
  proxy.stop().await;
}

/// Patcher for the TLS interception scenario: allows the tunnel and
/// retargets the terminated request at a local origin.
struct InterceptPatcher {
  target: String,
  connects: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Patcher for InterceptPatcher {
  async fn on_connect(&self, _host_port: &str, _id: u64) -> Decision {
    self.connects.fetch_add(1, Ordering::SeqCst);
    Decision::Allow
  }
  async fn on_request(&self, _tx: &Transaction) -> (Decision, Option<Bytes>) {
    (
      Decision::Redirect {
        location: Some(self.target.parse().unwrap()),
        text: None,
        headers: None,
      },
      None,
    )
  }
  async fn on_text_response(&self, _tx: &Transaction, body: &str) -> Bytes {
    Bytes::from(body.to_string())
  }
  async fn on_other_response(&self, _tx: &Transaction, body: &Bytes) -> Bytes {
    body.clone()
  }
}

fn tls_client_config(ca_pem: &str) -> tokio_rustls::TlsConnector {
  use tokio_rustls::rustls::{ClientConfig, RootCertStore};

  let mut roots = RootCertStore::empty();
  for cert in rustls_pemfile::certs(&mut ca_pem.as_bytes()) {
    roots.add(cert.unwrap()).unwrap();
  }
  let config = ClientConfig::builder_with_provider(
    tokio_rustls::rustls::crypto::ring::default_provider().into(),
  )
  .with_protocol_versions(tokio_rustls::rustls::ALL_VERSIONS)
  .unwrap()
  .with_root_certificates(roots)
  .with_no_client_auth();
  tokio_rustls::TlsConnector::from(Arc::new(config))
}

async fn intercepted_round_trip(
  proxy_addr: SocketAddr,
  connector: &tokio_rustls::TlsConnector,
) -> String {
  use tokio_rustls::rustls::pki_types::ServerName;

  let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
  stream
    .write_all(b"CONNECT secure.test:443 HTTP/1.1\r\n\r\n")
    .await
    .unwrap();

  let established = read_header_block(&mut stream).await;
  let established = String::from_utf8_lossy(&established).into_owned();
  assert!(
    established.contains("200 Connection Established"),
    "got: {}",
    established
  );

  let server_name = ServerName::try_from("secure.test").unwrap();
  let mut tls = connector.connect(server_name, stream).await.unwrap();
  tls
    .write_all(b"GET / HTTP/1.1\r\nHost: secure.test\r\n\r\n")
    .await
    .unwrap();

  let mut response = Vec::new();
  tls.read_to_end(&mut response).await.ok();
  String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test]
async fn connect_tls_interception_end_to_end() {
  let origin = Origin::spawn(
    b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello".to_vec(),
  )
  .await;
  let connects = Arc::new(AtomicUsize::new(0));
  let (proxy, ca_pem, _dir) = start_proxy(Arc::new(InterceptPatcher {
    target: format!("http://{}/", origin.addr),
    connects: connects.clone(),
  }))
  .await;

  let connector = tls_client_config(&ca_pem);

  // First tunnel: certificate minted for secure.test, handshake succeeds,
  // the terminated request reaches the origin through the engine.
  let first = intercepted_round_trip(proxy.main_addr(), &connector).await;
  assert!(first.contains("200 OK"), "got: {}", first);
  assert!(first.ends_with("hello"));

  // Second identical tunnel: the installed context is reused and the
  // handshake still succeeds.
  let second = intercepted_round_trip(proxy.main_addr(), &connector).await;
  assert!(second.contains("200 OK"));

  assert_eq!(connects.load(Ordering::SeqCst), 2);
  assert_eq!(origin.hits.load(Ordering::SeqCst), 2);
  proxy.stop().await;
}

#[tokio::test]
async fn connect_acknowledges_before_classification_bytes() {
  let (proxy, _ca, _dir) = start_proxy(Arc::new(Passthrough)).await;

  let mut stream = TcpStream::connect(proxy.main_addr()).await.unwrap();
  stream
    .write_all(b"CONNECT example.test:443 HTTP/1.1\r\n\r\n")
    .await
    .unwrap();

  // The tunnel is acknowledged while no classification byte has been sent.
  let established = read_header_block(&mut stream).await;
  let established = String::from_utf8_lossy(&established).into_owned();
  assert!(
    established.contains("200 Connection Established"),
    "got: {}",
    established
  );

  // Two bytes are not enough to classify; the classifier keeps waiting.
  stream.write_all(b"GE").await.unwrap();
  tokio::time::sleep(Duration::from_millis(20)).await;
  stream
    .write_all(b"T / HTTP/1.1\r\nHost: example.test\r\n\r\n")
    .await
    .unwrap();

  // Cleartext goes back to the main listener, whose engine destroys the
  // host-less request; the tunnel ends without further bytes.
  let mut rest = Vec::new();
  stream.read_to_end(&mut rest).await.ok();
  assert!(rest.is_empty(), "got: {:?}", rest);
  proxy.stop().await;
}

#[tokio::test]
async fn request_without_host_is_rejected() {
  let (proxy, _ca, _dir) = start_proxy(Arc::new(Passthrough)).await;
  let response = send_and_collect(
    proxy.main_addr(),
    b"GET /no-host HTTP/1.1\r\nHost: example.test\r\n\r\n",
  )
  .await;
  assert!(response.is_empty(), "path-only target must be destroyed");
  proxy.stop().await;
}

#[tokio::test]
async fn proxy_lifecycle() {
  let (proxy, ca_pem, _dir) = start_proxy(Arc::new(Passthrough)).await;
  assert!(ca_pem.contains("BEGIN CERTIFICATE"));
  assert!(proxy.dynamic_addr().ip().is_loopback());
  proxy.stop().await;
}
