//! CONNECT tunnel engine
//!
//! Parses the tunnel target, consults the patcher, classifies the first
//! tunnel bytes as TLS or cleartext, and dispatches: opaque pipes go
//! straight to the requested origin, TLS handshakes loop back into the
//! dynamic TLS server, and cleartext (WebSocket) traffic loops back into
//! the main listener.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::http1::{version_str, RequestHead};
use crate::patcher::Decision;
use crate::proxy::Shared;
use crate::transaction::next_id;
use crate::{COLON_SPACE, CR_LF};

/// Split a `host[:port]` CONNECT target.
///
/// The final `:`-separated segment is consumed as the port only when it is
/// all digits and fits a u16; everything else stays part of the host, so
/// bracketed IPv6 literals pass through intact (brackets included).
pub(crate) fn parse_target(target: &str) -> (String, u16) {
  let parts: Vec<&str> = target.split(':').collect();
  if parts.len() > 1 {
    let last = parts[parts.len() - 1];
    if !last.is_empty() && last.bytes().all(|b| b.is_ascii_digit()) {
      if let Ok(port) = last.parse::<u16>() {
        return (parts[..parts.len() - 1].join(":"), port);
      }
    }
  }
  (target.to_string(), 443)
}

/// Whether the first tunnel bytes look like a TLS handshake record.
pub(crate) fn is_tls_head(head: &[u8]) -> bool {
  head.len() >= 3 && head[0] == 0x16 && head[1] == 0x03 && head[2] < 0x06
}

/// Handle one CONNECT transaction.
///
/// `buffered` holds any client bytes that arrived behind the request head.
pub(crate) async fn handle<S>(stream: S, buffered: Vec<u8>, head: RequestHead, shared: &Shared)
where
  S: AsyncRead + AsyncWrite + Unpin + Send,
{
  if let Err(e) = process(stream, buffered, head, shared).await {
    if e.is_transaction_scoped() {
      tracing::warn!("CONNECT tunnel failed: {}", e);
    } else {
      tracing::error!("CONNECT handling fault: {}", e);
    }
  }
}

async fn process<S>(
  mut stream: S,
  buffered: Vec<u8>,
  head: RequestHead,
  shared: &Shared,
) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin + Send,
{
  let id = next_id();
  let (host, port) = parse_target(&head.target);
  let host_port = format!("{}:{}", host, port);

  match shared.patcher.on_connect(&host_port, id).await {
    Decision::Deny => {
      // Close the client side without a reply.
      Ok(())
    }
    Decision::Pipe => {
      let mut upstream = shared.connector.dial(&host, port).await?;
      if !buffered.is_empty() {
        upstream.write_all(&buffered).await?;
      }
      splice(&mut stream, &mut upstream).await;
      Ok(())
    }
    Decision::Allow => {
      let mut tunnel_head = buffered;
      if tunnel_head.len() < 3 {
        // The classifier needs bytes the client will only send once the
        // tunnel is acknowledged. Written at most once.
        write_established(&mut stream, &head).await?;
        while tunnel_head.len() < 3 {
          let n = stream.read_buf(&mut tunnel_head).await?;
          if n == 0 {
            return Err(Error::invalid_request(
              "client closed before tunnel classification",
            ));
          }
        }
      }

      let loopback_port = if is_tls_head(&tunnel_head) {
        shared.dyn_tls.prepare(&host).await?;
        shared.dyn_tls.port()
      } else {
        // Cleartext on the tunnel: treat as a WebSocket-style exchange and
        // hand it to the main listener.
        shared.main_port
      };

      let mut loopback = TcpStream::connect(("127.0.0.1", loopback_port))
        .await
        .map_err(|e| Error::upstream(format!("loopback dispatch failed: {}", e)))?;
      loopback.write_all(&tunnel_head).await?;
      splice(&mut stream, &mut loopback).await;
      Ok(())
    }
    other => Err(Error::proxy(format!(
      "unsupported CONNECT decision: {:?}",
      other
    ))),
  }
}

/// Acknowledge the tunnel with the client's own HTTP version, echoing the
/// keep-alive headers the client asked for.
async fn write_established<S: AsyncWrite + Unpin>(stream: &mut S, head: &RequestHead) -> Result<()> {
  let mut raw = Vec::new();
  raw.extend(version_str(head.version).as_bytes());
  raw.extend(b" 200 Connection Established");
  raw.extend(CR_LF);
  for name in ["proxy-connection", "keep-alive"] {
    if let Some(value) = head.headers.get(name) {
      raw.extend(name.as_bytes());
      raw.extend(COLON_SPACE);
      raw.extend(value.as_bytes());
      raw.extend(CR_LF);
    }
  }
  raw.extend(CR_LF);
  stream.write_all(&raw).await?;
  stream.flush().await?;
  Ok(())
}

/// Copy both directions until either side ends; errors tear down both.
async fn splice<A, B>(a: &mut A, b: &mut B)
where
  A: AsyncRead + AsyncWrite + Unpin,
  B: AsyncRead + AsyncWrite + Unpin,
{
  if let Err(e) = tokio::io::copy_bidirectional(a, b).await {
    tracing::debug!("tunnel closed: {}", e);
  }
}
