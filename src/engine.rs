//! Request engine
//!
//! Mediates one absolute-URL HTTP/1.x transaction: validate, buffer the
//! request body, consult the patcher, forward to the origin, inflate and
//! patch the reply, and answer the client. Requests arrive here both from
//! the main listener and, already absolutized, from the dynamic TLS server.

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{Error, Result};
use crate::http1::{self, RequestHead};
use crate::mime;
use crate::patcher::Decision;
use crate::proxy::Shared;
use crate::transaction::Transaction;

/// Serve one transaction, containing failures to this client.
///
/// Every path ends with either a response written or the client stream
/// dropped; per-transaction errors are warnings, wiring faults are errors.
pub(crate) async fn handle<S>(mut reader: BufReader<S>, head: RequestHead, shared: &Shared)
where
  S: AsyncRead + AsyncWrite + Unpin + Send,
{
  if let Err(e) = process(&mut reader, head, shared).await {
    if e.is_transaction_scoped() {
      tracing::warn!("transaction failed: {}", e);
    } else {
      tracing::error!("request handling fault: {}", e);
    }
  }
}

async fn process<S>(reader: &mut BufReader<S>, head: RequestHead, shared: &Shared) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin + Send,
{
  // Only absolute-form targets name an origin we can dial.
  if head.target.is_empty() || head.target.starts_with('/') {
    return Err(Error::invalid_request(format!(
      "request URL carries no host: {:?}",
      head.target
    )));
  }
  let url: Uri = head
    .target
    .parse()
    .map_err(|e| Error::invalid_request(format!("unparsable request URL: {}", e)))?;
  if url.host().is_none() {
    return Err(Error::invalid_request(format!(
      "request URL carries no host: {:?}",
      head.target
    )));
  }

  let body = http1::read_request_body(reader, &head.headers, shared.config.max_body_size).await?;
  if head.method == Method::GET && !body.is_empty() {
    tracing::warn!("GET request for {} carries a body", url);
  }

  let client_version = head.version;
  let mut tx = Transaction::new(url, head.method, head.headers, Bytes::from(body));

  let (decision, rewritten) = shared.patcher.on_request(&tx).await;
  if let Some(body) = rewritten {
    tx.body = body;
  }

  // The origin must reply with content we can inflate.
  let mut upstream_headers = tx.headers.clone();
  upstream_headers.insert(
    http::header::ACCEPT_ENCODING,
    HeaderValue::from_static("gzip, deflate"),
  );

  match decision {
    Decision::Allow => {}
    Decision::Deny => {
      // Destroy the client side without a reply.
      return Ok(());
    }
    Decision::Empty { headers } => {
      let headers = headers.unwrap_or_else(|| default_synthetic_headers(&tx.headers));
      return write_synthetic(reader.get_mut(), client_version, headers, b"").await;
    }
    Decision::Redirect {
      location: None,
      text,
      headers,
    } => {
      let headers = headers.unwrap_or_else(|| default_synthetic_headers(&tx.headers));
      let body = text.unwrap_or_default();
      return write_synthetic(reader.get_mut(), client_version, headers, body.as_bytes()).await;
    }
    Decision::Redirect {
      location: Some(location),
      ..
    } => {
      tx.url = merge_target(&tx.url, &location)?;
    }
    Decision::Pipe => {
      return Err(Error::proxy("pipe decision outside CONNECT"));
    }
  }

  let (head, patched, mut response_headers) = round_trip(&mut tx, upstream_headers, reader, shared).await?;

  // Re-framed by length; stale framing and pinning headers must not leak
  // back to the client.
  response_headers.remove(http::header::TRANSFER_ENCODING);
  response_headers.remove("public-key-pins");
  response_headers.insert(
    http::header::CONTENT_LENGTH,
    HeaderValue::from(patched.len()),
  );

  let write = http1::write_response(
    reader.get_mut(),
    client_version,
    head.status,
    &response_headers,
    &patched,
  );
  match shared.config.write_timeout {
    Some(timeout) => tokio::time::timeout(timeout, write)
      .await
      .map_err(|_| Error::invalid_request("client write timed out"))??,
    None => write.await?,
  }
  reader.get_mut().shutdown().await.ok();
  Ok(())
}

/// Forward the request upstream and run the response half of the pipeline.
async fn round_trip<S>(
  tx: &mut Transaction,
  upstream_headers: HeaderMap,
  reader: &mut BufReader<S>,
  shared: &Shared,
) -> Result<(http1::ResponseHead, Bytes, HeaderMap)>
where
  S: AsyncRead + AsyncWrite + Unpin + Send,
{
  let secure = tx.url.scheme_str() == Some("https");
  let host = tx
    .url
    .host()
    .ok_or_else(|| Error::invalid_request("request URL carries no host"))?
    .to_string();
  let port = tx.url.port_u16().unwrap_or(if secure { 443 } else { 80 });

  let mut upstream_headers = upstream_headers;
  strip_hop_by_hop(&mut upstream_headers);
  upstream_headers.insert(http::header::CONNECTION, HeaderValue::from_static("close"));

  let mut upstream = shared.connector.connect(secure, &host, port).await?;
  let raw = http1::serialize_request(&tx.method, &tx.url, Version::HTTP_11, &upstream_headers, &tx.body);
  upstream
    .write_all(&raw)
    .await
    .map_err(|e| Error::upstream(format!("failed to send request to {}: {}", host, e)))?;
  upstream
    .flush()
    .await
    .map_err(|e| Error::upstream(e.to_string()))?;

  let mut upstream_reader = BufReader::new(upstream);
  let head_only = tx.method == Method::HEAD;
  let limit = shared.config.max_body_size;

  // Client teardown aborts the in-flight upstream request.
  let read = async {
    match shared.config.read_timeout {
      Some(timeout) => tokio::time::timeout(
        timeout,
        http1::read_response(&mut upstream_reader, head_only, limit),
      )
      .await
      .map_err(|_| Error::upstream(format!("response from {} timed out", host)))?,
      None => http1::read_response(&mut upstream_reader, head_only, limit).await,
    }
  };
  let (head, body) = tokio::select! {
    result = read => result?,
    _ = closed(reader.get_mut()) => {
      return Err(Error::upstream("client closed, aborting upstream request"));
    }
  };

  tracing::debug!(
    "origin {} answered {:?} {} for transaction {}",
    host,
    head.version,
    head.status,
    tx.id
  );
  tx.status = Some(head.status);
  tx.response_headers = head.headers.clone();

  let mut response_headers = head.headers.clone();
  let content_type = head
    .headers
    .get(http::header::CONTENT_TYPE)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.split(';').next())
    .unwrap_or("")
    .trim()
    .to_string();

  let patched = if mime::is_text(&content_type) {
    let encoding = head
      .headers
      .get(http::header::CONTENT_ENCODING)
      .and_then(|v| v.to_str().ok())
      .map(|v| v.trim().to_ascii_lowercase())
      .unwrap_or_default();
    let body = if encoding == "gzip" || encoding == "deflate" {
      let inflated = http1::inflate(&encoding, &body)?;
      // The patcher sees plaintext; what goes back out is re-framed as
      // identity unless the patcher re-encodes.
      response_headers.insert(
        http::header::CONTENT_ENCODING,
        HeaderValue::from_static("identity"),
      );
      inflated
    } else {
      body
    };
    tx.is_text = true;
    tx.response_body = Bytes::from(body);
    let text = String::from_utf8_lossy(&tx.response_body).into_owned();
    shared.patcher.on_text_response(tx, &text).await
  } else {
    tx.is_text = false;
    tx.response_body = Bytes::from(body);
    let body = tx.response_body.clone();
    shared.patcher.on_other_response(tx, &body).await
  };

  Ok((head, patched, response_headers))
}

/// Default header set for synthesized replies.
///
/// The content type is negotiated from the client's `Accept` header,
/// refusing a bare wildcard.
fn default_synthetic_headers(request_headers: &HeaderMap) -> HeaderMap {
  let accept = request_headers
    .get(http::header::ACCEPT)
    .and_then(|v| v.to_str().ok())
    .unwrap_or("");
  let content_type = mime::parse_accepted_type(accept, "text/html", true);

  let mut headers = HeaderMap::new();
  if let Ok(value) = HeaderValue::from_str(&content_type) {
    headers.insert(http::header::CONTENT_TYPE, value);
  }
  headers.insert(
    http::header::SERVER,
    HeaderValue::from_static("Apache/2.4.7 (Ubuntu)"),
  );
  headers
}

async fn write_synthetic<W: AsyncWrite + Unpin>(
  writer: &mut W,
  version: Version,
  mut headers: HeaderMap,
  body: &[u8],
) -> Result<()> {
  headers.insert(
    http::header::CONTENT_LENGTH,
    HeaderValue::from(body.len()),
  );
  http1::write_response(writer, version, StatusCode::OK, &headers, body).await?;
  writer.shutdown().await.ok();
  Ok(())
}

/// Retarget a request: fields present on `location` override the original.
fn merge_target(original: &Uri, location: &Uri) -> Result<Uri> {
  let mut parts = http::uri::Parts::default();
  parts.scheme = location
    .scheme()
    .or(original.scheme())
    .cloned();
  parts.authority = location
    .authority()
    .or(original.authority())
    .cloned();
  parts.path_and_query = location
    .path_and_query()
    .or(original.path_and_query())
    .cloned();
  Uri::from_parts(parts).map_err(|e| Error::invalid_request(format!("invalid redirect target: {}", e)))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
  headers.remove(http::header::CONNECTION);
  headers.remove("proxy-connection");
  headers.remove("keep-alive");
  headers.remove(http::header::TE);
  headers.remove(http::header::TRAILER);
  headers.remove(http::header::UPGRADE);
}

/// Resolve when the peer has torn down its side.
async fn closed<S: AsyncRead + Unpin>(stream: &mut S) {
  let mut buf = [0u8; 1];
  loop {
    match stream.read(&mut buf).await {
      Ok(0) | Err(_) => return,
      // A transaction owns its connection; stray bytes cannot belong to
      // another request and are discarded.
      Ok(_) => continue,
    }
  }
}
