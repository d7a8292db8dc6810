//! HTTP/1.x wire codec
//!
//! Hand-rolled head parsing, body framing and serialization shared by the
//! main listener, the dynamic TLS server and the upstream client. Bodies
//! are always buffered fully; framing follows `Content-Length`, chunked
//! transfer coding, or read-to-EOF for responses that carry neither.

use std::io::Read;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::{COLON_SPACE, CR_LF, SPACE};

/// Request line length cap
const MAX_REQUEST_LINE: usize = 8 * 1024;
/// Header block size cap
const MAX_HEADERS: usize = 64 * 1024;

/// Parsed request line and headers.
#[derive(Debug, Clone)]
pub(crate) struct RequestHead {
  pub method: Method,
  pub target: String,
  pub version: Version,
  pub headers: HeaderMap,
}

/// Parsed status line and headers of an origin reply.
#[derive(Debug, Clone)]
pub(crate) struct ResponseHead {
  pub version: Version,
  pub status: StatusCode,
  pub headers: HeaderMap,
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_version(token: &[u8]) -> Result<Version> {
  match token {
    b"HTTP/0.9" => Ok(Version::HTTP_09),
    b"HTTP/1.0" => Ok(Version::HTTP_10),
    b"HTTP/1.1" => Ok(Version::HTTP_11),
    b"HTTP/2.0" => Ok(Version::HTTP_2),
    _ => Err(Error::invalid_request("unsupported HTTP version")),
  }
}

pub(crate) fn version_str(version: Version) -> &'static str {
  match version {
    Version::HTTP_09 => "HTTP/0.9",
    Version::HTTP_10 => "HTTP/1.0",
    _ => "HTTP/1.1",
  }
}

/// Parse one `name: value` header line, CRLF included.
fn parse_header_line(buffer: &[u8]) -> Option<(HeaderName, HeaderValue)> {
  let buffer = strip_line_ending(buffer);
  let idx = buffer.iter().position(|b| *b == b':')?;
  let (name, value) = buffer.split_at(idx);
  let value = value[1..].strip_prefix(SPACE).unwrap_or(&value[1..]);
  let name = HeaderName::from_bytes(name).ok()?;
  let value = HeaderValue::from_bytes(value).ok()?;
  Some((name, value))
}

async fn read_headers<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<HeaderMap> {
  let mut headers = HeaderMap::new();
  let mut line = Vec::new();
  let mut total = 0usize;
  loop {
    line.clear();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 || line == b"\r\n" || line == b"\n" {
      break;
    }
    total += n;
    if total > MAX_HEADERS {
      return Err(Error::invalid_request("header block exceeds maximum"));
    }
    if let Some((k, v)) = parse_header_line(&line) {
      if headers.contains_key(&k) {
        headers.append(k, v);
      } else {
        headers.insert(k, v);
      }
    }
  }
  Ok(headers)
}

/// Read a request line plus headers from the client.
pub(crate) async fn read_request_head<R: AsyncBufRead + Unpin>(
  reader: &mut R,
) -> Result<RequestHead> {
  let mut line = Vec::new();
  let n = reader.read_until(b'\n', &mut line).await?;
  if n == 0 {
    return Err(Error::invalid_request("connection closed before request"));
  }
  if line.len() > MAX_REQUEST_LINE {
    return Err(Error::invalid_request("request line too long"));
  }

  let mut parts = strip_line_ending(&line)
    .split(|b| *b == b' ')
    .filter(|p| !p.is_empty());
  let method = parts
    .next()
    .and_then(|m| Method::from_bytes(m).ok())
    .ok_or_else(|| Error::invalid_request("missing request method"))?;
  let target = parts
    .next()
    .map(|t| String::from_utf8_lossy(t).into_owned())
    .ok_or_else(|| Error::invalid_request("missing request target"))?;
  let version = parse_version(parts.next().unwrap_or(b"HTTP/1.1"))?;

  let headers = read_headers(reader).await?;
  Ok(RequestHead {
    method,
    target,
    version,
    headers,
  })
}

async fn read_chunked_body<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  limit: usize,
) -> Result<Vec<u8>> {
  let mut body = Vec::new();
  let mut line = Vec::new();
  loop {
    line.clear();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
      return Err(Error::invalid_request("truncated chunked body"));
    }
    let size_text = String::from_utf8_lossy(&line);
    let size_text = size_text.trim();
    // chunk extensions after ';' are ignored
    let size_text = size_text.split(';').next().unwrap_or("").trim();
    let size = usize::from_str_radix(size_text, 16)
      .map_err(|_| Error::invalid_request("invalid chunk size"))?;
    if size == 0 {
      // drain trailers up to the final empty line
      loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 || line == b"\r\n" || line == b"\n" {
          break;
        }
      }
      break;
    }
    if body.len() + size > limit {
      return Err(Error::invalid_request("chunked body exceeds maximum"));
    }
    let start = body.len();
    body.resize(start + size, 0);
    reader.read_exact(&mut body[start..]).await?;
    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await?;
  }
  Ok(body)
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
  headers
    .get(http::header::CONTENT_LENGTH)
    .and_then(|v| v.to_str().ok()?.parse().ok())
}

fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get(http::header::TRANSFER_ENCODING)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.to_ascii_lowercase().contains("chunked"))
    .unwrap_or(false)
}

/// Read a request body framed by `Content-Length` or chunked coding.
///
/// A request with neither framing header has no body.
pub(crate) async fn read_request_body<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  headers: &HeaderMap,
  limit: usize,
) -> Result<Vec<u8>> {
  if is_chunked(headers) {
    return read_chunked_body(reader, limit).await;
  }
  match content_length(headers) {
    None | Some(0) => Ok(Vec::new()),
    Some(len) => {
      if len > limit {
        return Err(Error::invalid_request("request body exceeds maximum"));
      }
      let mut body = vec![0u8; len];
      reader.read_exact(&mut body).await?;
      Ok(body)
    }
  }
}

/// Read a full origin response: status line, headers and body.
///
/// Responses without `Content-Length` or chunked coding are read to EOF.
/// `head_only` skips body framing (HEAD requests and status codes that
/// carry no body).
pub(crate) async fn read_response<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  head_only: bool,
  limit: usize,
) -> Result<(ResponseHead, Vec<u8>)> {
  let mut line = Vec::new();
  let n = reader.read_until(b'\n', &mut line).await?;
  if n == 0 {
    return Err(Error::upstream("connection closed before status line"));
  }

  let mut parts = strip_line_ending(&line).splitn(3, |b| *b == b' ');
  let version = parse_version(
    parts
      .next()
      .ok_or_else(|| Error::upstream("missing status line"))?,
  )
  .map_err(|_| Error::upstream("invalid upstream HTTP version"))?;
  let status = parts
    .next()
    .and_then(|s| StatusCode::from_bytes(s).ok())
    .ok_or_else(|| Error::upstream("invalid upstream status code"))?;

  let headers = read_headers(reader).await?;

  let head = ResponseHead {
    version,
    status,
    headers,
  };

  let no_body = head_only
    || head.status.is_informational()
    || head.status == StatusCode::NO_CONTENT
    || head.status == StatusCode::NOT_MODIFIED;
  if no_body {
    return Ok((head, Vec::new()));
  }

  let body = if is_chunked(&head.headers) {
    read_chunked_body(reader, limit)
      .await
      .map_err(|e| Error::upstream(e.to_string()))?
  } else if let Some(len) = content_length(&head.headers) {
    if len > limit {
      return Err(Error::upstream("response body exceeds maximum"));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    body
  } else {
    let mut body = Vec::new();
    reader
      .take(limit as u64 + 1)
      .read_to_end(&mut body)
      .await?;
    if body.len() > limit {
      return Err(Error::upstream("response body exceeds maximum"));
    }
    body
  };

  Ok((head, body))
}

/// Serialize an origin-form request the way it goes on the wire.
///
/// A `Host` header is added from the URI authority when absent, and
/// `Content-Length` tracks the body length.
pub(crate) fn serialize_request(
  method: &Method,
  uri: &Uri,
  version: Version,
  headers: &HeaderMap,
  body: &[u8],
) -> Bytes {
  let mut raw = Vec::new();
  raw.extend(method.as_str().as_bytes());
  raw.extend(SPACE);
  let path = uri.path();
  raw.extend(if path.is_empty() { b"/" as &[u8] } else { path.as_bytes() });
  if let Some(q) = uri.query() {
    raw.extend(b"?");
    raw.extend(q.as_bytes());
  }
  raw.extend(SPACE);
  raw.extend(version_str(version).as_bytes());
  raw.extend(CR_LF);

  if headers.get(http::header::HOST).is_none() {
    raw.extend(http::header::HOST.as_str().as_bytes());
    raw.extend(COLON_SPACE);
    if let Some(authority) = uri.authority() {
      raw.extend(authority.as_str().as_bytes());
    }
    raw.extend(CR_LF);
  }

  let mut headers = headers.clone();
  headers.remove(http::header::CONTENT_LENGTH);
  headers.remove(http::header::TRANSFER_ENCODING);
  if !body.is_empty() {
    headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(body.len()));
  }
  for (k, v) in headers.iter() {
    raw.extend(k.as_str().as_bytes());
    raw.extend(COLON_SPACE);
    raw.extend(v.as_bytes());
    raw.extend(CR_LF);
  }
  raw.extend(CR_LF);
  raw.extend(body);
  Bytes::from(raw)
}

/// Write a full response to the client side.
pub(crate) async fn write_response<W: AsyncWrite + Unpin>(
  writer: &mut W,
  version: Version,
  status: StatusCode,
  headers: &HeaderMap,
  body: &[u8],
) -> Result<()> {
  let mut raw = Vec::new();
  raw.extend(version_str(version).as_bytes());
  raw.extend(SPACE);
  raw.extend(status.as_u16().to_string().as_bytes());
  raw.extend(SPACE);
  raw.extend(status.canonical_reason().unwrap_or("Unknown").as_bytes());
  raw.extend(CR_LF);
  for (k, v) in headers.iter() {
    raw.extend(k.as_str().as_bytes());
    raw.extend(COLON_SPACE);
    raw.extend(v.as_bytes());
    raw.extend(CR_LF);
  }
  raw.extend(CR_LF);
  raw.extend(body);
  writer.write_all(&raw).await?;
  writer.flush().await?;
  Ok(())
}

/// Inflate a `gzip` or `deflate` encoded body.
///
/// The deflate path accepts both zlib-wrapped and raw deflate streams.
pub(crate) fn inflate(encoding: &str, body: &[u8]) -> Result<Vec<u8>> {
  match encoding {
    "gzip" => {
      let mut out = Vec::new();
      flate2::read::MultiGzDecoder::new(body)
        .read_to_end(&mut out)
        .map_err(|e| Error::Decompress(format!("gzip: {}", e)))?;
      Ok(out)
    }
    "deflate" => {
      let mut out = Vec::new();
      match flate2::read::ZlibDecoder::new(body).read_to_end(&mut out) {
        Ok(_) => Ok(out),
        Err(_) => {
          out.clear();
          flate2::read::DeflateDecoder::new(body)
            .read_to_end(&mut out)
            .map_err(|e| Error::Decompress(format!("deflate: {}", e)))?;
          Ok(out)
        }
      }
    }
    other => Err(Error::Decompress(format!("unsupported encoding: {}", other))),
  }
}
