//! Per-request transaction records and the process-wide id source

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Yield the next transaction id.
///
/// Ids are monotonic per process and only establish correlation between the
/// patcher hooks of one transaction, never ordering across transactions.
pub fn next_id() -> u64 {
  NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// One client-originated request and everything done on its behalf.
///
/// Built when the request head has been read, enriched with the origin's
/// reply before the response hooks run, and dropped when the client side is
/// finished or destroyed.
#[derive(Debug, Clone)]
pub struct Transaction {
  /// Correlation id handed to every patcher hook.
  pub id: u64,
  /// `Referer` request header, when present.
  pub referer: Option<String>,
  /// Effective absolute URL of the request.
  pub url: Uri,
  /// Request method.
  pub method: Method,
  /// Request headers as received from the client.
  pub headers: HeaderMap,
  /// Fully buffered request body.
  pub body: Bytes,
  /// Origin status, present once the origin has replied.
  pub status: Option<StatusCode>,
  /// Origin response headers.
  pub response_headers: HeaderMap,
  /// Fully buffered (and, for text, inflated) response body.
  pub response_body: Bytes,
  /// Whether the response was classified as text.
  pub is_text: bool,
}

impl Transaction {
  /// Start a transaction for a parsed request.
  pub fn new(url: Uri, method: Method, headers: HeaderMap, body: Bytes) -> Self {
    let referer = headers
      .get(http::header::REFERER)
      .and_then(|v| v.to_str().ok())
      .map(str::to_string);
    Self {
      id: next_id(),
      referer,
      url,
      method,
      headers,
      body,
      status: None,
      response_headers: HeaderMap::new(),
      response_body: Bytes::new(),
      is_text: false,
    }
  }
}
