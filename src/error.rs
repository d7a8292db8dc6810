//! Error types for the proxy engine

use std::io;
use thiserror::Error;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for proxy operations
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(#[from] io::Error),

  /// Certificate error
  #[error("Certificate error: {0}")]
  Certificate(String),

  /// TLS error
  #[error("TLS error: {0}")]
  Tls(String),

  /// HTTP parsing error
  #[error("HTTP error: {0}")]
  Http(#[from] http::Error),

  /// Malformed or unsupported client request
  #[error("Invalid request: {0}")]
  InvalidRequest(String),

  /// Failure dialing or talking to an origin
  #[error("Upstream error: {0}")]
  Upstream(String),

  /// Body inflate failure
  #[error("Decompression error: {0}")]
  Decompress(String),

  /// Listener-level or wiring failure
  #[error("Proxy error: {0}")]
  Proxy(String),
}

impl Error {
  /// Create a certificate error
  pub fn certificate(msg: impl Into<String>) -> Self {
    Error::Certificate(msg.into())
  }

  /// Create a TLS error
  pub fn tls(msg: impl Into<String>) -> Self {
    Error::Tls(msg.into())
  }

  /// Create an invalid request error
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    Error::InvalidRequest(msg.into())
  }

  /// Create an upstream error
  pub fn upstream(msg: impl Into<String>) -> Self {
    Error::Upstream(msg.into())
  }

  /// Create a proxy error
  pub fn proxy(msg: impl Into<String>) -> Self {
    Error::Proxy(msg.into())
  }

  /// Whether this error ends one transaction rather than the process.
  ///
  /// Per-transaction failures are logged as warnings and destroy the
  /// affected client stream; everything else propagates to the caller.
  pub fn is_transaction_scoped(&self) -> bool {
    !matches!(self, Error::Proxy(_))
  }
}
