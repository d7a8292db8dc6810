//! Intercepting HTTP/HTTPS proxy engine
//!
//! This crate provides an intercepting (man-in-the-middle) proxy for a
//! user's own traffic: client TLS is terminated with per-host leaf
//! certificates minted on the fly and signed by a locally trusted root CA,
//! every request and response is handed to a pluggable [`Patcher`] which may
//! allow, deny, synthesize, redirect or rewrite it, and the result is
//! forwarded to the true origin.
//!
//! # Architecture
//!
//! Two listeners cooperate. The main port speaks plain proxy HTTP/1.x
//! (absolute-URL requests and `CONNECT`); the dynamic port is a
//! loopback-only TLS endpoint whose certificate is selected per SNI host
//! from a set of leaves minted during `CONNECT` handling. Intercepted TLS
//! tunnels are dispatched back into the dynamic port so a single request
//! engine serves both cleartext and terminated-TLS traffic.
//!
//! # Example
//!
//! ```no_run
//! use recast::{Passthrough, Proxy, ProxyConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProxyConfig::default();
//!     let proxy = Proxy::new(config, Arc::new(Passthrough)).await?;
//!     proxy.run().await?;
//!     Ok(())
//! }
//! ```

mod ca;
mod connect;
mod dynamic_tls;
mod engine;
mod error;
mod http1;
mod mime;
mod patcher;
mod proxy;
mod transaction;
mod upstream;

pub use ca::{CertificateAuthority, CertificateManager};
pub use dynamic_tls::DynamicTlsServer;
pub use error::{Error, Result};
pub use mime::{is_text, parse_accepted_type};
pub use patcher::{Decision, Passthrough, Patcher};
pub use proxy::{Proxy, ProxyConfig, ProxyHandle};
pub use transaction::{next_id, Transaction};

/// Default port for the main proxy listener.
pub const DEFAULT_MAIN_PORT: u16 = 12345;
/// Default port for the loopback-only dynamic TLS listener.
pub const DEFAULT_DYNAMIC_PORT: u16 = 12346;

pub(crate) const CR_LF: &[u8] = b"\r\n";
pub(crate) const COLON_SPACE: &[u8] = b": ";
pub(crate) const SPACE: &[u8] = b" ";
