//! Traffic policy interface
//!
//! The patcher is the engine's only extension surface: four async hooks,
//! each invoked at most once per transaction. The engine treats the hooks
//! as opaque and never re-enters the patcher for the same transaction id.

use bytes::Bytes;
use http::{HeaderMap, Uri};

use crate::transaction::Transaction;

/// Verdict returned by the patcher for a transaction.
///
/// Each variant carries exactly the data its handling needs, so there is no
/// unknown-decision failure mode to defend against.
#[derive(Debug, Clone, Default)]
pub enum Decision {
  /// Proceed normally; the request body may have been rewritten.
  #[default]
  Allow,
  /// Abort the transaction and close the client side without a reply.
  Deny,
  /// Synthesize an empty 200 reply without contacting the origin.
  Empty {
    /// Headers for the synthetic reply; `None` selects the default set.
    headers: Option<HeaderMap>,
  },
  /// Retarget the upstream request, or synthesize a 200 with `text`.
  Redirect {
    /// New upstream target; when absent, `text` becomes the reply body.
    location: Option<Uri>,
    /// Body for the synthesized reply when no location is given.
    text: Option<String>,
    /// Headers for the synthesized reply; `None` selects the default set.
    headers: Option<HeaderMap>,
  },
  /// CONNECT only: open an opaque byte pipe to the requested host:port.
  Pipe,
}

/// Asynchronous hooks through which an external policy engine mediates
/// every transaction.
#[async_trait::async_trait]
pub trait Patcher: Send + Sync {
  /// Called for each `CONNECT` before any tunnel byte moves.
  ///
  /// Meaningful results are `Allow`, `Deny` and `Pipe`.
  async fn on_connect(&self, host_port: &str, id: u64) -> Decision;

  /// Called once the request head and body have been read.
  ///
  /// Returns the decision plus the possibly rewritten request body; `None`
  /// keeps the body as received.
  async fn on_request(&self, tx: &Transaction) -> (Decision, Option<Bytes>);

  /// Called with the fully decompressed body of a text-classified response.
  ///
  /// The returned bytes replace the response body.
  async fn on_text_response(&self, tx: &Transaction, body: &str) -> Bytes;

  /// Called with the raw body of a non-text response.
  async fn on_other_response(&self, tx: &Transaction, body: &Bytes) -> Bytes;
}

/// Patcher that lets all traffic through untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

#[async_trait::async_trait]
impl Patcher for Passthrough {
  async fn on_connect(&self, _host_port: &str, _id: u64) -> Decision {
    Decision::Allow
  }

  async fn on_request(&self, _tx: &Transaction) -> (Decision, Option<Bytes>) {
    (Decision::Allow, None)
  }

  async fn on_text_response(&self, _tx: &Transaction, body: &str) -> Bytes {
    Bytes::copy_from_slice(body.as_bytes())
  }

  async fn on_other_response(&self, _tx: &Transaction, body: &Bytes) -> Bytes {
    body.clone()
  }
}
