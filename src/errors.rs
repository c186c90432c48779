//! Domain error types for lmx-link.
//!
//! Typed errors at module boundaries replace string-encoded errors and let
//! callers distinguish "no node found" from "node not ready" from "stream
//! interrupted" by pattern matching instead of message sniffing.

use thiserror::Error;

/// Errors surfaced by the connectivity core.
///
/// Probing and discovery never return these — failure there degrades to a
/// `Disconnected` state or an empty result. Resolution raises only
/// [`LinkError::Cancelled`]; lifecycle and streaming raise the rest.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The caller's cancellation token fired while the operation was in flight.
    #[error("operation cancelled")]
    Cancelled,

    /// The chat socket did not complete its opening handshake in time.
    #[error("handshake timed out after {0}ms")]
    HandshakeTimeout(u64),

    /// An open chat socket went silent past the idle budget.
    #[error("no frame received for {0}ms, stream considered dead")]
    IdleTimeout(u64),

    /// The socket closed cleanly but the stream cannot be treated as a
    /// legitimate completion (no payload, or no completion frame after text).
    #[error("stream closed unexpectedly: {0}")]
    StreamClosed(String),

    /// A frame arrived that does not fit the chat protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The node reported an error; the message is the server's, verbatim.
    #[error("node error: {0}")]
    Node(String),

    /// A model download the node was performing on our behalf failed.
    #[error("model download failed: {0}")]
    DownloadFailed(String),

    /// The model never appeared in the loaded list within the overall budget.
    #[error("model '{model_id}' not ready after {timeout_ms}ms")]
    LoadTimeout { model_id: String, timeout_ms: u64 },

    /// Connection refused, DNS failure, client-side request timeout, and
    /// friends. Retryable by the caller; never raised from probe/discovery.
    #[error("transport error: {0}")]
    Transport(String),
}

impl LinkError {
    /// True for errors where the server may still be making progress even
    /// though our request died locally (see the load-request semantics in
    /// the model lifecycle).
    pub fn is_transport(&self) -> bool {
        matches!(self, LinkError::Transport(_))
    }
}
