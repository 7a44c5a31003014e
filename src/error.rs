use std::time::Duration;

use thiserror::Error;

/// The failure modes a caller of the RPC surface can observe and needs to
///  tell apart: connectivity problems are retryable, timeouts mean the reply
///  did not arrive in time, remote failures carry the peer's diagnostic text.
///
/// Framing errors are not represented here - they tear down the connection
///  internally and surface as `NotConnected` on the next call.
#[derive(Debug, Error)]
pub enum RpcError {
    /// no live socket at call time - fail fast, the caller may retry later
    #[error("no live connection to the server")]
    NotConnected,

    /// no reply arrived within the deadline; the tracker entry is gone
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// the pending call was abandoned before a reply arrived (shutdown or
    ///  idle-expiry eviction)
    #[error("call was cancelled before completion")]
    Cancelled,

    /// the remote handler or method failed; carries the peer's diagnostic text
    #[error("remote call failed: {0}")]
    Remote(String),

    /// cluster routing found no unit (empty ring)
    #[error("no cluster unit available for routing")]
    NoRoute,

    /// the call could not be encoded or the path is malformed
    #[error("protocol error: {0}")]
    Protocol(String),

    /// the declared remote interface has no such method
    #[error("unknown remote method: {0}")]
    UnknownMethod(String),

    #[error("method {method} expects {expected} parameters, got {actual}")]
    ParameterMismatch {
        method: String,
        expected: usize,
        actual: usize,
    },
}
