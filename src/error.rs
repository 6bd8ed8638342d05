//! Classified errors for broker operations.

use std::io;

use http::Uri;
use thiserror::Error;

/// Anything that can go wrong between accepting a request head and
/// handing back a live exchange.
///
/// The classification drives the retry decision in
/// [`BaseRequestBroker`][crate::broker::BaseRequestBroker]:
/// [`Error::Socket`] and [`Error::PriorRequestFailed`] are
/// connection-level failures that occur before any byte of the new
/// request reaches the wire, so they are safe to retry regardless of
/// method idempotence. Everything else surfaces to the caller.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The broker or operation was cancelled.
    #[error("operation aborted")]
    Aborted,

    /// Name resolution, connect, or I/O failure on an established
    /// socket. Timeouts surface here as well.
    #[error("socket: {0}")]
    Socket(#[source] io::Error),

    /// The connection carried an earlier pipelined request that died;
    /// this request never hit the wire.
    #[error("a prior request on this connection failed")]
    PriorRequestFailed,

    /// TLS handshake or certificate verification failure.
    #[error("tls: {0}")]
    Tls(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Malformed framing or unexpected peer behavior.
    #[error("http protocol: {0}")]
    Protocol(String),

    /// A redirect chain revisited a URI.
    #[error("circular redirect at {0}")]
    CircularRedirect(Uri),

    /// The request URI is missing pieces the broker needs.
    #[error("invalid uri: {0}")]
    InvalidUri(String),
}

impl Error {
    /// Whether a request broker may transparently re-dispatch on a
    /// fresh connection.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Socket(_) | Error::PriorRequestFailed)
    }

    pub(crate) fn timed_out() -> Self {
        Error::Socket(io::Error::new(io::ErrorKind::TimedOut, "i/o timed out"))
    }

    pub(crate) fn closed() -> Self {
        Error::Socket(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "connection closed",
        ))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Socket(err)
    }
}
