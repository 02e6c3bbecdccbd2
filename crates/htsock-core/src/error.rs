use thiserror::Error;

/// Errors produced by the htsock transport.
///
/// Most failures never surface here: protocol violations are answered on
/// the wire with 4xx statuses, and client-side network failures are
/// retried or folded into the terminal close event. What remains is caller
/// misuse and the server's own plumbing.
#[derive(Debug, Error)]
pub enum SockError {
    /// Caller misuse: conflicting configuration, sending before the
    /// handshake completed, and similar synchronous mistakes.
    #[error("usage error: {0}")]
    Usage(String),

    /// An HTTP response could not be constructed.
    #[error("http error: {0}")]
    Http(String),

    /// The server was asked to do something after it stopped running.
    #[error("not running")]
    NotRunning,

    /// A held-open response was torn down without a body being written.
    /// Returned by request handlers to make the connection abort.
    #[error("response aborted")]
    Aborted,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SockResult<T> = Result<T, SockError>;
