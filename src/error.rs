//! Crate-level error types.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Crate-level result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the modem driver.
///
/// Reply-frame decode failures are not represented here: the background
/// reader logs them, drops the frame, and keeps running.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket-level failure on any of the modem's TCP ports.
    ///
    /// Fatal to the operation that opened the socket, not to the process.
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),

    /// No matching reply, or no transfer progress, within the bound.
    #[error("timed out waiting for {what} after {limit:?}")]
    Timeout {
        what: &'static str,
        limit: Duration,
    },

    /// User-supplied JSON failed to parse; nothing was written to the wire.
    #[error("invalid JSON payload: {0}")]
    Validation(#[source] serde_json::Error),

    /// A file was missing, unreadable, or unwritable.
    #[error("file {}: {source}", .path.display())]
    Resource {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A reply carried a payload the driver could not interpret.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The operation observed its cancel token and stopped early.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn resource(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Resource {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn timeout(what: &'static str, limit: Duration) -> Self {
        Self::Timeout { what, limit }
    }
}
