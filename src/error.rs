use std::error::Error as StdError;

use thiserror::Error;

/// Mirage's crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Mirage's crate-wide error type.
///
/// The variants mirror how failures surface to callers: the first four map
/// directly onto HTTP status codes at the API boundary, the rest describe
/// pipeline-internal failures that reach users only through a task's
/// `error_message`.
///
/// This is intentionally decoupled from `anyhow` so downstream libraries aren't
/// forced to adopt `anyhow` in their own public APIs.
#[derive(Debug, Error)]
pub enum Error {
    /// A parameter was out of range or an upload was malformed.
    #[error("{0}")]
    BadRequest(String),

    /// An upload exceeded the configured size cap.
    #[error("{0}")]
    PayloadTooLarge(String),

    /// No task (or no output) exists for the requested id.
    #[error("{0}")]
    NotFound(String),

    /// The concurrent-processing cap is reached; retry later.
    #[error("{0}")]
    ServerBusy(String),

    /// The external media toolchain exited non-zero.
    ///
    /// `stderr` carries an excerpt (first and last 4 KiB) of the process
    /// stderr; it is never parsed, only surfaced.
    #[error("{context}: {stderr}")]
    Toolchain { context: String, stderr: String },

    /// An audio file could not be read or written.
    #[error("audio i/o: {0}")]
    AudioIo(String),

    /// The extracted audio track contains no samples.
    #[error("audio track is empty")]
    AudioEmpty,

    /// A frame image could not be read or written.
    #[error("frame i/o: {0}")]
    FrameIo(String),

    /// Anything unclassified.
    #[error("{0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] Box<dyn StdError + Send + Sync>),
}

impl Error {
    /// Build a `Toolchain` error from captured stderr, keeping only the first
    /// and last 4 KiB so a runaway process cannot bloat the task record.
    pub fn toolchain(context: impl Into<String>, stderr: &[u8]) -> Self {
        Self::Toolchain {
            context: context.into(),
            stderr: stderr_excerpt(stderr),
        }
    }
}

/// Reduce raw stderr to at most the first and last 4 KiB, lossily decoded.
fn stderr_excerpt(stderr: &[u8]) -> String {
    const KEEP: usize = 4096;
    if stderr.len() <= 2 * KEEP {
        return String::from_utf8_lossy(stderr).into_owned();
    }
    let head = String::from_utf8_lossy(&stderr[..KEEP]);
    let tail = String::from_utf8_lossy(&stderr[stderr.len() - KEEP..]);
    format!(
        "{head}\n[... {} bytes elided ...]\n{tail}",
        stderr.len() - 2 * KEEP
    )
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{err:#}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Other(Box::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Other(Box::new(err))
    }
}
