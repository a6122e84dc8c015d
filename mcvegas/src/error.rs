//! Error type shared by every fallible operation of the crate.

use thiserror::Error;

/// Errors raised by the integrators, the checkpoint store and the distributed coordinator.
///
/// Non-finite or zero integrand values are not errors; they are tallied in
/// [`Statistics`](crate::result::Statistics).
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid construction parameters, a zero call count, an incompatible checkpoint, or a
    /// degenerate refinement input.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A checkpoint stream that is malformed, truncated or written by an unsupported version.
    #[error("corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),
    /// Workers disagree about the run layout, or the transport failed.
    #[error("distributed synchronisation error: {0}")]
    DistributedSync(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shorthand for results carrying [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    pub(crate) fn corrupt(message: impl Into<String>) -> Self {
        Error::CorruptCheckpoint(message.into())
    }

    pub(crate) fn sync(message: impl Into<String>) -> Self {
        Error::DistributedSync(message.into())
    }
}
