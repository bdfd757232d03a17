use thiserror::Error;

/// Convenience alias used by every fallible operation in the crate.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors surfaced by cache operations.
///
/// Missing fields discovered during reads are *not* errors; they are
/// reported as data on the read result. Everything here is either a
/// malformed input or a programmer error.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A payload did not match the shape the selection implies at `path`.
    #[error("malformed payload at [{path}]: {reason}")]
    Payload {
        /// Dotted path of the offending value, relative to the write root.
        path: String,
        /// What was expected versus observed.
        reason: String,
    },
    /// A serialized graph failed structural validation during restore.
    #[error("invalid serialized graph: {0}")]
    Serialization(String),
    /// A caller-supplied argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The operation cannot run while a transaction is in progress.
    #[error("{0} is not permitted inside a transaction")]
    InTransaction(&'static str),
}
