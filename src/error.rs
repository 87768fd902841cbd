use thiserror::Error;

/// Errors delivered to operation results or returned from the public API.
#[derive(Debug, Error)]
pub enum Error {
    /// The server returned a non-success status for this operation.
    #[error("server error: {0}")]
    Remote(String),

    /// The connection was lost while an operation with possible server
    /// side-effects was executing. The write may or may not have happened.
    #[error("connection to server lost")]
    Disconnect,

    /// The user-supplied put builder reported failure.
    #[error("put builder failed: {0}")]
    Builder(String),

    /// A required field was absent from the server type, or a value could
    /// not be converted to the field's type.
    #[error("conversion failed: {0}")]
    Conversion(String),

    /// API misuse: invalid builder combination, reentrant worker call,
    /// operation on a closed context.
    #[error("logic error: {0}")]
    Logic(String),

    /// Malformed or state-inconsistent message from the peer. The
    /// connection carrying it is torn down.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The operation was cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn logic(msg: impl Into<String>) -> Error {
        Error::Logic(msg.into())
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Error {
        Error::Protocol(msg.into())
    }
}
