use docdb_core::status::Status;

/// Errors surfaced on an operation's awaiter or synchronously by
/// [`crate::executor::BulkExecutor::add`].
///
/// Per-operation business failures (conflict, precondition, not-found and the
/// like) are not errors at this level: they arrive as an
/// [`crate::operation::OperationResult`] carrying the failing status, exactly
/// as the server reported it.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// Unsupported options or malformed inputs, rejected before dispatch.
    #[error("invalid usage: {0}")]
    InvalidUsage(String),

    /// The caller cancelled, or the executor was disposed while the
    /// operation was still in flight.
    #[error("operation cancelled")]
    Cancelled,

    /// The batch exchange violated the protocol (result count mismatch,
    /// unparsable response body). Never retried.
    #[error("batch protocol violation: {0}")]
    Protocol(String),

    /// The whole batch request failed at the transport layer.
    #[error(transparent)]
    Transport(#[from] Status),
}
