//! Typed error surface for the crate's one fallible return type.

/// Top-level failure kind returned by every public async operation.
#[derive(Debug, thiserror::Error)]
pub enum RiscoError {
    /// The panel rejected the access code sent in `RMT=`.
    #[error("unauthorized: panel rejected the access code")]
    Unauthorized,

    /// The TCP handshake failed: connect, timeout, or refusal before auth.
    #[error("cannot connect to panel: {0}")]
    CannotConnect(String),

    /// A command failed at the protocol level (refused, timed out, or corrupted).
    #[error("operation failed: {0}")]
    Operation(#[from] OperationErrorKind),

    /// Low-level I/O failure on the socket.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sub-kinds of [`RiscoError::Operation`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum OperationErrorKind {
    /// The panel returned `N<code>` or `B<code>` in response to a command.
    #[error("panel refused command: {0}")]
    Refused(String),

    /// The response's CRC did not match the recomputed value.
    #[error("CRC mismatch on response")]
    CrcMismatch,

    /// No response arrived within the request timeout.
    #[error("request timed out")]
    Timeout,

    /// The connection was lost while the request was outstanding.
    #[error("connection lost")]
    ConnectionLost,
}

impl OperationErrorKind {
    /// Whether a caller might reasonably retry the same command.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            OperationErrorKind::CrcMismatch
                | OperationErrorKind::Timeout
                | OperationErrorKind::ConnectionLost
        )
    }
}

/// Convenience alias for the crate's one fallible return type.
pub type RiscoResult<T> = std::result::Result<T, RiscoError>;
