//! Error types for xorlink sessions.

use thiserror::Error;

/// Failure to establish the per-connection shared secret.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyAgreementError {
    /// Prime generation found no candidate in the requested range.
    #[error("no prime numbers in range [{lower}, {upper})")]
    NoPrimeInRange { lower: u32, upper: u32 },

    /// The peer announced a modulus that cannot be used for arithmetic.
    #[error("unusable modulus: {0}")]
    InvalidModulus(u16),
}

/// Anything that ends a session.
///
/// Resource errors (an upload destination that cannot be opened) and
/// unrecognized command tokens are handled inside the session loop and
/// never surface here.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A send or receive on the underlying connection failed.
    #[error("transport error: {0:#}")]
    Transport(#[source] anyhow::Error),

    /// The peer closed the connection before a fixed-size field was
    /// completely received.
    #[error("connection closed after {received} of {expected} bytes")]
    ConnectionClosed { expected: usize, received: usize },

    /// Key agreement could not produce a usable secret.
    #[error("handshake failed: {0}")]
    Handshake(#[from] KeyAgreementError),

    /// No I/O progress within the configured idle timeout.
    #[error("timed out waiting for peer")]
    Timeout,

    /// The session was cancelled by the engine (shutdown).
    #[error("session cancelled")]
    Cancelled,

    /// Opening the local file to upload failed. Nothing was sent.
    #[error("file error: {0}")]
    File(#[source] std::io::Error),

    /// The upload source ran dry or failed after the header went out. The
    /// write half has been shut down, so the session is over.
    #[error("upload aborted after {sent} of {declared} bytes: {reason}")]
    UploadAborted {
        sent: u64,
        declared: u64,
        reason: String,
    },
}

impl SessionError {
    /// Maps a connection-level error, recovering a typed [`SessionError`]
    /// when one was wrapped (timeouts, cancellation).
    #[must_use]
    pub fn from_transport(err: anyhow::Error) -> Self {
        match err.downcast::<SessionError>() {
            Ok(typed) => typed,
            Err(other) => Self::Transport(other),
        }
    }
}

impl SessionError {
    /// Returns `true` when the peer simply went away, as opposed to a
    /// genuine failure worth a warning.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::ConnectionClosed { received: 0, .. })
    }
}
