use crate::status::StatusCode;
use thiserror::Error;

/// Errors surfaced by the core runtime.
///
/// The enum is `Clone` because a single terminal failure may need to be
/// delivered to several waiters, e.g. every subscriber of a broadcast
/// sequence observes the same error the producer finished with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// No ready connection to the peer. The caller may retry after backoff.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// The transport is closing or closed; new streams are rejected.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    /// A waiting operation was cancelled.
    #[error("operation was cancelled")]
    Cancelled,
    /// A broadcast subscriber fell off the back of the buffer.
    #[error("subscriber is consuming the sequence too slowly")]
    ConsumingTooSlow,
    /// A broadcast write happened after the producer finished, or the
    /// producer went away without finishing.
    #[error("production has already finished")]
    ProductionAlreadyFinished,
    /// Unrecoverable transport failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// An invariant was violated; indicates a bug in the caller or the core.
    #[error("internal error: {0}")]
    Internal(String),
    /// The server facade was asked to run while already running.
    #[error("server is already running")]
    ServerAlreadyRunning,
    /// The server facade was used after being stopped.
    #[error("server is stopped")]
    ServerStopped,
}

impl Error {
    /// The status code a transport should use when surfacing this error as
    /// the terminal part of a response stream.
    pub fn code(&self) -> StatusCode {
        match self {
            Error::Unavailable(_) => StatusCode::Unavailable,
            Error::FailedPrecondition(_) => StatusCode::FailedPrecondition,
            Error::Cancelled => StatusCode::Cancelled,
            Error::ConsumingTooSlow => StatusCode::ResourceExhausted,
            Error::ProductionAlreadyFinished => StatusCode::FailedPrecondition,
            Error::Transport(_) => StatusCode::Unavailable,
            Error::Internal(_) => StatusCode::Internal,
            Error::ServerAlreadyRunning => StatusCode::FailedPrecondition,
            Error::ServerStopped => StatusCode::FailedPrecondition,
        }
    }
}
