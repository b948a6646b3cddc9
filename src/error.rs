//! Error taxonomy shared by the engine, the correlation queues and the
//! transport capability.

use thiserror::Error;

/// Convenience alias used throughout the library.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong between a caller and the peripheral.
///
/// The type is `Clone` because a single triggering error (for example a link
/// loss) is fanned out to every waiter flushed by a lifecycle reset.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// No transport is attached, or the link is down.
    #[error("device is not ready")]
    NotReady,
    /// A required characteristic was never resolved during discovery.
    #[error("characteristic not found: {0}")]
    CharacteristicNotFound(String),
    /// Local validation failed; nothing was sent to the device.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// The firmware answered `fail:<reason>`.
    #[error("command failed: {0}")]
    CommandFailed(String),
    /// Protocol discipline was violated, e.g. overlapping awaited commands.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    /// A payload could not be decoded.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    /// No response arrived within the configured window.
    #[error("timed out waiting for a response")]
    Timeout,
    /// The underlying transport reported a write or read failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// The engine task has shut down.
    #[error("engine stopped")]
    EngineStopped,
}

impl From<btleplug::Error> for Error {
    fn from(e: btleplug::Error) -> Self {
        Error::Transport(e.to_string())
    }
}
