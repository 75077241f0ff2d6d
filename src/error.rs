//! Error types for the Medley worker subsystem.
//!
//! This module defines the `MedleyError` enum covering error conditions that
//! can occur while spawning the worker process, speaking the wire protocol,
//! and waiting on task outcomes. Task-level failures that travel over the
//! wire are a separate type, [`crate::protocol::TaskFailure`]; they surface
//! here as the [`MedleyError::Task`] variant when a handle is awaited.
use thiserror::Error;

use crate::protocol::TaskFailure;

/// Represents all possible errors in the worker subsystem.
///
/// # Examples
///
/// ```rust
/// use medley_worker::error::{MedleyError, MedleyResult};
///
/// fn example() -> MedleyResult<()> {
///     Err(MedleyError::config("thread_count must be greater than 0"))
/// }
/// ```
#[derive(Error, Debug)]
pub enum MedleyError {
    /// I/O operation failed (socket setup, frame transfer, file access).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error due to invalid settings.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error
        message: String,
    },

    /// Wire protocol violation: a frame that cannot be decoded, an oversized
    /// frame, or an unexpected message for the current state.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Detailed description of the protocol violation
        message: String,
    },

    /// The worker process could not be spawned or never connected back.
    #[error("Worker spawn error: {message}")]
    Spawn {
        /// Description of the spawn failure
        message: String,
    },

    /// The task was accepted but failed in the worker; carries the portable
    /// failure form reported over the wire.
    #[error("Task failed: {0}")]
    Task(#[from] TaskFailure),

    /// The service was shut down before the task produced an outcome.
    #[error("Worker service stopped")]
    ServiceStopped,

    /// Catch-all error variant wrapping any other failure.
    #[error("Unknown error: {0}")]
    Other(#[from] anyhow::Error),
}

// Decode failures terminate the channel, so they are protocol errors.
impl From<serde_json::Error> for MedleyError {
    fn from(err: serde_json::Error) -> Self {
        MedleyError::Protocol {
            message: format!("frame serialization error: {}", err),
        }
    }
}

/// Specialized `Result` type for worker-subsystem operations.
pub type MedleyResult<T> = Result<T, MedleyError>;

impl MedleyError {
    /// Create a configuration error with the given message.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use medley_worker::error::MedleyError;
    /// let err = MedleyError::config("invalid setting");
    /// assert_eq!(err.to_string(), "Configuration error: invalid setting");
    /// ```
    pub fn config<S: Into<String>>(message: S) -> Self {
        MedleyError::Config {
            message: message.into(),
        }
    }

    /// Create a protocol error with the given message.
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        MedleyError::Protocol {
            message: message.into(),
        }
    }

    /// Create a spawn error with the given message.
    pub fn spawn<S: Into<String>>(message: S) -> Self {
        MedleyError::Spawn {
            message: message.into(),
        }
    }
}

// Unit test: MedleyError error types and helper methods
#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_error_creation() {
        let error = MedleyError::config("test config error");
        assert!(matches!(error, MedleyError::Config { .. }));
        assert_eq!(error.to_string(), "Configuration error: test config error");
    }

    #[test]
    fn test_protocol_error_creation() {
        let error = MedleyError::protocol("bad frame");
        assert!(matches!(error, MedleyError::Protocol { .. }));
        assert_eq!(error.to_string(), "Protocol error: bad frame");
    }

    #[test]
    fn test_spawn_error_creation() {
        let error = MedleyError::spawn("worker binary missing");
        assert!(matches!(error, MedleyError::Spawn { .. }));
        assert!(error.to_string().contains("worker binary missing"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "socket not found");
        let medley_error: MedleyError = io_error.into();
        assert!(matches!(medley_error, MedleyError::Io(_)));
    }

    #[test]
    fn test_serde_error_becomes_protocol_error() {
        let bad = serde_json::from_slice::<u32>(b"not json");
        let err: MedleyError = bad.unwrap_err().into();
        assert!(matches!(err, MedleyError::Protocol { .. }));
    }
}
