//! Custom error types for the bench.
//!
//! This module defines the primary error type, `BenchError`, used across the crate.
//! Using the `thiserror` crate, it gives every layer (session, executor, servo,
//! phase functions, orchestrator) one consistent way to report failures.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment` while loading the bench configuration.
//! - **`Configuration`**: Semantic errors in configuration or call arguments that parse
//!   fine but are logically wrong (e.g. `max_iterations = 0`).
//! - **`Communication`**: A transport failure while writing a command or reading a reply.
//!   Carries the command text that failed. Never retried locally, since commands such as
//!   "start DPD capture" are not idempotent.
//! - **`OperationTimeout`**: The operation-complete bit was not observed within the
//!   configured bound. Distinct from `Communication`: the link is fine, the instrument
//!   never finished.
//! - **`InvalidReading`**: A numeric reply that a control loop cannot work with. Plain
//!   measurement reads do not use this; they substitute NaN instead.
//! - **`ShutdownFailed`**: One or more sessions failed to close cleanly.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the bench error type.
pub type AppResult<T> = std::result::Result<T, BenchError>;

#[derive(Error, Debug)]
pub enum BenchError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Instrument communication failed for '{command}': {source}")]
    Communication {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Operation '{command}' did not complete within {waited:?}")]
    OperationTimeout { command: String, waited: Duration },

    #[error("Invalid reading '{reply}' for '{command}'")]
    InvalidReading { command: String, reply: String },

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<BenchError>),
}

impl BenchError {
    /// Build a `Communication` error for the given command.
    pub fn communication(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::Communication {
            command: command.into(),
            source,
        }
    }

    /// The command text associated with this error, if any.
    pub fn command(&self) -> Option<&str> {
        match self {
            Self::Communication { command, .. }
            | Self::OperationTimeout { command, .. }
            | Self::InvalidReading { command, .. } => Some(command),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BenchError::communication(
            "CONF:DPD:UPD",
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "link down"),
        );
        assert_eq!(
            err.to_string(),
            "Instrument communication failed for 'CONF:DPD:UPD': link down"
        );
        assert_eq!(err.command(), Some("CONF:DPD:UPD"));
    }

    #[test]
    fn test_timeout_is_distinct_from_communication() {
        let err = BenchError::OperationTimeout {
            command: "CONF:DDPD:STAR".into(),
            waited: Duration::from_secs(2),
        };
        assert!(err.to_string().contains("did not complete"));
        assert!(!matches!(err, BenchError::Communication { .. }));
    }

    #[test]
    fn test_shutdown_failed_error() {
        let err = BenchError::ShutdownFailed(vec![
            BenchError::Configuration("sensor".into()),
            BenchError::communication(
                "close",
                std::io::Error::new(std::io::ErrorKind::Other, "reset by peer"),
            ),
        ]);
        assert!(err.to_string().contains("Shutdown failed"));
        assert_eq!(err.command(), None);
    }
}
