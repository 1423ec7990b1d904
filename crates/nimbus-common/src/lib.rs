//! # Nimbus Common
//!
//! Shared plumbing for the Nimbus offline layer.
//!
//! ## Features
//!
//! - Logging configuration and subscriber setup
//! - Retry with exponential backoff for flaky fetches
//! - A small trait so error types can declare which failures are worth retrying

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat, LoggingError};
pub use retry::{retry_with_backoff, RetryConfig};

/// Classifies an error as transient.
///
/// Implemented by the error enums of the other Nimbus crates so that
/// [`retry_with_backoff`] only spends attempts on failures that might
/// succeed a moment later (connection resets, DNS hiccups), never on a
/// definitive answer such as a 404.
pub trait Retryable {
    /// Whether another attempt could plausibly succeed.
    fn is_retryable(&self) -> bool;
}

impl Retryable for std::io::Error {
    fn is_retryable(&self) -> bool {
        use std::io::ErrorKind;
        matches!(
            self.kind(),
            ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::NotConnected
                | ErrorKind::TimedOut
                | ErrorKind::Interrupted
                | ErrorKind::UnexpectedEof
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_io_error_classification() {
        assert!(io::Error::from(io::ErrorKind::ConnectionReset).is_retryable());
        assert!(io::Error::from(io::ErrorKind::TimedOut).is_retryable());
        assert!(!io::Error::from(io::ErrorKind::NotFound).is_retryable());
        assert!(!io::Error::from(io::ErrorKind::PermissionDenied).is_retryable());
    }
}
