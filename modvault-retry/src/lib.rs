//! Retry and backoff logic for modvault filesystem operations
//!
//! Renames and moves into the trash area can fail transiently: another process
//! briefly holding a handle (a sharing violation on Windows), an interrupted
//! syscall, or a busy device. This crate wraps such operations in a bounded
//! exponential backoff and classifies `io::Error`s as transient or permanent.

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Common retry error types
#[derive(Error, Debug)]
pub enum RetryError {
    #[error("Operation '{operation}' exceeded maximum retry attempts: {source}")]
    MaxRetriesExceeded {
        operation: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("Permanent error in '{operation}': {source}")]
    Permanent {
        operation: &'static str,
        #[source]
        source: io::Error,
    },
}

impl RetryError {
    /// The underlying I/O error of the last attempt
    pub fn into_source(self) -> io::Error {
        match self {
            RetryError::MaxRetriesExceeded { source, .. } => source,
            RetryError::Permanent { source, .. } => source,
        }
    }

    pub fn operation(&self) -> &'static str {
        match self {
            RetryError::MaxRetriesExceeded { operation, .. } => operation,
            RetryError::Permanent { operation, .. } => operation,
        }
    }
}

/// Result type for retry operations
pub type RetryResult<T> = std::result::Result<T, RetryError>;

/// Execute an operation with the default local filesystem backoff policy
pub fn with_backoff<F, T>(op_name: &'static str, f: F) -> RetryResult<T>
where
    F: FnMut(usize) -> io::Result<T>,
{
    with_custom_backoff(op_name, local_fs_backoff_policy(), f)
}

/// Execute an operation with a custom backoff policy
///
/// The closure receives the 1-based attempt number. Permanent errors stop
/// immediately; transient errors are retried until the policy's elapsed-time
/// budget runs out.
pub fn with_custom_backoff<F, T>(
    op_name: &'static str,
    policy: ExponentialBackoff,
    mut f: F,
) -> RetryResult<T>
where
    F: FnMut(usize) -> io::Result<T>,
{
    let mut attempt = 0usize;

    let outcome = backoff::retry(policy, || {
        attempt += 1;
        debug!("Attempting operation '{}' (attempt {})", op_name, attempt);

        f(attempt).map_err(|err| {
            if err.is_transient() {
                warn!(
                    "Operation '{}' failed on attempt {}: {}",
                    op_name, attempt, err
                );
                backoff::Error::transient(err)
            } else {
                backoff::Error::permanent(err)
            }
        })
    });

    match outcome {
        Ok(value) => {
            if attempt > 1 {
                debug!(
                    "Operation '{}' succeeded after {} attempts",
                    op_name, attempt
                );
            }
            Ok(value)
        }
        Err(backoff::Error::Permanent(source)) => {
            if source.is_transient() {
                warn!(
                    "Operation '{}' gave up after {} attempts",
                    op_name, attempt
                );
                Err(RetryError::MaxRetriesExceeded {
                    operation: op_name,
                    source,
                })
            } else {
                Err(RetryError::Permanent {
                    operation: op_name,
                    source,
                })
            }
        }
        Err(backoff::Error::Transient { err, .. }) => Err(RetryError::MaxRetriesExceeded {
            operation: op_name,
            source: err,
        }),
    }
}

/// Backoff policy for local filesystem operations (short timeouts)
pub fn local_fs_backoff_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(50))
        .with_max_interval(Duration::from_secs(1))
        .with_max_elapsed_time(Some(Duration::from_secs(5)))
        .with_multiplier(2.0)
        .build()
}

/// Trait for categorizing errors as transient or permanent
pub trait RetryableError {
    /// Returns true if the error is transient and the operation should be retried
    fn is_transient(&self) -> bool;

    /// Returns true if the error is permanent and retries should stop
    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

impl RetryableError for io::Error {
    fn is_transient(&self) -> bool {
        match self.kind() {
            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                true
            }
            // ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION
            _ if cfg!(windows) => matches!(self.raw_os_error(), Some(32) | Some(33)),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy() -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(1))
            .with_max_interval(Duration::from_millis(5))
            .with_max_elapsed_time(Some(Duration::from_millis(200)))
            .build()
    }

    #[test]
    fn test_successful_operation() {
        let result = with_custom_backoff("test_op", fast_policy(), |_attempt| Ok("success"));

        assert_eq!(result.unwrap(), "success");
    }

    #[test]
    fn test_transient_failure_then_success() {
        let mut calls = 0;

        let result = with_custom_backoff("test_op", fast_policy(), |attempt| {
            calls += 1;
            if attempt < 3 {
                Err(io::Error::new(io::ErrorKind::Interrupted, "interrupted"))
            } else {
                Ok("success")
            }
        });

        assert_eq!(result.unwrap(), "success");
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_permanent_failure_stops_immediately() {
        let mut calls = 0;

        let result: RetryResult<()> = with_custom_backoff("test_op", fast_policy(), |_attempt| {
            calls += 1;
            Err(io::Error::new(io::ErrorKind::NotFound, "gone"))
        });

        assert_eq!(calls, 1);
        match result {
            Err(RetryError::Permanent { operation, source }) => {
                assert_eq!(operation, "test_op");
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("expected permanent error, got {other:?}"),
        }
    }

    #[test]
    fn test_transient_failure_exhausts_budget() {
        let result: RetryResult<()> = with_custom_backoff("test_op", fast_policy(), |_attempt| {
            Err(io::Error::new(io::ErrorKind::TimedOut, "busy"))
        });

        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::MaxRetriesExceeded { .. }));
        assert_eq!(err.into_source().kind(), io::ErrorKind::TimedOut);
    }
}
