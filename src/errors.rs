//! Unified error type for the inventory and discovery engine.
//!
//! Variants fall into three groups: input errors that are rejected before storage
//! is touched, expected marketplace outcomes (stock ran out, window closed), and
//! transient infrastructure failures that the reservation coordinator may retry
//! with the same idempotency key.

use sea_orm::{DbErr, RuntimeErr};
use thiserror::Error;

/// All errors produced by the crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration could not be read or parsed
    #[error("Configuration error: {message}")]
    Config {
        /// Human-readable description
        message: String,
    },

    /// Malformed request data
    #[error("Invalid input: {message}")]
    InvalidInput {
        /// Human-readable description
        message: String,
    },

    /// Latitude or longitude outside the valid range
    #[error("Invalid coordinate: ({latitude}, {longitude})")]
    InvalidCoordinate {
        /// Offending latitude
        latitude: f64,
        /// Offending longitude
        longitude: f64,
    },

    /// Quantity must be a positive whole number of units
    #[error("Invalid quantity: {quantity}")]
    InvalidQuantity {
        /// Offending quantity
        quantity: i32,
    },

    /// Monetary amount is negative, NaN or otherwise unusable
    #[error("Invalid amount: {amount}")]
    InvalidAmount {
        /// Offending amount
        amount: f64,
    },

    /// Listing does not exist or has been archived
    #[error("Listing not found: {id}")]
    ListingNotFound {
        /// Listing id
        id: i64,
    },

    /// The listing's pickup window has closed
    #[error("Listing {id} has expired")]
    ListingExpired {
        /// Listing id
        id: i64,
    },

    /// Not enough units left to satisfy the request
    #[error("Insufficient stock: requested {requested}, remaining {remaining}")]
    InsufficientStock {
        /// Units requested
        requested: i32,
        /// Units remaining when the request was evaluated
        remaining: i32,
    },

    /// Business does not exist
    #[error("Business not found: {id}")]
    BusinessNotFound {
        /// Business id
        id: i64,
    },

    /// Reservation does not exist
    #[error("Reservation not found: {id}")]
    ReservationNotFound {
        /// Reservation id
        id: i64,
    },

    /// Requested reservation status change is not allowed
    #[error("Cannot move reservation {id} from {from} to {to}")]
    InvalidTransition {
        /// Reservation id
        id: i64,
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// Two requests raced to record the same idempotency key
    #[error("Duplicate in-flight request for idempotency key {key}")]
    DuplicateRequest {
        /// The contested key
        key: String,
    },

    /// Storage could not be reached or was busy
    #[error("Storage unavailable: {message}")]
    StorageUnavailable {
        /// Underlying error text
        message: String,
    },

    /// A storage call did not complete within the configured bound
    #[error("Storage call timed out after {millis} ms")]
    Timeout {
        /// Elapsed bound in milliseconds
        millis: u64,
    },

    /// Any other database error
    #[error("Database error: {0}")]
    Database(DbErr),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Environment variable error
    #[error("Environment variable error: {0}")]
    EnvVar(#[from] std::env::VarError),
}

impl Error {
    /// Whether the failure is an infrastructure hiccup that may be retried with the
    /// same idempotency key.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StorageUnavailable { .. } | Self::Timeout { .. } | Self::DuplicateRequest { .. }
        )
    }

    /// Whether the error was caused by the caller's input.
    #[must_use]
    pub const fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput { .. }
                | Self::InvalidCoordinate { .. }
                | Self::InvalidQuantity { .. }
                | Self::InvalidAmount { .. }
        )
    }

    /// Shorthand for building an [`Error::InvalidInput`].
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }
}

impl From<DbErr> for Error {
    fn from(err: DbErr) -> Self {
        match &err {
            DbErr::ConnectionAcquire(_) | DbErr::Conn(_) => Self::StorageUnavailable {
                message: err.to_string(),
            },
            DbErr::Exec(RuntimeErr::SqlxError(_)) | DbErr::Query(RuntimeErr::SqlxError(_))
                if is_busy_message(&err.to_string()) =>
            {
                Self::StorageUnavailable {
                    message: err.to_string(),
                }
            }
            _ => Self::Database(err),
        }
    }
}

fn is_busy_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    lowered.contains("database is locked") || lowered.contains("busy")
}

/// Convenience `Result` type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Timeout { millis: 10 }.is_transient());
        assert!(
            Error::StorageUnavailable {
                message: "down".to_string()
            }
            .is_transient()
        );
        assert!(
            !Error::InsufficientStock {
                requested: 1,
                remaining: 0
            }
            .is_transient()
        );
        assert!(!Error::ListingExpired { id: 1 }.is_transient());
    }

    #[test]
    fn test_connection_errors_become_storage_unavailable() {
        let err: Error = DbErr::Conn(RuntimeErr::Internal("refused".to_string())).into();
        assert!(matches!(err, Error::StorageUnavailable { .. }));

        let err: Error = DbErr::Custom("boom".to_string()).into();
        assert!(matches!(err, Error::Database(_)));
    }

    #[test]
    fn test_invalid_input_classification() {
        assert!(Error::invalid("bad").is_invalid_input());
        assert!(Error::InvalidQuantity { quantity: 0 }.is_invalid_input());
        assert!(!Error::ListingNotFound { id: 1 }.is_invalid_input());
    }
}
