//! Error types for PolyDB

use thiserror::Error;

use crate::types::TxnId;

/// Result type alias using PolyDB's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for PolyDB
#[derive(Error, Debug)]
pub enum Error {
    // Transaction errors
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Deadlock detected, {0} was chosen as victim")]
    Deadlock(TxnId),

    #[error("Lock wait timeout for {0}")]
    LockTimeout(TxnId),

    #[error("Transaction already finished: {0}")]
    Finished(TxnId),
}

impl Error {
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Return a PostgreSQL-compatible SQLSTATE code for this error.
    ///
    /// Codes follow the PostgreSQL convention:
    /// <https://www.postgresql.org/docs/current/errcodes-appendix.html>
    pub fn sqlstate(&self) -> &'static str {
        match self {
            Error::Transaction(te) => match te {
                TransactionError::Deadlock(_) => "40P01",    // deadlock_detected
                TransactionError::LockTimeout(_) => "55P03", // lock_not_available
                TransactionError::Finished(_) => "25000",    // invalid_transaction_state
            },
            Error::Config(_) => "F0000",          // config_file_error
            Error::InvalidArgument(_) => "22023", // invalid_parameter_value
            Error::Internal(_) => "XX000",        // internal_error
        }
    }

    /// Whether the failed statement may be retried in a fresh transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transaction(TransactionError::Deadlock(_))
                | Error::Transaction(TransactionError::LockTimeout(_))
        )
    }
}
