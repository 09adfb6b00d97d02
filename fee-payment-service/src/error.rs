//! Error type shared by the payment engine components.

use service_core::error::AppError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("amount mismatch")]
    AmountMismatch,

    #[error("already settled")]
    AlreadySettled,

    #[error("serialization conflict")]
    SerializationConflict,

    #[error("gateway error: {message}")]
    Gateway { transient: bool, message: String },

    #[error("database error: {0}")]
    Database(anyhow::Error),
}

impl PaymentError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Whether another attempt (or a provider redelivery) may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::SerializationConflict | Self::Database(_) => true,
            Self::Gateway { transient, .. } => *transient,
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::SerializationConflict)
    }
}

/// Serialization failures and deadlocks are reported as conflicts so callers
/// can retry; everything else is a storage failure.
impl From<sqlx::Error> for PaymentError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            if matches!(db_err.code().as_deref(), Some("40001") | Some("40P01")) {
                return Self::SerializationConflict;
            }
        }
        Self::Database(anyhow::Error::new(err))
    }
}

impl From<PaymentError> for AppError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::Validation(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            PaymentError::Forbidden(msg) => AppError::Forbidden(anyhow::anyhow!(msg)),
            PaymentError::NotFound(msg) => AppError::NotFound(anyhow::anyhow!(msg)),
            PaymentError::InvalidSignature => {
                AppError::BadRequest(anyhow::anyhow!("invalid signature"))
            }
            PaymentError::AmountMismatch => AppError::BadRequest(anyhow::anyhow!("amount mismatch")),
            PaymentError::AlreadySettled => AppError::Conflict(anyhow::anyhow!("already settled")),
            PaymentError::SerializationConflict => AppError::ServiceUnavailable,
            PaymentError::Gateway { message, .. } => AppError::BadGateway(message),
            PaymentError::Database(err) => AppError::DatabaseError(err),
        }
    }
}

pub type PaymentResult<T> = Result<T, PaymentError>;
