//! Error taxonomy shared across the engine
//!
//! Exchange-side failures are split by how they must be handled: network and
//! rate-limit errors are retryable, rejections fail fast, and timeouts feed
//! the order-status polling branch of the executor. Storage failures are
//! split by severity; corruption and integrity violations are fatal and
//! latch safe mode.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("network error: {0}")]
    Network(String),

    /// The request may or may not have reached the exchange. When an order
    /// acceptance id was obtained before the deadline it is carried here so
    /// the caller can poll for the order's fate.
    #[error("request timed out (order_id: {order_id:?})")]
    Timeout { order_id: Option<String> },

    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Exchange-side rejection (bad parameters, unknown market, ...)
    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("insufficient balance: required {required:.0} {currency}, available {available:.0}")]
    InsufficientBalance {
        currency: String,
        required: f64,
        available: f64,
    },

    #[error("order amount {amount} below minimum {min} for {symbol}")]
    BelowMinAmount {
        symbol: String,
        amount: f64,
        min: f64,
    },

    #[error("order amount {amount} above maximum {max} for {symbol}")]
    AboveMaxAmount {
        symbol: String,
        amount: f64,
        max: f64,
    },

    #[error("estimated order cost {cost:.0} exceeds ceiling {ceiling:.0}")]
    CostCeilingExceeded { cost: f64, ceiling: f64 },
}

impl ExchangeError {
    /// Errors safe to retry blindly. Timeouts are excluded: for order
    /// placement a blind retry risks a duplicate fill, so the retry policy
    /// decides per call site whether timeouts qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExchangeError::Network(_) | ExchangeError::RateLimited(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ExchangeError::Timeout { .. })
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    /// Busy/locked database; the caller may retry its own operation once
    #[error("transient storage error: {0}")]
    Transient(String),

    /// On-disk corruption; fatal, operator must intervene
    #[error("storage corruption: {0}")]
    Corrupt(String),

    /// Constraint violation; fatal, indicates a logic bug
    #[error("storage integrity violation: {0}")]
    Integrity(String),
}

impl StorageError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StorageError::Corrupt(_) | StorageError::Integrity(_))
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode::*;
        match &err {
            rusqlite::Error::SqliteFailure(e, _) => match e.code {
                DatabaseBusy | DatabaseLocked => StorageError::Transient(err.to_string()),
                DatabaseCorrupt | NotADatabase => StorageError::Corrupt(err.to_string()),
                ConstraintViolation => StorageError::Integrity(err.to_string()),
                _ => StorageError::Transient(err.to_string()),
            },
            _ => StorageError::Transient(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Integrity(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability() {
        assert!(ExchangeError::Network("reset".into()).is_retryable());
        assert!(ExchangeError::RateLimited("429".into()).is_retryable());
        assert!(!ExchangeError::Rejected("bad params".into()).is_retryable());
        assert!(!ExchangeError::Timeout { order_id: None }.is_retryable());
        assert!(ExchangeError::Timeout { order_id: None }.is_timeout());
    }

    #[test]
    fn test_storage_fatality() {
        assert!(!StorageError::Transient("busy".into()).is_fatal());
        assert!(StorageError::Corrupt("bad page".into()).is_fatal());
        assert!(StorageError::Integrity("unique".into()).is_fatal());
    }
}
