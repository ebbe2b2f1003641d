use thiserror::Error;

/// Failure of a single exchange gateway call.
///
/// Callers never inspect message text; they branch on [`GatewayError::is_retryable`]
/// to decide between a bounded retry and failing safe.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("network error: {0}")]
    Network(String),

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("order rejected: {reason}")]
    Rejected { reason: String },

    #[error("order {order_id} not found")]
    NotFound { order_id: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    /// Returns true if the call may succeed when repeated.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout { .. } | Self::RateLimited { .. }
        )
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(GatewayError::Network("reset".into()).is_retryable());
        assert!(GatewayError::Timeout {
            operation: "get_position".into(),
            timeout_ms: 5000
        }
        .is_retryable());
        assert!(GatewayError::RateLimited { retry_after_ms: 100 }.is_retryable());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(!GatewayError::Rejected {
            reason: "ReduceOnly Order is rejected".into()
        }
        .is_retryable());
        assert!(!GatewayError::NotFound {
            order_id: "42".into()
        }
        .is_retryable());
        assert!(!GatewayError::InvalidRequest("qty".into()).is_retryable());
    }
}
