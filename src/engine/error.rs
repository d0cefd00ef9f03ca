//! Engine error taxonomy.

/// Errors surfaced by the matching engine boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Shape violation: limit without price, market buy without a quote
    /// budget, non-positive amount.
    #[error("invalid order: {0}")]
    InvalidOrder(String),

    /// Locking would drive the available balance below zero.
    #[error("insufficient available {asset} balance for user {user_id}")]
    InsufficientAvailable { user_id: i64, asset: String },

    /// A settlement transfer found less locked than required. This is an
    /// invariant breach; the pair loop halts on it.
    #[error("insufficient locked {asset} balance for user {user_id}")]
    InsufficientLocked { user_id: i64, asset: String },

    /// Cancel target is not resting in the book.
    #[error("order {0} not found")]
    NotFound(i64),

    /// Cancel issued by a user that does not own the order.
    #[error("order {0} belongs to another user")]
    Forbidden(i64),

    /// Bounded command queue stayed full past the backpressure deadline.
    #[error("engine overloaded, retry later")]
    Overloaded,

    /// The pair loop has halted (fatal invariant breach) or is shutting down.
    #[error("engine unavailable")]
    Unavailable,

    /// Zero divisor in a quote-mode conversion.
    #[error("division by zero")]
    DivisionByZero,
}

/// Errors raised by the balance store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BalanceError {
    #[error("insufficient available {asset} balance for user {user_id}")]
    InsufficientAvailable { user_id: i64, asset: String },

    #[error("insufficient locked {asset} balance for user {user_id}")]
    InsufficientLocked { user_id: i64, asset: String },

    #[error("negative amount in balance operation")]
    NegativeAmount,
}

impl From<BalanceError> for EngineError {
    fn from(err: BalanceError) -> Self {
        match err {
            BalanceError::InsufficientAvailable { user_id, asset } => {
                EngineError::InsufficientAvailable { user_id, asset }
            }
            BalanceError::InsufficientLocked { user_id, asset } => {
                EngineError::InsufficientLocked { user_id, asset }
            }
            BalanceError::NegativeAmount => {
                EngineError::InvalidOrder("amount must be non-negative".to_string())
            }
        }
    }
}
