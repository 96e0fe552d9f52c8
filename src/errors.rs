use thiserror::Error;

/// Rejection taxonomy of the engine. Every variant surfaces as a clean
/// rejection: validation and reservation failures abort before any state
/// mutation, so a caller never observes a partially applied submission.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unknown symbol")]
    UnknownSymbol,

    #[error("order not found or closed")]
    UnknownOrder,

    #[error("unknown user")]
    UnknownUser,

    /// The limit order would execute immediately; the caller is expected to
    /// resubmit it as a market order.
    #[error("limit order would cross the book; submit a market order instead")]
    CrossesBook,

    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("insufficient shares in circulation")]
    InsufficientShares,

    #[error("no matching liquidity")]
    NoLiquidity,

    #[error("symbol has resting orders or open positions")]
    SymbolInUse,

    #[error("cannot delete the last remaining manager")]
    LastManager,

    #[error("permission denied")]
    PermissionDenied,

    #[error("internal invariant failure: {0}")]
    Internal(String),
}

impl ExchangeError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        ExchangeError::InvalidInput(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ExchangeError::Internal(msg.into())
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;
