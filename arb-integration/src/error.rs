use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transport-level failures: disconnects, timeouts, rate limiting. Recovered by the Processor and
/// Instant Executor state machines with backoff/retry; never fatal on their own.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Error)]
pub enum ConnectivityError {
    #[error("exchange connection dropped")]
    Disconnected,

    #[error("order confirmation timed out")]
    Timeout,

    #[error("account rate limit exceeded")]
    MaxOrdersExceeded,

    #[error("socket error: {0}")]
    Socket(String),
}

/// Verbatim exchange error taxonomy consumed and matched by the Processor / Instant Executor
/// state machines. Names are kept identical to the wire contract so a concrete SDK
/// adapter can map 1:1 without a translation layer rotting out of sync.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Error)]
pub enum ExchangeApiError {
    #[error("unable to fill order")]
    UnableToFillOrder,

    #[error("transaction failed")]
    TransactionFailed,

    #[error("order already completed or does not exist")]
    OrderCompletedOrNotExist,

    #[error("invalid order number")]
    InvalidOrderNumber,

    #[error("not enough crypto")]
    NotEnoughCrypto,

    #[error("amount must be at least {0}")]
    AmountMustBeAtLeast(String),

    #[error("total must be at least {0}")]
    TotalMustBeAtLeast(String),

    #[error("rate must be less than {0}")]
    RateMustBeLessThan(String),

    #[error("unable to place post-only order")]
    UnableToPlacePostOnlyOrder,

    #[error("max orders exceeded")]
    MaxOrdersExceeded,

    #[error("internal exchange error")]
    InternalError,

    #[error("exchange under maintenance")]
    MaintenanceMode,

    #[error("market disabled")]
    MarketDisabled,

    #[error("order matching disabled")]
    OrderMatchingDisabled,

    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),
}

impl ExchangeApiError {
    /// Fatal errors propagate straight up through the Instant Executor / Processor and abort the
    /// current step. Everything else is retried with the caller's backoff.
    pub fn is_fatal_for_step(&self) -> bool {
        matches!(
            self,
            ExchangeApiError::AmountMustBeAtLeast(_)
                | ExchangeApiError::TotalMustBeAtLeast(_)
                | ExchangeApiError::RateMustBeLessThan(_)
                | ExchangeApiError::OrderMatchingDisabled
                | ExchangeApiError::MarketDisabled
        )
    }
}
