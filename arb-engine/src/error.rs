use arb_execution::error::{InstantAbortReason, ProcessorError};
use arb_instrument::Market;
use arb_integration::error::ExchangeApiError;
use arb_journal::JournalError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a Transaction Intent stopped making progress on its current step and fell through to
/// `NOT_PROFITABLE`/`UNFILLED` handling.
#[derive(Debug, Error)]
pub enum IntentError {
    #[error("not enough crypto to complete the step")]
    NotEnoughCrypto,

    #[error("expected target dropped below init amount")]
    NotProfitableDelta,

    #[error("step exceeded the profit monitor timeout")]
    NotProfitableTimeout,

    #[error("remaining amount too small to re-plan")]
    TotalTooSmall,

    #[error("market {0} disabled by the exchange")]
    MarketDisabled(Market),

    #[error("order matching disabled on {0}")]
    OrderMatchingDisabled(Market),

    #[error("instant executor aborted: {0}")]
    InstantAborted(InstantAbortReasonOwned),

    #[error("delayed-trade processor terminated: {0}")]
    ProcessorTerminated(#[from] ProcessorError),

    #[error("scheduler rejected our reservation")]
    SchedulerRejected,

    #[error("exchange rejected the step fatally: {0}")]
    Fatal(ExchangeApiError),

    #[error("no profitable path found for the remaining amount")]
    NoPathFound,

    #[error("journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("intent cancelled")]
    Cancelled,
}

/// Owned copy of [`InstantAbortReason`] so it can live inside [`IntentError`] without borrowing.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum InstantAbortReasonOwned {
    OrderBookEmpty,
    Fatal(ExchangeApiError),
}

impl std::fmt::Display for InstantAbortReasonOwned {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OrderBookEmpty => write!(f, "order book empty on the required side"),
            Self::Fatal(err) => write!(f, "exchange rejected the step fatally: {err}"),
        }
    }
}

impl From<InstantAbortReason> for InstantAbortReasonOwned {
    fn from(value: InstantAbortReason) -> Self {
        match value {
            InstantAbortReason::OrderBookEmpty => Self::OrderBookEmpty,
            InstantAbortReason::Fatal(err) => Self::Fatal(err),
        }
    }
}

/// Classify a fatal exchange error surfaced from either executor into the intent-level reason a
/// step fell through to `NOT_PROFITABLE`, so the caller can decide whether to blacklist first.
pub fn classify_fatal(market: &Market, err: &ExchangeApiError) -> IntentError {
    match err {
        ExchangeApiError::MarketDisabled => IntentError::MarketDisabled(market.clone()),
        ExchangeApiError::OrderMatchingDisabled => IntentError::OrderMatchingDisabled(market.clone()),
        ExchangeApiError::NotEnoughCrypto => IntentError::NotEnoughCrypto,
        other => IntentError::Fatal(other.clone()),
    }
}
