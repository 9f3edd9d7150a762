use arb_integration::error::ExchangeApiError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why the Instant-Trade Executor gave up on a step.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Error)]
pub enum InstantAbortReason {
    #[error("order book empty on the required side")]
    OrderBookEmpty,

    #[error("exchange rejected the step fatally: {0}")]
    Fatal(ExchangeApiError),
}

/// Why a Delayed-Trade Processor worker terminated. Propagated to every path
/// currently registered with the Scheduler via `unregisterAll`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Error)]
pub enum ProcessorError {
    #[error("exchange rejected the order fatally: {0}")]
    Fatal(ExchangeApiError),

    #[error("processor shut down")]
    ShutDown,
}

/// Raised when a path tries to register/add-amount against a Scheduler entry that no longer
/// exists or whose output channel already closed.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Error)]
#[error("scheduler rejected operation for path {0}: entry absent or channel closed")]
pub struct SchedulerRejected(pub uuid::Uuid);
