#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    clippy::unused_self,
    missing_debug_implementations,
    rust_2018_idioms
)]
#![allow(clippy::too_many_arguments)]

//! # Arb-Execution
//! The order-book cache, trade scheduler, and fast/slow trade executors a single path step
//! drives to turn a reserved `from` amount into filled trades:
//! * [`book`] - one lazily-multiplexed `watch` view per market, shared across every step
//!   currently trading it.
//! * [`scheduler`] - pools concurrent steps on the same `(market, side)` behind one resting
//!   order and attributes each fill back to whichever step reserved it.
//! * [`instant`] - fill-or-kill taker execution for `Instant`-speed steps.
//! * [`processor`] / [`manager`] - the post-only maker state machine for `Delayed`-speed steps,
//!   and the registry that lazily spawns/tears down one worker per `(market, side)`.

pub mod book;
pub mod error;
pub mod instant;
pub mod manager;
pub mod processor;
pub mod scheduler;

pub use book::OrderBookCache;
pub use instant::InstantTradeExecutor;
pub use manager::{DelayedTradeManager, PauseGuard};
pub use processor::DelayedTradeProcessor;
pub use scheduler::TradeScheduler;
