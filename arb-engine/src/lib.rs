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

//! # Arb-Engine
//! The per-path Transaction Intent state machine, the registry that lets independent intents
//! merge instead of double-reserving the same market, the boundary trait a path enumerator
//! implementation plugs into, and the top-level trader loop that ticks, reserves balance and
//! resumes journaled intents at startup:
//! * [`market`] - the `TranIntentMarket` step variant and path-shape hashing.
//! * [`intent`] - `TransactionIntent`'s `START/INSTANT_STEP/DELAYED_STEP/NOT_PROFITABLE/UNFILLED`
//!   state machine, and the merge/split operations that keep its amount invariants.
//! * [`manager`] - `IntentManager`, the dual id/shape index used for merge lookups.
//! * [`enumerator`] - the `PathEnumerator` trait boundary and its ranking contract.
//! * [`trader`] - the top-level loop wiring balance reservation, periodic path-find ticks and
//!   crash recovery together.

pub mod enumerator;
pub mod error;
pub mod intent;
pub mod manager;
pub mod market;
pub mod trader;

pub use enumerator::{ExhaustivePath, Order, PathEnumerator};
pub use error::IntentError;
pub use intent::{IntentConfig, IntentContext, TransactionIntent};
pub use manager::IntentManager;
pub use market::TranIntentMarket;
pub use trader::{Trader, TraderConfig};
