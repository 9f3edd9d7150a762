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

//! # Arb-Integration
//! Defines the boundary the execution engine consumes from an exchange SDK:
//! `place/move/cancel/orderStatus/orderTrades`, the `orderBook`/account-notification/
//! connection-state streams, and the verbatim error taxonomy those calls can raise. Nothing in
//! this crate talks to a real exchange - it is the seam a concrete SDK adapter plugs into.

pub mod channel;
pub mod error;
pub mod exchange;

pub use error::{ConnectivityError, ExchangeApiError};
pub use exchange::ExchangeClient;
