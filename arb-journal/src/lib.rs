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

//! # Arb-Journal
//! The durability layer: a Postgres-backed record of every in-flight transaction intent, stranded
//! unfilled remainder, resting order id, and blacklisted market, so a crash or restart resumes
//! from where the engine left off instead of replanning from nothing. Deliberately opaque to the
//! shape of the domain state it persists - callers hand it `serde_json::Value` blobs keyed by id,
//! so this crate never depends on `arb-engine`.

pub mod error;
pub mod journal;

pub use error::JournalError;
pub use journal::Journal;
