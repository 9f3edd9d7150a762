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

//! # Arb-Instrument
//! Core `Market`, `Currency`, `Side` and `FeeMultiplier` data structures shared by every crate in
//! the arbitrage execution engine. Deliberately tiny and dependency-light - every other crate
//! builds on these primitives without pulling in execution or persistence concerns.

use derive_more::{Constructor, Display, From};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt::{Display, Formatter};

/// Order side implied by the direction a [`Market`] is traversed in a path.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Display for Side {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        })
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            other => Err(format!("unrecognised side: {other}")),
        }
    }
}

/// A currency identifier (eg/ "USDT", "BTC").
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display, From,
)]
pub struct Currency(pub SmolStr);

impl Currency {
    pub fn new<S: AsRef<str>>(name: S) -> Self {
        Self(SmolStr::new(name.as_ref().to_uppercase()))
    }
}

/// Ordered base/quote pair identifying an exchange trading symbol.
///
/// Price is always expressed as quote-per-one-base. [`Market::order_type`] derives which [`Side`]
/// is implied when an intent step wants to spend `from_currency`.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Constructor)]
pub struct Market {
    pub base: Currency,
    pub quote: Currency,
}

impl Market {
    /// Buying `quote` (spending `base`) = [`Side::Buy`]; selling `quote` (spending `quote`, ie/
    /// receiving `base`) = [`Side::Sell`].
    ///
    /// Panics if `from_currency` is neither side of the market - callers only ever invoke this
    /// with a currency already known to be one leg of the pair.
    pub fn order_type(&self, from_currency: &Currency) -> Side {
        if *from_currency == self.base {
            Side::Sell
        } else if *from_currency == self.quote {
            Side::Buy
        } else {
            panic!("currency {from_currency} is not part of market {self}");
        }
    }

    /// The currency obtained by spending `from_currency` on this market.
    pub fn opposite(&self, from_currency: &Currency) -> Currency {
        if *from_currency == self.base {
            self.quote.clone()
        } else if *from_currency == self.quote {
            self.base.clone()
        } else {
            panic!("currency {from_currency} is not part of market {self}");
        }
    }
}

impl Display for Market {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.base, self.quote)
    }
}

/// Execution speed of a path step.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
pub enum Speed {
    Instant,
    Delayed,
}

/// Maker/taker fee multipliers, each `1 - fee_rate` at 8 decimal scale.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize, Constructor)]
pub struct FeeMultiplier {
    pub maker: Decimal,
    pub taker: Decimal,
}

impl FeeMultiplier {
    pub fn for_order_kind(&self, is_maker: bool) -> Decimal {
        if is_maker { self.maker } else { self.taker }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market() -> Market {
        Market::new(Currency::new("btc"), Currency::new("usdt"))
    }

    #[test]
    fn order_type_buy_when_spending_quote() {
        assert_eq!(market().order_type(&Currency::new("USDT")), Side::Buy);
    }

    #[test]
    fn order_type_sell_when_spending_base() {
        assert_eq!(market().order_type(&Currency::new("BTC")), Side::Sell);
    }

    #[test]
    #[should_panic]
    fn order_type_panics_for_unrelated_currency() {
        market().order_type(&Currency::new("ETH"));
    }

    #[test]
    fn display_matches_base_quote_convention() {
        assert_eq!(market().to_string(), "BTC_USDT");
    }

    #[test]
    fn side_from_str_round_trips_display() {
        assert_eq!("buy".parse::<Side>().unwrap(), Side::Buy);
        assert_eq!("sell".parse::<Side>().unwrap(), Side::Sell);
        assert!("hold".parse::<Side>().is_err());
    }
}
