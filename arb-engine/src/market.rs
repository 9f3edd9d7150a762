use arb_amount::{sum_from_amount, sum_target_amount, BareTrade};
use arb_instrument::{Currency, Market, Side, Speed};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One step of a path. `from_currency` is whichever leg of `market` this step spends -
/// `market.order_type(&from_currency)` derives the implied [`Side`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind")]
pub enum TranIntentMarket {
    /// Not yet reached - no amount has been committed.
    Predicted {
        market: Market,
        speed: Speed,
        from_currency: Currency,
    },
    /// Currently executing - owns a concrete input amount but no trades yet.
    PartiallyCompleted {
        market: Market,
        speed: Speed,
        from_currency: Currency,
        from_amount: Decimal,
    },
    /// Finished - `from_amount`/`target_amount` derive from `trades`.
    Completed {
        market: Market,
        speed: Speed,
        from_currency: Currency,
        trades: Vec<BareTrade>,
    },
}

impl TranIntentMarket {
    pub fn market(&self) -> &Market {
        match self {
            Self::Predicted { market, .. }
            | Self::PartiallyCompleted { market, .. }
            | Self::Completed { market, .. } => market,
        }
    }

    pub fn speed(&self) -> Speed {
        match self {
            Self::Predicted { speed, .. }
            | Self::PartiallyCompleted { speed, .. }
            | Self::Completed { speed, .. } => *speed,
        }
    }

    pub fn from_currency(&self) -> &Currency {
        match self {
            Self::Predicted { from_currency, .. }
            | Self::PartiallyCompleted { from_currency, .. }
            | Self::Completed { from_currency, .. } => from_currency,
        }
    }

    pub fn order_type(&self) -> Side {
        self.market().order_type(self.from_currency())
    }

    pub fn target_currency(&self) -> Currency {
        self.market().opposite(self.from_currency())
    }

    /// The trades backing this step, if it has reached [`Self::Completed`].
    pub fn trades(&self) -> &[BareTrade] {
        match self {
            Self::Completed { trades, .. } => trades,
            _ => &[],
        }
    }

    pub fn from_amount(&self) -> Decimal {
        match self {
            Self::Predicted { .. } => Decimal::ZERO,
            Self::PartiallyCompleted { from_amount, .. } => *from_amount,
            Self::Completed { trades, .. } => sum_from_amount(trades, self.order_type()),
        }
    }

    pub fn target_amount(&self) -> Decimal {
        match self {
            Self::Completed { trades, .. } => sum_target_amount(trades, self.order_type()),
            _ => Decimal::ZERO,
        }
    }

    pub fn into_completed(self, trades: Vec<BareTrade>) -> Self {
        match self {
            Self::Predicted { market, speed, from_currency }
            | Self::PartiallyCompleted { market, speed, from_currency, .. } => Self::Completed {
                market,
                speed,
                from_currency,
                trades,
            },
            Self::Completed { market, speed, from_currency, .. } => Self::Completed {
                market,
                speed,
                from_currency,
                trades,
            },
        }
    }

    pub fn with_from_amount(self, from_amount: Decimal) -> Self {
        match self {
            Self::Predicted { market, speed, from_currency }
            | Self::PartiallyCompleted { market, speed, from_currency, .. } => {
                Self::PartiallyCompleted { market, speed, from_currency, from_amount }
            }
            Self::Completed { market, speed, from_currency, .. } => {
                Self::PartiallyCompleted { market, speed, from_currency, from_amount }
            }
        }
    }

    pub fn push_trades(self, mut extra: Vec<BareTrade>) -> Self {
        match self {
            Self::Completed { market, speed, from_currency, mut trades } => {
                trades.append(&mut extra);
                Self::Completed { market, speed, from_currency, trades }
            }
            other => other,
        }
    }
}

/// Hash identifying a path's shape - the `(market, speed)` sequence, independent of amounts or
/// trade history. Two intents with the same shape and `marketIdx` are merge candidates.
pub fn shape_hash(markets: &[TranIntentMarket]) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = fnv::FnvHasher::default();
    for step in markets {
        step.market().hash(&mut hasher);
        step.speed().hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn usdt() -> Currency {
        Currency::new("USDT")
    }
    fn btc() -> Currency {
        Currency::new("BTC")
    }
    fn market() -> Market {
        Market::new(btc(), usdt())
    }

    #[test]
    fn completed_from_amount_sums_trades() {
        let step = TranIntentMarket::Completed {
            market: market(),
            speed: Speed::Instant,
            from_currency: usdt(),
            trades: vec![BareTrade::new(dec!(0.005), dec!(9000), dec!(0.999))],
        };
        assert_eq!(step.from_amount(), arb_amount::round_down(dec!(0.005) * dec!(9000)));
    }

    #[test]
    fn shape_hash_ignores_amounts() {
        let a = vec![TranIntentMarket::Predicted {
            market: market(),
            speed: Speed::Instant,
            from_currency: usdt(),
        }];
        let b = vec![TranIntentMarket::PartiallyCompleted {
            market: market(),
            speed: Speed::Instant,
            from_currency: usdt(),
            from_amount: dec!(100),
        }];
        assert_eq!(shape_hash(&a), shape_hash(&b));
    }
}
