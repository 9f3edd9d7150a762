#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    missing_debug_implementations,
    rust_2018_idioms
)]

//! # Arb-Amount
//! Pure, stateless 8-decimal-scale amount arithmetic. Every number that crosses a trading
//! decision in this engine is a [`rust_decimal::Decimal`] rounded with an explicit DOWN/UP
//! strategy at this crate's boundary - floating point never appears in amount math.

use arb_instrument::Side;
use derive_more::Constructor;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// All persisted/compared amounts live at this scale.
pub const SCALE: u32 = 8;

pub fn round_down(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(SCALE, RoundingStrategy::ToZero)
}

pub fn round_up(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(SCALE, RoundingStrategy::AwayFromZero)
}

/// The only persisted trade artifact. Every derived amount recomputes from this
/// deterministically - `quote_amount` is the base-currency quantity that changed hands,
/// `price` is quote-per-base, `fee_multiplier` is `1 - fee_rate`.
///
/// Two sentinel shapes exist purely to carry merge/split residue and never correspond to a real
/// exchange fill: `adjust_from` (price = 1, fee = 0) contributes only to `from_amount`;
/// `adjust_target` (price = 0, fee depending on order type) contributes only to `target_amount`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize, Constructor)]
pub struct BareTrade {
    pub quote_amount: Decimal,
    pub price: Decimal,
    pub fee_multiplier: Decimal,
}

impl BareTrade {
    /// Adjustment trade contributing `amount` to `from_amount` and nothing to `target_amount`,
    /// regardless of order type. Used to reconcile merge/split rounding residue.
    pub fn adjust_from(amount: Decimal) -> Self {
        Self::new(amount, Decimal::ONE, Decimal::ZERO)
    }

    /// Adjustment trade contributing `amount` to `target_amount` and nothing to `from_amount`.
    /// The sentinel shape differs by order type because the ordinary Buy/Sell formulas already
    /// special-case `price == 0`.
    pub fn adjust_target(amount: Decimal, order_type: Side) -> Self {
        match order_type {
            Side::Buy => Self::new(amount, Decimal::ZERO, Decimal::ONE),
            Side::Sell => Self::new(amount, Decimal::ZERO, Decimal::ZERO),
        }
    }

    fn is_adjust_from(&self) -> bool {
        self.price == Decimal::ONE && self.fee_multiplier == Decimal::ZERO
    }

    fn is_adjust_target(&self, order_type: Side) -> bool {
        self.price == Decimal::ZERO
            && match order_type {
                Side::Buy => self.fee_multiplier == Decimal::ONE,
                Side::Sell => self.fee_multiplier == Decimal::ZERO,
            }
    }

    pub fn from_amount(&self, order_type: Side) -> Decimal {
        if self.is_adjust_from() {
            return self.quote_amount;
        }
        if self.is_adjust_target(order_type) {
            return Decimal::ZERO;
        }
        match order_type {
            Side::Buy => from_amount_buy(self.quote_amount, self.price),
            Side::Sell => from_amount_sell(self.quote_amount),
        }
    }

    pub fn target_amount(&self, order_type: Side) -> Decimal {
        if self.is_adjust_from() {
            return Decimal::ZERO;
        }
        if self.is_adjust_target(order_type) {
            return self.quote_amount;
        }
        match order_type {
            Side::Buy => target_amount_buy(self.quote_amount, self.fee_multiplier),
            Side::Sell => target_amount_sell(self.quote_amount, self.price, self.fee_multiplier),
        }
    }
}

pub fn from_amount_buy(quote: Decimal, price: Decimal) -> Decimal {
    round_down(quote * price)
}

pub fn target_amount_buy(quote: Decimal, fee: Decimal) -> Decimal {
    round_up(quote * fee)
}

pub fn from_amount_sell(quote: Decimal) -> Decimal {
    quote
}

pub fn target_amount_sell(quote: Decimal, price: Decimal, fee: Decimal) -> Decimal {
    round_up(round_down(quote * price) * fee)
}

/// Inverse of [`from_amount_buy`] at `fee = 1`: the base quantity required to spend exactly
/// (up to rounding) `from_amount` at `price`.
pub fn quote_amount(from_amount: Decimal, price: Decimal) -> Decimal {
    round_down(from_amount / price)
}

/// Sum of `from_amount`/`target_amount` over a slice of trades for one step.
pub fn sum_from_amount(trades: &[BareTrade], order_type: Side) -> Decimal {
    trades.iter().map(|t| t.from_amount(order_type)).sum()
}

pub fn sum_target_amount(trades: &[BareTrade], order_type: Side) -> Decimal {
    trades.iter().map(|t| t.target_amount(order_type)).sum()
}

/// Which side of a trade `cut` is expressed in when splitting.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AmountType {
    From,
    Target,
}

/// Result of carving `cut` worth of `amount_type` off `trade`. `left` is the portion up to the
/// cut (destined for the committed/child side), `right` is everything else (stays with the
/// parent). Either side may carry a synthetic adjustment trade reconciling rounding residue so
/// that `left.from_amount + right.from_amount == trade.from_amount` exactly, and likewise for
/// `target_amount`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeSplit {
    pub left: BareTrade,
    pub left_adjustment: Option<BareTrade>,
    pub right: BareTrade,
    pub right_adjustment: Option<BareTrade>,
}

/// Split `trade` so the `left` portion's `amount_type` amount equals `cut` (clamped to
/// `[0, trade`'s amount of that type`]`), reconciling any rounding residue with at most one
/// adjustment trade total.
pub fn split_trade(trade: BareTrade, order_type: Side, amount_type: AmountType, cut: Decimal) -> TradeSplit {
    let total_from = trade.from_amount(order_type);
    let total_target = trade.target_amount(order_type);

    let left_quote = match (order_type, amount_type) {
        // From-cut on a Buy trade: invert price to find the base quantity for `cut`.
        (Side::Buy, AmountType::From) => {
            let cut = cut.clamp(Decimal::ZERO, total_from);
            if trade.price.is_zero() {
                Decimal::ZERO
            } else {
                quote_amount(cut, trade.price).min(trade.quote_amount)
            }
        }
        // From-cut on a Sell trade: from_amount IS the quote amount, no inversion needed.
        (Side::Sell, AmountType::From) => cut.clamp(Decimal::ZERO, trade.quote_amount),
        // Target-cut: proportion the quote amount by the ratio of target amounts, since neither
        // Buy's nor Sell's target formula is linearly invertible once fee rounding is involved.
        (_, AmountType::Target) => {
            let cut = cut.clamp(Decimal::ZERO, total_target);
            if total_target.is_zero() {
                Decimal::ZERO
            } else {
                round_down(trade.quote_amount * cut / total_target).min(trade.quote_amount)
            }
        }
    };

    let left = BareTrade::new(left_quote, trade.price, trade.fee_multiplier);
    let right = BareTrade::new(trade.quote_amount - left_quote, trade.price, trade.fee_multiplier);

    let from_residue = total_from - (left.from_amount(order_type) + right.from_amount(order_type));
    let target_residue =
        total_target - (left.target_amount(order_type) + right.target_amount(order_type));

    let left_adjustment = if !from_residue.is_zero() {
        Some(BareTrade::adjust_from(from_residue))
    } else if !target_residue.is_zero() {
        Some(BareTrade::adjust_target(target_residue, order_type))
    } else {
        None
    };

    TradeSplit {
        left,
        left_adjustment,
        right,
        right_adjustment: None,
    }
}

/// Carve `cut` worth of `amount_type` off the front of `trades` (in order), returning
/// `(carved, remainder)`. Used both by the split operation that peels a committed child off a
/// parent intent and (in spirit) by the Scheduler's trade attribution - both are "walk a trade
/// list consuming a target amount, splitting the trade that straddles the cut" operations over
/// the same [`split_trade`] primitive.
pub fn carve_trades(
    trades: Vec<BareTrade>,
    order_type: Side,
    amount_type: AmountType,
    cut: Decimal,
) -> (Vec<BareTrade>, Vec<BareTrade>) {
    let mut remaining_cut = cut;
    let mut carved = Vec::new();
    let mut remainder = Vec::new();

    for trade in trades {
        let amount = match amount_type {
            AmountType::From => trade.from_amount(order_type),
            AmountType::Target => trade.target_amount(order_type),
        };

        if remaining_cut.is_zero() {
            remainder.push(trade);
        } else if amount <= remaining_cut {
            remaining_cut -= amount;
            carved.push(trade);
        } else {
            let split = split_trade(trade, order_type, amount_type, remaining_cut);
            carved.push(split.left);
            if let Some(adj) = split.left_adjustment {
                carved.push(adj);
            }
            remainder.push(split.right);
            if let Some(adj) = split.right_adjustment {
                remainder.push(adj);
            }
            remaining_cut = Decimal::ZERO;
        }
    }

    (carved, remainder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn buy_amount_laws() {
        let quote = dec!(0.00555555);
        let price = dec!(9000);
        let fee = dec!(0.999);
        assert_eq!(from_amount_buy(quote, price), round_down(quote * price));
        assert_eq!(target_amount_buy(quote, fee), round_up(quote * fee));
    }

    #[test]
    fn sell_amount_laws() {
        let quote = dec!(10);
        let price = dec!(180);
        let fee = dec!(0.999);
        assert_eq!(from_amount_sell(quote), quote);
        assert_eq!(
            target_amount_sell(quote, price, fee),
            round_up(round_down(quote * price) * fee)
        );
    }

    #[test]
    fn quote_amount_round_trip_within_epsilon() {
        let x = dec!(50);
        let price = dec!(9000);
        let quote = quote_amount(x, price);
        let back = from_amount_buy(quote, price);
        assert!((x - back).abs() <= dec!(0.00000001));
    }

    #[test]
    fn adjust_from_contributes_only_to_from_amount() {
        let t = BareTrade::adjust_from(dec!(3.7));
        assert_eq!(t.from_amount(Side::Buy), dec!(3.7));
        assert_eq!(t.target_amount(Side::Buy), Decimal::ZERO);
        assert_eq!(t.from_amount(Side::Sell), dec!(3.7));
        assert_eq!(t.target_amount(Side::Sell), Decimal::ZERO);
    }

    #[test]
    fn adjust_target_contributes_only_to_target_amount() {
        let buy = BareTrade::adjust_target(dec!(2.5), Side::Buy);
        assert_eq!(buy.from_amount(Side::Buy), Decimal::ZERO);
        assert_eq!(buy.target_amount(Side::Buy), dec!(2.5));

        let sell = BareTrade::adjust_target(dec!(2.5), Side::Sell);
        assert_eq!(sell.from_amount(Side::Sell), Decimal::ZERO);
        assert_eq!(sell.target_amount(Side::Sell), dec!(2.5));
    }

    #[test]
    fn split_trade_preserves_from_amount_sum() {
        let trade = BareTrade::new(dec!(10), dec!(9000), dec!(0.999));
        let split = split_trade(trade, Side::Buy, AmountType::From, dec!(30000));

        let left_from = split.left.from_amount(Side::Buy)
            + split.left_adjustment.map_or(Decimal::ZERO, |t| t.from_amount(Side::Buy));
        let right_from = split.right.from_amount(Side::Buy)
            + split.right_adjustment.map_or(Decimal::ZERO, |t| t.from_amount(Side::Buy));

        assert_eq!(left_from + right_from, trade.from_amount(Side::Buy));
    }

    #[test]
    fn split_trade_preserves_target_amount_sum() {
        let trade = BareTrade::new(dec!(10), dec!(180), dec!(0.999));
        let split = split_trade(trade, Side::Sell, AmountType::Target, dec!(1000));

        let left_target = split.left.target_amount(Side::Sell)
            + split
                .left_adjustment
                .map_or(Decimal::ZERO, |t| t.target_amount(Side::Sell));
        let right_target = split.right.target_amount(Side::Sell)
            + split
                .right_adjustment
                .map_or(Decimal::ZERO, |t| t.target_amount(Side::Sell));

        assert_eq!(left_target + right_target, trade.target_amount(Side::Sell));
    }

    #[test]
    fn split_trade_clamps_cut_beyond_total() {
        let trade = BareTrade::new(dec!(10), dec!(9000), dec!(0.999));
        let split = split_trade(trade, Side::Buy, AmountType::From, dec!(999_999_999));
        assert_eq!(split.left.quote_amount, trade.quote_amount);
        assert_eq!(split.right.quote_amount, Decimal::ZERO);
    }

    #[test]
    fn carve_trades_splits_the_straddling_trade() {
        let trades = vec![
            BareTrade::new(dec!(5), dec!(9000), dec!(0.999)),
            BareTrade::new(dec!(5), dec!(9000), dec!(0.999)),
        ];
        let total_from: Decimal = trades.iter().map(|t| t.from_amount(Side::Buy)).sum();

        let (carved, remainder) =
            carve_trades(trades.clone(), Side::Buy, AmountType::From, dec!(50000));

        let carved_from: Decimal = carved.iter().map(|t| t.from_amount(Side::Buy)).sum();
        let remainder_from: Decimal = remainder.iter().map(|t| t.from_amount(Side::Buy)).sum();

        assert_eq!(carved_from, dec!(50000));
        assert_eq!(carved_from + remainder_from, total_from);
    }

    #[test]
    fn carve_trades_cut_of_zero_leaves_everything_in_remainder() {
        let trades = vec![BareTrade::new(dec!(5), dec!(9000), dec!(0.999))];
        let (carved, remainder) =
            carve_trades(trades, Side::Buy, AmountType::From, Decimal::ZERO);
        assert!(carved.is_empty());
        assert_eq!(remainder.len(), 1);
    }
}
