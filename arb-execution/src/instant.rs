use crate::error::InstantAbortReason;
use arb_amount::{quote_amount, round_down, BareTrade};
use arb_instrument::{FeeMultiplier, Market, Side};
use arb_integration::{
    error::ExchangeApiError,
    exchange::{ExchangeClient, OrderBookAbstract, OrderKind},
};
use rust_decimal::Decimal;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default retry limit for `NotEnoughCrypto` (spec §4.4: "retry up to 3x, then abort"). Everything
/// else either retries forever with its own fixed backoff or aborts immediately as fatal.
pub const DEFAULT_NOT_ENOUGH_CRYPTO_RETRY_LIMIT: u32 = 3;

fn backoff_for(err: &ExchangeApiError) -> Option<Duration> {
    match err {
        ExchangeApiError::UnableToFillOrder => Some(Duration::from_millis(100)),
        ExchangeApiError::TransactionFailed => Some(Duration::from_millis(500)),
        ExchangeApiError::MaxOrdersExceeded => Some(Duration::from_millis(1500)),
        ExchangeApiError::Connectivity(_) => Some(Duration::from_millis(2000)),
        _ => None,
    }
}

/// Fill-or-kill taker execution for `Instant`-speed path steps.
pub struct InstantTradeExecutor<C> {
    client: std::sync::Arc<C>,
    not_enough_crypto_retry_limit: u32,
}

impl<C> InstantTradeExecutor<C>
where
    C: ExchangeClient,
{
    pub fn new(client: std::sync::Arc<C>) -> Self {
        Self::with_retry_limits(client, DEFAULT_NOT_ENOUGH_CRYPTO_RETRY_LIMIT)
    }

    /// As [`Self::new`], but with the `instant_retry_limits.not_enough_crypto` value from
    /// configuration rather than the spec's default of 3.
    pub fn with_retry_limits(client: std::sync::Arc<C>, not_enough_crypto_retry_limit: u32) -> Self {
        Self { client, not_enough_crypto_retry_limit }
    }

    /// Attempt to fully consume `from_amount` against `market`'s current top-of-book for `side`.
    /// Returns `Ok(None)` only when a fatal error aborted the very first attempt with zero trades
    /// produced.
    pub async fn execute(
        &self,
        market: &Market,
        side: Side,
        from_amount: Decimal,
        taker_fee: FeeMultiplier,
        book: impl Fn() -> OrderBookAbstract,
    ) -> Result<Option<Vec<BareTrade>>, InstantAbortReason> {
        let mut collected = Vec::new();
        let mut remaining = from_amount;
        let mut not_enough_crypto_retries = 0u32;

        loop {
            if remaining.is_zero() {
                return Ok(Some(collected));
            }

            let current_book = book();
            let Some((limit_price, quote_qty)) =
                simulate_fill(&current_book, side, remaining)
            else {
                if collected.is_empty() {
                    return Err(InstantAbortReason::OrderBookEmpty);
                }
                return Ok(Some(collected));
            };

            match self
                .client
                .place(
                    market,
                    side,
                    limit_price,
                    quote_qty,
                    OrderKind::FillOrKill,
                    Uuid::new_v4(),
                )
                .await
            {
                Ok(result) => {
                    not_enough_crypto_retries = 0;
                    for trade in result.trades {
                        let fee = if trade.fee_multiplier != taker_fee.taker {
                            warn!(
                                observed = %trade.fee_multiplier,
                                canonical = %taker_fee.taker,
                                "observed taker fee diverges from canonical, using canonical (known exchange rounding bugs)"
                            );
                            taker_fee.taker
                        } else {
                            trade.fee_multiplier
                        };
                        let bare = BareTrade::new(trade.amount, trade.price, fee);
                        remaining -= bare.from_amount(side);
                        collected.push(bare);
                    }
                }
                Err(ExchangeApiError::NotEnoughCrypto) => {
                    not_enough_crypto_retries += 1;
                    if not_enough_crypto_retries > self.not_enough_crypto_retry_limit {
                        if collected.is_empty() {
                            return Err(InstantAbortReason::Fatal(ExchangeApiError::NotEnoughCrypto));
                        }
                        return Ok(Some(collected));
                    }
                    debug!(attempt = not_enough_crypto_retries, "retrying after NotEnoughCrypto");
                }
                Err(err) if err.is_fatal_for_step() => {
                    if collected.is_empty() {
                        return Err(InstantAbortReason::Fatal(err));
                    }
                    return Ok(Some(collected));
                }
                Err(err) => {
                    let delay = backoff_for(&err).unwrap_or(Duration::from_millis(2000));
                    debug!(?err, delay_ms = delay.as_millis() as u64, "retrying instant step");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Simulate consuming `from_amount` against the top of `book` on `side`, returning the limit
/// price and base quantity of the fill-or-kill order that would exhaust it.
fn simulate_fill(book: &OrderBookAbstract, side: Side, from_amount: Decimal) -> Option<(Decimal, Decimal)> {
    let mut remaining = from_amount;
    let mut last_price = Decimal::ZERO;
    let mut quantity = Decimal::ZERO;
    let mut touched = false;

    for (price, size) in book.levels(side) {
        touched = true;
        last_price = price;
        let level_from = match side {
            Side::Buy => round_down(size * price),
            Side::Sell => size,
        };

        if level_from >= remaining {
            let needed_quote = match side {
                Side::Buy => quote_amount(remaining, price),
                Side::Sell => remaining,
            };
            quantity += needed_quote;
            remaining = Decimal::ZERO;
            break;
        } else {
            quantity += size;
            remaining -= level_from;
        }
    }

    if !touched {
        return None;
    }

    Some((last_price, quantity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn book_with_ask(price: Decimal, size: Decimal) -> OrderBookAbstract {
        let mut asks = BTreeMap::new();
        asks.insert(price, size);
        OrderBookAbstract {
            asks,
            bids: BTreeMap::new(),
        }
    }

    #[test]
    fn simulate_fill_buy_computes_last_price_and_quantity() {
        let book = book_with_ask(dec!(9000), dec!(1));
        let (price, qty) = simulate_fill(&book, Side::Buy, dec!(50)).unwrap();
        assert_eq!(price, dec!(9000));
        assert_eq!(qty, quote_amount(dec!(50), dec!(9000)));
    }

    #[test]
    fn simulate_fill_empty_book_returns_none() {
        let book = OrderBookAbstract::default();
        assert!(simulate_fill(&book, Side::Buy, dec!(50)).is_none());
    }
}
