use arb_engine::enumerator::{ExhaustivePath, PathEnumerator};
use arb_engine::trader::BalanceSource;
use arb_instrument::{Currency, FeeMultiplier, Market, Side};
use arb_integration::{
    error::ExchangeApiError,
    exchange::{
        AccountNotification, CancelResult, ExchangeClient, MoveResult, OrderBookAbstract,
        OrderId, OrderKind, OrderResult, OrderStatus, Trade,
    },
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// In-memory [`ExchangeClient`] that fills every order against a fixed top-of-book price and
/// never rejects a request. Stands in for a real venue adapter the way
/// `barter-execution`'s `simulated` module stands in for a live exchange - wire a concrete SDK
/// client in its place before trading for real.
pub struct SimulatedExchangeClient {
    mid_price: Mutex<HashMap<Market, Decimal>>,
    connection_state: watch::Sender<bool>,
}

impl SimulatedExchangeClient {
    pub fn new() -> Arc<Self> {
        let (tx, _rx) = watch::channel(true);
        Arc::new(Self { mid_price: Mutex::new(HashMap::new()), connection_state: tx })
    }

    pub fn set_price(&self, market: Market, price: Decimal) {
        self.mid_price.lock().insert(market, price);
    }

    fn price_for(&self, market: &Market) -> Decimal {
        self.mid_price.lock().get(market).copied().unwrap_or(Decimal::ONE)
    }
}

#[async_trait]
impl ExchangeClient for SimulatedExchangeClient {
    async fn place(
        &self,
        _market: &Market,
        _side: Side,
        price: Decimal,
        quote_amount: Decimal,
        _kind: OrderKind,
        _client_order_id: Uuid,
    ) -> Result<OrderResult, ExchangeApiError> {
        Ok(OrderResult {
            order_id: OrderId(Uuid::new_v4().to_string()),
            trades: vec![Trade {
                trade_id: 0,
                amount: quote_amount,
                price,
                fee_multiplier: Decimal::new(1, 3),
                taker_adjustment: false,
            }],
        })
    }

    async fn move_order(
        &self,
        order_id: &OrderId,
        _new_price: Decimal,
        _new_quote_amount: Option<Decimal>,
        _kind: OrderKind,
        _client_order_id: Uuid,
    ) -> Result<MoveResult, ExchangeApiError> {
        Ok(MoveResult { order_id: order_id.clone() })
    }

    async fn cancel(&self, _order_id: &OrderId) -> Result<CancelResult, ExchangeApiError> {
        Ok(CancelResult::CompletedOrNotExist)
    }

    async fn order_status(&self, _order_id: &OrderId) -> Result<Option<OrderStatus>, ExchangeApiError> {
        Ok(Some(OrderStatus::Filled))
    }

    async fn order_trades(&self, _order_id: &OrderId) -> Result<Vec<Trade>, ExchangeApiError> {
        Ok(Vec::new())
    }

    async fn order_book_stream(
        &self,
        market: &Market,
    ) -> Result<mpsc::UnboundedReceiver<OrderBookAbstract>, ExchangeApiError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let price = self.price_for(market);
        let mut book = OrderBookAbstract::default();
        book.asks.insert(price, Decimal::ONE);
        book.bids.insert(price, Decimal::ONE);
        let _ = tx.send(book);
        Ok(rx)
    }

    async fn fee_stream(
        &self,
        _market: &Market,
    ) -> Result<mpsc::UnboundedReceiver<FeeMultiplier>, ExchangeApiError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(FeeMultiplier { maker: Decimal::new(1, 3), taker: Decimal::new(1, 3) });
        Ok(rx)
    }

    fn account_notifications(&self) -> mpsc::UnboundedReceiver<AccountNotification> {
        let (_tx, rx) = mpsc::unbounded_channel();
        rx
    }

    fn connection_state(&self) -> watch::Receiver<bool> {
        self.connection_state.subscribe()
    }
}

/// [`PathEnumerator`] that never finds a path. A real implementation crawls the
/// [`arb_execution::book::OrderBookCache`] for every tradeable market and ranks candidate chains
/// by expected profit; this placeholder keeps the trader loop idle until one is wired in.
pub struct NullPathEnumerator;

#[async_trait]
impl PathEnumerator for NullPathEnumerator {
    async fn enumerate(
        &self,
        _from_currency: &Currency,
        _from_amount: Decimal,
        _end_currencies: &[Currency],
        _in_flight: &[u64],
    ) -> Vec<ExhaustivePath> {
        Vec::new()
    }
}

/// [`BalanceSource`] reporting a fixed balance per currency, configured up front. A real
/// implementation polls the exchange's balance endpoint and applies `BalanceUpdate`
/// notifications on top of the last snapshot.
pub struct FixedBalanceSource {
    balances: HashMap<Currency, Decimal>,
}

impl FixedBalanceSource {
    pub fn new(balances: HashMap<Currency, Decimal>) -> Arc<Self> {
        Arc::new(Self { balances })
    }
}

#[async_trait]
impl BalanceSource for FixedBalanceSource {
    async fn available(&self, currency: &Currency) -> Decimal {
        self.balances.get(currency).copied().unwrap_or(Decimal::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn simulated_exchange_fills_every_place_request() {
        let client = SimulatedExchangeClient::new();
        let market = Market::new(Currency::new("BTC"), Currency::new("USDT"));
        client.set_price(market.clone(), dec!(50000));

        let result = client
            .place(&market, Side::Buy, dec!(50000), dec!(100), OrderKind::FillOrKill, Uuid::new_v4())
            .await
            .unwrap();

        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].price, dec!(50000));
    }

    #[tokio::test]
    async fn fixed_balance_source_reports_configured_amount() {
        let mut balances = HashMap::new();
        balances.insert(Currency::new("USDT"), dec!(1000));
        let source = FixedBalanceSource::new(balances);

        assert_eq!(source.available(&Currency::new("USDT")).await, dec!(1000));
        assert_eq!(source.available(&Currency::new("BTC")).await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn null_path_enumerator_never_finds_a_path() {
        let enumerator = NullPathEnumerator;
        let paths = enumerator
            .enumerate(&Currency::new("USDT"), dec!(100), &[Currency::new("USDT")], &[])
            .await;
        assert!(paths.is_empty());
    }
}
