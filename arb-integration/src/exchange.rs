use crate::error::ExchangeApiError;
use arb_instrument::{Currency, FeeMultiplier, Market, Side};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

/// Order placement modifier.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub enum OrderKind {
    PostOnly,
    FillOrKill,
    ImmediateOrCancel,
}

/// Opaque exchange-assigned order identifier.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub struct OrderId(pub String);

/// A single fill returned by `place`, `move`, or `orderTrades`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Trade {
    pub trade_id: u64,
    pub amount: Decimal,
    pub price: Decimal,
    pub fee_multiplier: Decimal,
    /// `true` if this fill executed against the resting side (maker).
    pub taker_adjustment: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OrderResult {
    pub order_id: OrderId,
    pub trades: Vec<Trade>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MoveResult {
    pub order_id: OrderId,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub enum CancelResult {
    Ok,
    CompletedOrNotExist,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
}

/// Asks ascending by price, bids descending by price. Consumers only ever read snapshots -
/// mutating a book in place from outside the cache is forbidden.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
pub struct OrderBookAbstract {
    pub asks: BTreeMap<Decimal, Decimal>,
    pub bids: BTreeMap<Decimal, Decimal>,
}

impl OrderBookAbstract {
    /// Best (first-to-match) price/quantity on `side`, ie/ lowest ask or highest bid.
    pub fn best(&self, side: Side) -> Option<(Decimal, Decimal)> {
        match side {
            Side::Buy => self.asks.iter().next().map(|(p, q)| (*p, *q)),
            Side::Sell => self.bids.iter().next_back().map(|(p, q)| (*p, *q)),
        }
    }

    /// Iterate a side best-first: ascending for asks, descending for bids.
    pub fn levels(&self, side: Side) -> Box<dyn Iterator<Item = (Decimal, Decimal)> + '_> {
        match side {
            Side::Buy => Box::new(self.asks.iter().map(|(p, q)| (*p, *q))),
            Side::Sell => Box::new(self.bids.iter().rev().map(|(p, q)| (*p, *q))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum AccountNotification {
    Trade {
        order_id: OrderId,
        trade: Trade,
    },
    LimitOrderCreated {
        order_id: OrderId,
    },
    OrderUpdate {
        order_id: OrderId,
        new_amount: Decimal,
        kind: OrderUpdateKind,
    },
    BalanceUpdate {
        currency: Currency,
        available: Decimal,
    },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub enum OrderUpdateKind {
    Filled,
    Cancelled,
}

/// The boundary the execution engine consumes from an exchange SDK. Out of scope to
/// implement here - a concrete adapter (REST + WebSocket client) satisfies this trait against a
/// real venue; tests satisfy it with an in-memory fixture.
#[async_trait]
pub trait ExchangeClient: Send + Sync + 'static {
    async fn place(
        &self,
        market: &Market,
        side: Side,
        price: Decimal,
        quote_amount: Decimal,
        kind: OrderKind,
        client_order_id: Uuid,
    ) -> Result<OrderResult, ExchangeApiError>;

    async fn move_order(
        &self,
        order_id: &OrderId,
        new_price: Decimal,
        new_quote_amount: Option<Decimal>,
        kind: OrderKind,
        client_order_id: Uuid,
    ) -> Result<MoveResult, ExchangeApiError>;

    async fn cancel(&self, order_id: &OrderId) -> Result<CancelResult, ExchangeApiError>;

    async fn order_status(&self, order_id: &OrderId) -> Result<Option<OrderStatus>, ExchangeApiError>;

    async fn order_trades(&self, order_id: &OrderId) -> Result<Vec<Trade>, ExchangeApiError>;

    async fn order_book_stream(
        &self,
        market: &Market,
    ) -> Result<UnboundedReceiver<OrderBookAbstract>, ExchangeApiError>;

    async fn fee_stream(
        &self,
        market: &Market,
    ) -> Result<UnboundedReceiver<FeeMultiplier>, ExchangeApiError>;

    fn account_notifications(&self) -> UnboundedReceiver<AccountNotification>;

    fn connection_state(&self) -> tokio::sync::watch::Receiver<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct OrderTiming {
    pub time_exchange: DateTime<Utc>,
}
