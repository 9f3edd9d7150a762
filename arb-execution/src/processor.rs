use crate::{
    error::ProcessorError,
    scheduler::TradeScheduler,
};
use arb_amount::{round_down, BareTrade, SCALE};
use arb_instrument::{Market, Side};
use arb_integration::{
    error::{ConnectivityError, ExchangeApiError},
    exchange::{
        AccountNotification, CancelResult, ExchangeClient, OrderBookAbstract, OrderId, OrderKind,
        OrderUpdateKind,
    },
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::Instant,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

const CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);
const LIVE_TICK: Duration = Duration::from_secs(4);
const FIX_PRICE_GAPS_AFTER_UPDATES: u32 = 10;
const FIX_PRICE_GAPS_AFTER: Duration = Duration::from_secs(4);
const POST_ONLY_COLLISION_RETRY: Duration = Duration::from_millis(100);
const RECENT_ORDER_ID_CAPACITY: usize = 8;

fn tick() -> Decimal {
    Decimal::new(1, SCALE)
}

fn opposite(side: Side) -> Side {
    match side {
        Side::Buy => Side::Sell,
        Side::Sell => Side::Buy,
    }
}

/// One-point-better-unless-alone pricing policy.
fn compute_new_price(book: &OrderBookAbstract, side: Side) -> Option<Decimal> {
    let (best_primary, _) = book.best(side)?;
    let raw = match side {
        Side::Buy => best_primary + tick(),
        Side::Sell => best_primary - tick(),
    };

    if let Some((best_secondary, _)) = book.best(opposite(side)) {
        if best_secondary == raw {
            return Some(best_primary);
        }
    }
    Some(raw)
}

/// Whether the Processor's current quote should move, and to what price, given the current book
/// and the `fixPriceGaps` heuristic counters.
fn should_reprice(
    book: &OrderBookAbstract,
    side: Side,
    current_price: Decimal,
    current_quantity: Decimal,
    book_change_counter: u32,
    last_reprice: Instant,
    now: Instant,
) -> Option<Decimal> {
    let (best_primary, best_qty) = book.best(side)?;
    let new_price = compute_new_price(book, side)?;

    let behind_best = match side {
        Side::Buy => current_price < best_primary,
        Side::Sell => current_price > best_primary,
    };
    if behind_best {
        return Some(new_price);
    }

    if current_price == best_primary && current_quantity < best_qty {
        // We sit second in the queue at the same price as the front - still worth repricing.
        return Some(new_price);
    }

    let gaps_elapsed = book_change_counter >= FIX_PRICE_GAPS_AFTER_UPDATES
        || now.duration_since(last_reprice) >= FIX_PRICE_GAPS_AFTER;
    if gaps_elapsed && new_price != current_price {
        return Some(new_price);
    }

    None
}

/// `true` if repricing a Buy order to `new_price` at `quantity` would require more `from`
/// currency than `commonFromAmount` currently reserves.
fn exceeds_reservation(side: Side, new_price: Decimal, quantity: Decimal, common: Decimal) -> bool {
    matches!(side, Side::Buy) && round_down(new_price * quantity) > common
}

/// Queue of outstanding [`DelayedTradeManager::pause`] callers waiting for this Processor to
/// confirm its order is off the book. Mirrors the Scheduler's `unregister`/`ack_exit` two-phase
/// handshake: `push` hands back a receiver the pauser awaits, `drain` fires every pending one once
/// the Processor has reached a state safe for the pause to take effect.
#[derive(Default)]
pub struct PauseAcks {
    inner: Mutex<VecDeque<oneshot::Sender<()>>>,
}

impl PauseAcks {
    pub(crate) fn push(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().push_back(tx);
        rx
    }

    pub(crate) fn drain(&self) {
        for ack in self.inner.lock().drain(..) {
            let _ = ack.send(());
        }
    }
}

enum Phase {
    Init,
    Place,
    Live {
        order_id: OrderId,
        price: Decimal,
        quantity: Decimal,
        book_change_counter: u32,
        last_reprice: Instant,
        latest_seen_trade_id: u64,
    },
    CancelAndIdle {
        order_id: Option<OrderId>,
    },
    DisconnectRecovery {
        order_id: Option<OrderId>,
        latest_seen_trade_id: u64,
    },
    /// Order cancelled and held off the book at the Delayed-Trade Manager's request, so a
    /// same-market opposite-side Instant step cannot self-trade against it.
    Paused,
    Done,
}

/// Owns exactly one post-only limit order per `(market, side)`, market-making the pooled
/// `commonFromAmount` the [`TradeScheduler`] tracks. One worker task per Processor;
/// the worker is spawned by the Delayed-Trade Manager on the first non-zero `commonFromAmount`
/// and exits on `CANCEL_AND_IDLE`.
pub struct DelayedTradeProcessor<C> {
    client: Arc<C>,
    market: Market,
    side: Side,
    scheduler: Arc<TradeScheduler>,
    book_rx: watch::Receiver<OrderBookAbstract>,
    connection_rx: watch::Receiver<bool>,
    notifications: mpsc::UnboundedReceiver<AccountNotification>,
    recent_order_ids: VecDeque<OrderId>,
    /// `order_id -> orders seen before this run, loaded from the journal at startup`.
    recovered_order_id: Option<OrderId>,
    pause_rx: watch::Receiver<bool>,
    pause_acks: Arc<PauseAcks>,
}

impl<C> DelayedTradeProcessor<C>
where
    C: ExchangeClient,
{
    pub fn new(
        client: Arc<C>,
        market: Market,
        side: Side,
        scheduler: Arc<TradeScheduler>,
        book_rx: watch::Receiver<OrderBookAbstract>,
        connection_rx: watch::Receiver<bool>,
        notifications: mpsc::UnboundedReceiver<AccountNotification>,
        recovered_order_id: Option<OrderId>,
        pause_rx: watch::Receiver<bool>,
        pause_acks: Arc<PauseAcks>,
    ) -> Self {
        Self {
            client,
            market,
            side,
            scheduler,
            book_rx,
            connection_rx,
            notifications,
            recent_order_ids: VecDeque::with_capacity(RECENT_ORDER_ID_CAPACITY),
            recovered_order_id,
            pause_rx,
            pause_acks,
        }
    }

    fn remember_order_id(&mut self, id: OrderId) {
        if self.recent_order_ids.len() == RECENT_ORDER_ID_CAPACITY {
            self.recent_order_ids.pop_front();
        }
        self.recent_order_ids.push_back(id);
    }

    fn is_ours(&self, id: &OrderId) -> bool {
        self.recent_order_ids.contains(id)
    }

    /// Drive the state machine to completion (`CANCEL_AND_IDLE` reached, or a fatal error).
    pub async fn run(mut self) -> Result<(), ProcessorError> {
        let mut phase = if self.recovered_order_id.is_some() {
            Phase::Init
        } else {
            Phase::Place
        };

        loop {
            phase = match phase {
                Phase::Init => self.power_on_recovery().await?,
                Phase::Place => self.place().await?,
                Phase::Live {
                    order_id,
                    price,
                    quantity,
                    book_change_counter,
                    last_reprice,
                    latest_seen_trade_id,
                } => {
                    self.live(order_id, price, quantity, book_change_counter, last_reprice, latest_seen_trade_id)
                        .await?
                }
                Phase::CancelAndIdle { order_id } => {
                    self.cancel_and_idle(order_id).await?;
                    return Ok(());
                }
                Phase::DisconnectRecovery {
                    order_id,
                    latest_seen_trade_id,
                } => {
                    self.disconnect_recovery(order_id, latest_seen_trade_id)
                        .await?
                }
                Phase::Paused => self.paused().await?,
                Phase::Done => return Ok(()),
            };
        }
    }

    async fn power_on_recovery(&mut self) -> Result<Phase, ProcessorError> {
        if let Some(order_id) = self.recovered_order_id.take() {
            info!(market = %self.market, side = ?self.side, order_id = ?order_id, "power-on recovery: cancelling stale order and replaying its trades");
            let _ = self.client.cancel(&order_id).await;
            if let Ok(trades) = self.client.order_trades(&order_id).await {
                self.scheduler
                    .add_trades(trades.into_iter().map(|t| BareTrade::new(t.amount, t.price, t.fee_multiplier)));
            }
            self.remember_order_id(order_id);
        }
        Ok(Phase::Place)
    }

    async fn place(&mut self) -> Result<Phase, ProcessorError> {
        loop {
            if *self.pause_rx.borrow() {
                // No resting order exists yet in this phase - nothing to cancel, safe to ack now.
                self.pause_acks.drain();
                return Ok(Phase::Paused);
            }

            let common = *self.scheduler.common_from_amount().borrow();
            if common.is_zero() {
                return Ok(Phase::Done);
            }

            let book = self.book_rx.borrow().clone();
            let Some(price) = compute_new_price(&book, self.side) else {
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            };
            let quantity = common;

            match self
                .client
                .place(&self.market, self.side, price, quantity, OrderKind::PostOnly, Uuid::new_v4())
                .await
            {
                Ok(result) => {
                    self.remember_order_id(result.order_id.clone());
                    if !result.trades.is_empty() {
                        self.scheduler.add_trades(
                            result
                                .trades
                                .into_iter()
                                .map(|t| BareTrade::new(t.amount, t.price, t.fee_multiplier)),
                        );
                    }
                    let confirmed =
                        tokio::time::timeout(CONFIRM_TIMEOUT, self.await_open_confirmation(&result.order_id))
                            .await;
                    match confirmed {
                        Ok(true) => {
                            return Ok(Phase::Live {
                                order_id: result.order_id,
                                price,
                                quantity,
                                book_change_counter: 0,
                                last_reprice: Instant::now(),
                                latest_seen_trade_id: 0,
                            });
                        }
                        _ => {
                            warn!(market = %self.market, "order confirmation timed out, treating as disconnect");
                            return Ok(Phase::DisconnectRecovery {
                                order_id: Some(result.order_id),
                                latest_seen_trade_id: 0,
                            });
                        }
                    }
                }
                Err(ExchangeApiError::UnableToPlacePostOnlyOrder) => {
                    debug!("post-only would cross, retrying in 100ms");
                    tokio::time::sleep(POST_ONLY_COLLISION_RETRY).await;
                }
                Err(err) if err.is_fatal_for_step() => {
                    self.scheduler.unregister_all(ProcessorError::Fatal(err.clone()));
                    return Err(ProcessorError::Fatal(err));
                }
                Err(ExchangeApiError::Connectivity(_)) => {
                    return Ok(Phase::DisconnectRecovery {
                        order_id: None,
                        latest_seen_trade_id: 0,
                    });
                }
                Err(err) => {
                    debug!(?err, "transient place failure, retrying");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    }

    async fn await_open_confirmation(&mut self, order_id: &OrderId) -> bool {
        while let Some(notification) = self.notifications.recv().await {
            if let AccountNotification::LimitOrderCreated { order_id: confirmed } = &notification {
                if confirmed == order_id {
                    return true;
                }
            }
        }
        false
    }

    async fn live(
        &mut self,
        order_id: OrderId,
        price: Decimal,
        quantity: Decimal,
        mut book_change_counter: u32,
        mut last_reprice: Instant,
        mut latest_seen_trade_id: u64,
    ) -> Result<Phase, ProcessorError> {
        let mut order_id = order_id;
        let mut price = price;
        let mut quantity = quantity;
        let mut common_rx = self.scheduler.common_from_amount();
        let mut tick_interval = tokio::time::interval(LIVE_TICK);

        loop {
            tokio::select! {
                _ = self.book_rx.changed() => {
                    book_change_counter += 1;
                    let book = self.book_rx.borrow().clone();
                    if let Some(new_price) = should_reprice(&book, self.side, price, quantity, book_change_counter, last_reprice, Instant::now()) {
                        match self.try_move(&order_id, new_price, quantity).await? {
                            MoveOutcome::Moved(new_id) => {
                                order_id = new_id;
                                price = new_price;
                                book_change_counter = 0;
                                last_reprice = Instant::now();
                            }
                            MoveOutcome::Repeat => return Ok(Phase::Place),
                            MoveOutcome::CancelFirst => {
                                return Ok(Phase::CancelAndIdle { order_id: Some(order_id) });
                            }
                            MoveOutcome::Disconnected => {
                                return Ok(Phase::DisconnectRecovery { order_id: Some(order_id), latest_seen_trade_id });
                            }
                        }
                    }
                }
                _ = tick_interval.tick() => {
                    let book = self.book_rx.borrow().clone();
                    if let Some(new_price) = should_reprice(&book, self.side, price, quantity, book_change_counter, last_reprice, Instant::now()) {
                        match self.try_move(&order_id, new_price, quantity).await? {
                            MoveOutcome::Moved(new_id) => {
                                order_id = new_id;
                                price = new_price;
                                book_change_counter = 0;
                                last_reprice = Instant::now();
                            }
                            MoveOutcome::Repeat => return Ok(Phase::Place),
                            MoveOutcome::CancelFirst => {
                                return Ok(Phase::CancelAndIdle { order_id: Some(order_id) });
                            }
                            MoveOutcome::Disconnected => {
                                return Ok(Phase::DisconnectRecovery { order_id: Some(order_id), latest_seen_trade_id });
                            }
                        }
                    }
                }
                changed = common_rx.changed() => {
                    if changed.is_err() {
                        continue;
                    }
                    let new_common = *common_rx.borrow();
                    if new_common.is_zero() {
                        return Ok(Phase::CancelAndIdle { order_id: Some(order_id) });
                    }
                    if exceeds_reservation(self.side, price, new_common, new_common) {
                        return Ok(Phase::CancelAndIdle { order_id: Some(order_id) });
                    }
                    // Force-move even if price is unchanged so the Scheduler can ack a pending exit.
                    match self.try_move(&order_id, price, new_common).await? {
                        MoveOutcome::Moved(new_id) => {
                            order_id = new_id;
                            quantity = new_common;
                            if let Some(exiting) = self.scheduler.pending_exit() {
                                self.scheduler.ack_exit(exiting);
                            }
                        }
                        MoveOutcome::Repeat => return Ok(Phase::Place),
                        MoveOutcome::CancelFirst => {
                            return Ok(Phase::CancelAndIdle { order_id: Some(order_id) });
                        }
                        MoveOutcome::Disconnected => {
                            return Ok(Phase::DisconnectRecovery { order_id: Some(order_id), latest_seen_trade_id });
                        }
                    }
                }
                notification = self.notifications.recv() => {
                    let Some(notification) = notification else {
                        return Ok(Phase::DisconnectRecovery { order_id: Some(order_id), latest_seen_trade_id });
                    };
                    self.handle_notification(notification, &order_id, &mut latest_seen_trade_id);
                }
                connected = self.connection_rx.changed() => {
                    if connected.is_ok() && !*self.connection_rx.borrow() {
                        return Ok(Phase::DisconnectRecovery { order_id: Some(order_id), latest_seen_trade_id });
                    }
                }
                paused = self.pause_rx.changed() => {
                    if paused.is_ok() && *self.pause_rx.borrow() {
                        info!(market = %self.market, side = ?self.side, "pausing for a same-market opposite-side instant step");
                        if let Err(err) = self.client.cancel(&order_id).await {
                            warn!(?err, "pause: cancel failed, assuming already gone");
                        }
                        if let Some(exiting) = self.scheduler.pending_exit() {
                            self.scheduler.ack_exit(exiting);
                        }
                        self.pause_acks.drain();
                        return Ok(Phase::Paused);
                    }
                }
            }
        }
    }

    /// Held off the book until the Delayed-Trade Manager lifts the pause, then resumes at `PLACE`.
    async fn paused(&mut self) -> Result<Phase, ProcessorError> {
        while *self.pause_rx.borrow() {
            if self.pause_rx.changed().await.is_err() {
                return Ok(Phase::Done);
            }
        }
        Ok(Phase::Place)
    }

    fn handle_notification(
        &mut self,
        notification: AccountNotification,
        current_order_id: &OrderId,
        latest_seen_trade_id: &mut u64,
    ) {
        match notification {
            AccountNotification::Trade { order_id, trade } => {
                if &order_id == current_order_id || self.is_ours(&order_id) {
                    *latest_seen_trade_id = (*latest_seen_trade_id).max(trade.trade_id);
                    self.scheduler
                        .add_trades([BareTrade::new(trade.amount, trade.price, trade.fee_multiplier)]);
                }
            }
            AccountNotification::OrderUpdate { order_id, kind, .. } => {
                if (&order_id == current_order_id || self.is_ours(&order_id))
                    && matches!(kind, OrderUpdateKind::Filled)
                {
                    debug!(order_id = ?order_id, "order reported fully filled by exchange notification");
                }
            }
            _ => {}
        }
    }

    async fn try_move(
        &mut self,
        order_id: &OrderId,
        new_price: Decimal,
        new_quantity: Decimal,
    ) -> Result<MoveOutcome, ProcessorError> {
        let common = *self.scheduler.common_from_amount().borrow();
        if exceeds_reservation(self.side, new_price, new_quantity, common) {
            warn!(market = %self.market, "cannot move safely, cancelling and re-placing at a compatible amount");
            if self.client.cancel(order_id).await.is_ok() {
                return Ok(MoveOutcome::Repeat);
            }
            return Ok(MoveOutcome::CancelFirst);
        }

        match self
            .client
            .move_order(order_id, new_price, Some(new_quantity), OrderKind::PostOnly, Uuid::new_v4())
            .await
        {
            Ok(result) => {
                self.remember_order_id(result.order_id.clone());
                Ok(MoveOutcome::Moved(result.order_id))
            }
            Err(ExchangeApiError::UnableToPlacePostOnlyOrder) => {
                tokio::time::sleep(POST_ONLY_COLLISION_RETRY).await;
                Ok(MoveOutcome::Moved(order_id.clone()))
            }
            Err(ExchangeApiError::OrderCompletedOrNotExist | ExchangeApiError::InvalidOrderNumber) => {
                Ok(MoveOutcome::Repeat)
            }
            Err(ExchangeApiError::Connectivity(ConnectivityError::Disconnected)) => {
                Ok(MoveOutcome::Disconnected)
            }
            Err(err) if err.is_fatal_for_step() => {
                self.scheduler.unregister_all(ProcessorError::Fatal(err.clone()));
                Err(ProcessorError::Fatal(err))
            }
            Err(_) => Ok(MoveOutcome::Moved(order_id.clone())),
        }
    }

    async fn cancel_and_idle(&mut self, order_id: Option<OrderId>) -> Result<(), ProcessorError> {
        if let Some(order_id) = order_id {
            match self.client.cancel(&order_id).await {
                Ok(CancelResult::Ok | CancelResult::CompletedOrNotExist) => {}
                Err(err) => warn!(?err, "cancel-and-idle: cancel failed, assuming already gone"),
            }
        }
        if let Some(exiting) = self.scheduler.pending_exit() {
            self.scheduler.ack_exit(exiting);
        }
        Ok(())
    }

    async fn disconnect_recovery(
        &mut self,
        order_id: Option<OrderId>,
        latest_seen_trade_id: u64,
    ) -> Result<Phase, ProcessorError> {
        info!(market = %self.market, "awaiting reconnect before resuming delayed processor");
        while !*self.connection_rx.borrow() {
            if self.connection_rx.changed().await.is_err() {
                return Ok(Phase::Done);
            }
        }

        if let Some(order_id) = order_id {
            if let Ok(trades) = self.client.order_trades(&order_id).await {
                let missed: Vec<BareTrade> = trades
                    .into_iter()
                    .filter(|t| t.trade_id > latest_seen_trade_id)
                    .map(|t| BareTrade::new(t.amount, t.price, t.fee_multiplier))
                    .collect();
                if !missed.is_empty() {
                    self.scheduler.add_trades(missed);
                }
            }
        }

        Ok(Phase::Place)
    }
}

enum MoveOutcome {
    Moved(OrderId),
    Repeat,
    CancelFirst,
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;
    use arb_instrument::Side;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn book(best_bid: Decimal, best_ask: Decimal) -> OrderBookAbstract {
        let mut bids = BTreeMap::new();
        bids.insert(best_bid, dec!(1));
        let mut asks = BTreeMap::new();
        asks.insert(best_ask, dec!(1));
        OrderBookAbstract { asks, bids }
    }

    #[test]
    fn compute_new_price_buy_is_one_tick_above_best_bid() {
        let b = book(dec!(100), dec!(101));
        assert_eq!(compute_new_price(&b, Side::Buy), Some(dec!(100) + tick()));
    }

    #[test]
    fn compute_new_price_avoids_crossing_spread() {
        // best bid + 1 tick would equal best ask -> stay at best bid instead.
        let ask = dec!(100) + tick();
        let b = book(dec!(100), ask);
        assert_eq!(compute_new_price(&b, Side::Buy), Some(dec!(100)));
    }

    #[test]
    fn exceeds_reservation_only_applies_to_buy() {
        assert!(!exceeds_reservation(Side::Sell, dec!(1000), dec!(1), dec!(0)));
        assert!(exceeds_reservation(Side::Buy, dec!(1000), dec!(1), dec!(1)));
    }
}
