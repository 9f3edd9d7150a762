use crate::{
    enumerator::PathEnumerator,
    error::IntentError,
    manager::{IntentManager, MergeRequest},
    market::{shape_hash, TranIntentMarket},
};
use arb_amount::{carve_trades, round_down, sum_from_amount, sum_target_amount, AmountType, BareTrade};
use arb_execution::{DelayedTradeManager, InstantTradeExecutor, OrderBookCache};
use arb_instrument::{Currency, Market, Side, Speed};
use arb_integration::exchange::ExchangeClient;
use arb_journal::Journal;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Fixed knobs a running intent consults; the rest of configuration (credentials, DSNs, primary
/// currencies for enumeration) lives one level up in `arb-cli`.
#[derive(Debug, Clone)]
pub struct IntentConfig {
    pub min_trade_amount: Decimal,
    pub profit_monitor_tick: Duration,
    pub profit_timeout: Duration,
    pub blacklist_ttl: Duration,
    pub end_currencies: Vec<Currency>,
}

/// Everything a running intent needs to reach the exchange, the Scheduler/Processor layer, the
/// journal, and its siblings. Cloned cheaply (every field is an `Arc` or already `Clone`) so each
/// spawned child intent gets its own copy.
pub struct IntentContext<C, E> {
    pub book_cache: Arc<OrderBookCache<C>>,
    pub delayed_manager: Arc<DelayedTradeManager<C>>,
    pub instant_executor: Arc<InstantTradeExecutor<C>>,
    pub enumerator: Arc<E>,
    pub intent_manager: Arc<IntentManager>,
    pub journal: Journal,
    pub config: Arc<IntentConfig>,
}

impl<C, E> Clone for IntentContext<C, E> {
    fn clone(&self) -> Self {
        Self {
            book_cache: self.book_cache.clone(),
            delayed_manager: self.delayed_manager.clone(),
            instant_executor: self.instant_executor.clone(),
            enumerator: self.enumerator.clone(),
            intent_manager: self.intent_manager.clone(),
            journal: self.journal.clone(),
            config: self.config.clone(),
        }
    }
}

/// Per-path state machine. Invariants: exactly one step is `PartiallyCompleted`, at
/// `market_idx`; steps before it are `Completed`; steps after it are `Predicted`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TransactionIntent {
    pub id: Uuid,
    pub markets: Vec<TranIntentMarket>,
    pub market_idx: usize,
}

impl TransactionIntent {
    pub fn new(id: Uuid, markets: Vec<TranIntentMarket>) -> Self {
        Self { id, markets, market_idx: 0 }
    }

    pub fn current(&self) -> &TranIntentMarket {
        &self.markets[self.market_idx]
    }

    pub fn init_amount(&self) -> Decimal {
        self.markets[0].from_amount()
    }

    pub fn shape(&self) -> u64 {
        shape_hash(&self.markets)
    }

    pub fn is_last_step(&self) -> bool {
        self.market_idx + 1 >= self.markets.len()
    }

    fn journal_key(market: &Market, side: Side) -> (String, String) {
        (market.to_string(), side.to_string())
    }

    fn to_state(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("TransactionIntent is always representable as JSON")
    }
}

/// Merge `(init_delta, current_delta)` into `markets` at step `k`: per-step invariants are kept
/// by appending synthetic adjustment trades to the already-completed steps rather than mutating
/// their real trade history. At `k == 0` there is no earlier step to adjust, so the delta lands
/// directly on step 0's `from_amount`.
pub fn merge_markets(
    markets: &[TranIntentMarket],
    k: usize,
    init_delta: Decimal,
    current_delta: Decimal,
) -> Vec<TranIntentMarket> {
    let mut merged = markets.to_vec();

    if k == 0 {
        let new_from = markets[0].from_amount() + current_delta;
        merged[0] = markets[0].clone().with_from_amount(new_from);
        return merged;
    }

    merged[0] = markets[0].clone().push_trades(vec![BareTrade::adjust_from(init_delta)]);

    let prev_order_type = markets[k - 1].order_type();
    merged[k - 1] = markets[k - 1]
        .clone()
        .push_trades(vec![BareTrade::adjust_target(current_delta, prev_order_type)]);

    let new_from = markets[k].from_amount() + current_delta;
    merged[k] = markets[k].clone().with_from_amount(new_from);

    merged
}

/// Split `markets` at step `k` once `trades` have filled some or all of its reserved amount.
/// `remaining` is the parent intent's view (step `k` keeps whatever `trades` didn't consume);
/// `committed` is a new child intent's view (step `k` becomes `Completed(trades)`, step `k+1`
/// becomes `PartiallyCompleted` with the derived target amount). Earlier steps are carved by
/// target-amount so `committed[i].target_amount() == committed[i+1].from_amount()` for every
/// `i < k`, reusing the same [`carve_trades`] primitive the Scheduler uses for trade attribution.
pub fn split_markets(
    markets: &[TranIntentMarket],
    k: usize,
    trades: Vec<BareTrade>,
) -> (Vec<TranIntentMarket>, Vec<TranIntentMarket>) {
    let mut remaining = markets.to_vec();
    let mut committed = markets.to_vec();

    let order_type_k = markets[k].order_type();
    let trades_from = sum_from_amount(&trades, order_type_k);
    let trades_target = sum_target_amount(&trades, order_type_k);
    let original_from_k = markets[k].from_amount();

    committed[k] = markets[k].clone().into_completed(trades);
    remaining[k] = markets[k].clone().with_from_amount(round_down(original_from_k - trades_from));

    if k + 1 < markets.len() {
        committed[k + 1] = markets[k + 1].clone().with_from_amount(trades_target);
    }

    let mut cut = trades_from;
    for i in (0..k).rev() {
        let order_type_i = markets[i].order_type();
        let original_trades = markets[i].trades().to_vec();
        let (carved, leftover) = carve_trades(original_trades, order_type_i, AmountType::Target, cut);
        committed[i] = markets[i].clone().into_completed(carved);
        remaining[i] = markets[i].clone().into_completed(leftover);
        cut = committed[i].from_amount();
    }

    (remaining, committed)
}

enum Stage {
    Start,
    InstantStep,
    DelayedStep,
    NotProfitable(IntentError),
    Unfilled,
    Done,
}

/// Drive `intent` through its state machine to completion, spawning child intents (after a split
/// or a re-plan) as independent tasks. Returns once this particular `(id, market_idx)` lineage
/// has reached a terminal state - either persisted as completed, or handed off to a spawned
/// child/replacement that will itself be driven to completion by its own `run` call.
pub async fn run<C, E>(mut intent: TransactionIntent, ctx: IntentContext<C, E>)
where
    C: ExchangeClient,
    E: PathEnumerator,
{
    let mut stage = Stage::Start;
    loop {
        stage = match stage {
            Stage::Start => start(&mut intent, &ctx).await,
            Stage::InstantStep => instant_step(&mut intent, &ctx).await,
            Stage::DelayedStep => delayed_step(&mut intent, &ctx).await,
            Stage::NotProfitable(err) => not_profitable(&mut intent, &ctx, err).await,
            Stage::Unfilled => {
                unfilled(&intent, &ctx).await;
                return;
            }
            Stage::Done => return,
        };
    }
}

async fn start<C, E>(intent: &mut TransactionIntent, ctx: &IntentContext<C, E>) -> Stage
where
    C: ExchangeClient,
    E: PathEnumerator,
{
    let shape = intent.shape();
    let current_amount = intent.current().from_amount();
    let init_amount = intent.init_amount();

    if ctx
        .intent_manager
        .try_merge(shape, intent.market_idx, intent.id, init_amount, current_amount)
        .await
        .is_some()
    {
        info!(id = ?intent.id, "merged into an existing intent, dropping self");
        if let Err(err) = ctx.journal.remove_active_transaction(intent.id).await {
            warn!(id = ?intent.id, ?err, "failed to remove merged intent from the journal");
        }
        return Stage::Done;
    }

    let (market_str, side_str) = TransactionIntent::journal_key(intent.current().market(), intent.current().order_type());
    match ctx.journal.take_unfilled_amount(&market_str, &side_str).await {
        Ok(residue) if !residue.is_zero() => {
            info!(id = ?intent.id, %residue, "merging stranded unfilled residue at start");
            intent.markets = merge_markets(&intent.markets, intent.market_idx, residue, residue);
        }
        Ok(_) => {}
        Err(err) => warn!(id = ?intent.id, ?err, "failed to query unfilled residue, proceeding without it"),
    }

    if let Err(err) = ctx
        .journal
        .upsert_active_transaction(
            intent.id,
            &intent.to_state(),
            &intent.current().from_currency().to_string(),
            intent.current().from_amount(),
        )
        .await
    {
        warn!(id = ?intent.id, ?err, "failed to persist intent at start");
    }

    match intent.current().speed() {
        Speed::Instant => Stage::InstantStep,
        Speed::Delayed => Stage::DelayedStep,
    }
}

async fn instant_step<C, E>(intent: &mut TransactionIntent, ctx: &IntentContext<C, E>) -> Stage
where
    C: ExchangeClient,
    E: PathEnumerator,
{
    let market = intent.current().market().clone();
    let side = intent.current().order_type();
    let from_amount = intent.current().from_amount();

    // Avoid self-trading against our own resting order on the opposite side of this market.
    let _pause_guard = ctx.delayed_manager.pause(&market, opposite(side)).await;

    let book_subscription = match ctx.book_cache.subscribe_book(&market).await {
        Ok(sub) => sub,
        Err(err) => {
            warn!(%market, ?err, "failed to subscribe to order book for instant step");
            return Stage::NotProfitable(crate::error::classify_fatal(&market, &err));
        }
    };

    let fee_subscription = match ctx.book_cache.subscribe_fee(&market).await {
        Ok(sub) => sub,
        Err(err) => {
            warn!(%market, ?err, "failed to subscribe to fee stream for instant step");
            return Stage::NotProfitable(crate::error::classify_fatal(&market, &err));
        }
    };
    let taker_fee = *fee_subscription.rx.borrow();

    let book_rx = book_subscription.rx.clone();
    let result = ctx
        .instant_executor
        .execute(&market, side, from_amount, taker_fee, || book_rx.borrow().clone())
        .await;

    let trades = match result {
        Ok(Some(trades)) => trades,
        Ok(None) => return Stage::NotProfitable(IntentError::NotEnoughCrypto),
        Err(reason) => return Stage::NotProfitable(IntentError::InstantAborted(reason.into())),
    };

    finish_step(intent, ctx, trades).await
}

fn opposite(side: Side) -> Side {
    match side {
        Side::Buy => Side::Sell,
        Side::Sell => Side::Buy,
    }
}

/// Shared tail of both `INSTANT_STEP` and `DELAYED_STEP`: split at the current step, persist the
/// committed portion (spawning a child to carry it onward, or recording it as a completed
/// transaction if this was the last step), then - if `trades` didn't fully consume the step's
/// reserved amount - keep driving this same lineage from the leftover via re-planning rather than
/// treating a partial fill as a finished intent.
async fn finish_step<C, E>(
    intent: &mut TransactionIntent,
    ctx: &IntentContext<C, E>,
    trades: Vec<BareTrade>,
) -> Stage
where
    C: ExchangeClient,
    E: PathEnumerator,
{
    let k = intent.market_idx;
    let order_type_k = intent.markets[k].order_type();
    let consumed = sum_from_amount(&trades, order_type_k);
    let original_from = intent.markets[k].from_amount();
    let remainder = round_down(original_from - consumed);
    let is_last = k + 1 >= intent.markets.len();

    let (remaining_markets, committed_markets) = split_markets(&intent.markets, k, trades);

    if is_last {
        let completed_id = Uuid::new_v4();
        let profit = committed_markets[k].target_amount() - intent.markets[0].from_amount();
        let completed = TransactionIntent { id: completed_id, markets: committed_markets, market_idx: k };
        if let Err(err) = ctx.journal.complete_transaction(completed_id, &completed.to_state(), profit).await {
            warn!(id = ?completed_id, ?err, "failed to persist completed transaction");
        } else {
            info!(id = ?completed_id, %profit, "transaction completed");
        }
    } else {
        let child = TransactionIntent { id: Uuid::new_v4(), markets: committed_markets, market_idx: k + 1 };
        if let Err(err) = ctx
            .journal
            .upsert_active_transaction(
                child.id,
                &child.to_state(),
                &child.current().from_currency().to_string(),
                child.current().from_amount(),
            )
            .await
        {
            warn!(id = ?child.id, ?err, "failed to persist child intent");
        }
        let child_ctx = ctx.clone();
        tokio::spawn(async move { run(child, child_ctx).await });
    }

    if remainder.is_zero() {
        if let Err(err) = ctx.journal.remove_active_transaction(intent.id).await {
            warn!(id = ?intent.id, ?err, "failed to remove completed intent from the journal");
        }
        return Stage::Done;
    }

    intent.markets = remaining_markets;
    if let Err(err) = ctx
        .journal
        .upsert_active_transaction(
            intent.id,
            &intent.to_state(),
            &intent.current().from_currency().to_string(),
            intent.current().from_amount(),
        )
        .await
    {
        warn!(id = ?intent.id, ?err, "failed to persist under-filled leftover");
    }
    Stage::NotProfitable(IntentError::NotEnoughCrypto)
}

async fn delayed_step<C, E>(intent: &mut TransactionIntent, ctx: &IntentContext<C, E>) -> Stage
where
    C: ExchangeClient,
    E: PathEnumerator,
{
    let market = intent.current().market().clone();
    let side = intent.current().order_type();
    let from_amount = intent.current().from_amount();

    let scheduler = match ctx.delayed_manager.ensure_running(market.clone(), side, None).await {
        Ok(scheduler) => scheduler,
        Err(err) => return Stage::NotProfitable(crate::error::classify_fatal(&market, &err)),
    };

    let mut trades_rx = scheduler.register(intent.id);
    if scheduler.add_amount(intent.id, from_amount).is_err() {
        return Stage::NotProfitable(IntentError::SchedulerRejected);
    }

    let (merge_tx, mut merge_rx) = mpsc::unbounded_channel::<MergeRequest>();
    ctx.intent_manager.register(intent.id, &intent.markets, intent.market_idx, merge_tx);

    let mut collected = Vec::new();
    let mut profit_tick = tokio::time::interval(ctx.config.profit_monitor_tick);
    let deadline = tokio::time::sleep(ctx.config.profit_timeout);
    tokio::pin!(deadline);

    let outcome = loop {
        tokio::select! {
            trade = trades_rx.recv() => {
                match trade {
                    Some(Ok(trade)) => collected.push(trade),
                    Some(Err(err)) => break Err(IntentError::from(err)),
                    None => break Ok(()),
                }
            }
            request = merge_rx.recv() => {
                let Some((init_delta, current_delta, ack)) = request else { continue };
                let approved = scheduler.add_amount(intent.id, current_delta).is_ok();
                if approved {
                    intent.markets = merge_markets(&intent.markets, intent.market_idx, init_delta, current_delta);
                    if let Err(err) = ctx
                        .journal
                        .upsert_active_transaction(
                            intent.id,
                            &intent.to_state(),
                            &intent.current().from_currency().to_string(),
                            intent.current().from_amount(),
                        )
                        .await
                    {
                        warn!(id = ?intent.id, ?err, "failed to persist merged state");
                    }
                }
                let _ = ack.send(approved);
            }
            _ = profit_tick.tick() => {
                let predicted_target = intent.markets.last().map(|m| m.target_amount()).unwrap_or_default();
                if predicted_target < intent.init_amount() {
                    break Err(IntentError::NotProfitableDelta);
                }
            }
            _ = &mut deadline => {
                break Err(IntentError::NotProfitableTimeout);
            }
        }
    };

    ctx.intent_manager.unregister(intent.id);

    match outcome {
        Ok(()) => {
            if collected.is_empty() {
                scheduler.unregister(intent.id).await;
                return Stage::Unfilled;
            }
            finish_step(intent, ctx, collected).await
        }
        Err(err) => {
            scheduler.unregister(intent.id).await;
            if !collected.is_empty() {
                // Partial fill before the monitor fired - bank the partial trade and treat the
                // shortfall through the same split path a full fill would take.
                return finish_step(intent, ctx, collected).await;
            }
            Stage::NotProfitable(err)
        }
    }
}

async fn not_profitable<C, E>(
    intent: &mut TransactionIntent,
    ctx: &IntentContext<C, E>,
    err: IntentError,
) -> Stage
where
    C: ExchangeClient,
    E: PathEnumerator,
{
    if let IntentError::MarketDisabled(market) | IntentError::OrderMatchingDisabled(market) = &err {
        if let Err(journal_err) = ctx
            .journal
            .blacklist_market(&market.to_string(), &err.to_string(), ctx.config.blacklist_ttl.as_secs() as i64)
            .await
        {
            warn!(%market, ?journal_err, "failed to persist blacklist entry");
        }
    }

    let from_currency = intent.current().from_currency().clone();
    let from_amount = intent.current().from_amount();

    if intent.init_amount() < ctx.config.min_trade_amount {
        warn!(id = ?intent.id, init_amount = %intent.init_amount(), ?err, "initial amount too small to re-plan, giving up");
        return Stage::Unfilled;
    }

    let in_flight = ctx.intent_manager.in_flight_shapes();
    let candidates = ctx
        .enumerator
        .enumerate(&from_currency, from_amount, &ctx.config.end_currencies, &in_flight)
        .await;

    let Some(path) = candidates.into_iter().next() else {
        debug!(id = ?intent.id, "no replacement path found after not-profitable");
        return Stage::Unfilled;
    };

    let mut new_tail: Vec<TranIntentMarket> = path
        .chain
        .into_iter()
        .map(|order| TranIntentMarket::Predicted {
            market: order.market,
            speed: order.speed,
            from_currency: order.from_currency,
        })
        .collect();
    if let Some(first) = new_tail.first_mut() {
        *first = first.clone().with_from_amount(from_amount);
    }

    intent.markets.truncate(intent.market_idx);
    intent.markets.append(&mut new_tail);

    if let Err(journal_err) = ctx
        .journal
        .upsert_active_transaction(
            intent.id,
            &intent.to_state(),
            &intent.current().from_currency().to_string(),
            intent.current().from_amount(),
        )
        .await
    {
        warn!(id = ?intent.id, ?journal_err, "failed to persist re-planned intent");
    }

    match intent.current().speed() {
        Speed::Instant => Stage::InstantStep,
        Speed::Delayed => Stage::DelayedStep,
    }
}

async fn unfilled<C, E>(intent: &TransactionIntent, ctx: &IntentContext<C, E>)
where
    C: ExchangeClient,
    E: PathEnumerator,
{
    let current = intent.current();
    let is_primary_safe = ctx.config.end_currencies.contains(current.from_currency())
        && intent.init_amount() <= current.from_amount();

    if is_primary_safe {
        debug!(id = ?intent.id, "unfilled residue is in a primary currency and covers the initial amount, dropping");
        if let Err(err) = ctx.journal.remove_active_transaction(intent.id).await {
            warn!(id = ?intent.id, ?err, "failed to remove unfilled intent from journal");
        }
        return;
    }

    let shape = intent.shape();
    let merged = ctx
        .intent_manager
        .try_merge(shape, intent.market_idx, intent.id, intent.init_amount(), current.from_amount())
        .await;

    if merged.is_some() {
        info!(id = ?intent.id, "unfilled residue merged into a sibling intent");
    } else {
        let (market_str, side_str) =
            TransactionIntent::journal_key(current.market(), current.order_type());
        if let Err(err) = ctx.journal.add_unfilled_amount(&market_str, &side_str, current.from_amount()).await {
            warn!(id = ?intent.id, ?err, "failed to persist unfilled residue");
        }
    }

    if let Err(err) = ctx.journal.remove_active_transaction(intent.id).await {
        warn!(id = ?intent.id, ?err, "failed to remove unfilled intent from journal");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn market(base: &str, quote: &str) -> Market {
        Market::new(Currency::new(base), Currency::new(quote))
    }

    fn three_step_markets() -> Vec<TranIntentMarket> {
        vec![
            TranIntentMarket::Completed {
                market: market("BTC", "USDT"),
                speed: Speed::Instant,
                from_currency: Currency::new("USDT"),
                trades: vec![BareTrade::new(dec!(0.00555555), dec!(9000), dec!(0.999))],
            },
            TranIntentMarket::PartiallyCompleted {
                market: market("ETH", "BTC"),
                speed: Speed::Instant,
                from_currency: Currency::new("BTC"),
                from_amount: dec!(0.00554999),
            },
            TranIntentMarket::Predicted {
                market: market("ETH", "USDC"),
                speed: Speed::Instant,
                from_currency: Currency::new("ETH"),
            },
        ]
    }

    #[test]
    fn merge_at_zero_adds_directly_to_step_zero() {
        let markets = vec![TranIntentMarket::Predicted {
            market: market("BTC", "USDT"),
            speed: Speed::Instant,
            from_currency: Currency::new("USDT"),
        }];
        let merged = merge_markets(&markets, 0, dec!(10), dec!(10));
        assert_eq!(merged[0].from_amount(), dec!(10));
    }

    #[test]
    fn merge_at_nonzero_step_appends_adjustment_trades() {
        let markets = three_step_markets();
        let before_target = markets[0].target_amount();
        let merged = merge_markets(&markets, 1, dec!(1), dec!(0.0001));

        assert_eq!(merged[0].target_amount(), before_target);
        assert_eq!(merged[0].from_amount(), markets[0].from_amount() + dec!(1));
        assert_eq!(merged[1].from_amount(), markets[1].from_amount() + dec!(0.0001));
    }

    #[test]
    fn split_markets_preserves_amount_conservation_in_both_branches() {
        let markets = three_step_markets();
        let trades = vec![BareTrade::new(dec!(0.09), dec!(0.05), dec!(0.999))];
        let (remaining, committed) = split_markets(&markets, 1, trades.clone());

        let order_type = markets[1].order_type();
        let consumed = sum_from_amount(&trades, order_type);

        assert_eq!(
            remaining[1].from_amount() + consumed,
            round_down(markets[1].from_amount())
        );
        assert_eq!(committed[1].from_amount(), consumed);
        assert_eq!(committed[2].from_amount(), committed[1].target_amount());

        // Step 0 conservation: committed + remaining trades' from_amount equal the original.
        let original_from: Decimal = markets[0].from_amount();
        let committed_from = committed[0].from_amount();
        let remaining_from = remaining[0].from_amount();
        assert_eq!(committed_from + remaining_from, original_from);
    }

    #[test]
    fn split_markets_at_last_step_has_no_child_seed() {
        let markets = three_step_markets();
        let trades = vec![BareTrade::new(dec!(1), dec!(180), dec!(0.999))];
        let (_, committed) = split_markets(&markets, 2, trades);
        assert!(matches!(committed[2], TranIntentMarket::Completed { .. }));
    }
}
