use crate::{
    enumerator::PathEnumerator,
    intent::{self, IntentContext, TransactionIntent},
    market::TranIntentMarket,
};
use arb_instrument::Currency;
use arb_integration::exchange::{ExchangeClient, OrderId};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Out-of-scope collaborator (spec §1): a balance service the trader polls to learn how much of
/// each currency is actually free on the exchange. A concrete implementation applies
/// `BalanceUpdate` notification deltas onto the last REST snapshot; this crate only consumes it.
#[async_trait]
pub trait BalanceSource: Send + Sync + 'static {
    async fn available(&self, currency: &Currency) -> Decimal;
}

/// Knobs that govern the trader loop itself, as distinct from [`crate::intent::IntentConfig`]
/// which governs one running intent. Maps 1:1 onto spec §6's configuration surface.
#[derive(Debug, Clone)]
pub struct TraderConfig {
    pub primary_currencies: Vec<Currency>,
    pub fixed_reserve: HashMap<Currency, Decimal>,
    pub min_trade_amount: Decimal,
    pub path_find_interval: Duration,
    pub blacklist_sweep_interval: Duration,
}

/// The top-level component: ticks on `path_find_interval`, reserves balance, spawns new intents
/// for the best path(s) it can afford, and on startup resumes every `active_transactions` row
/// left by a previous crash rather than replanning everything from scratch.
pub struct Trader<C, E, B> {
    ctx: IntentContext<C, E>,
    balance: Arc<B>,
    config: Arc<TraderConfig>,
}

impl<C, E, B> Trader<C, E, B>
where
    C: ExchangeClient,
    E: PathEnumerator,
    B: BalanceSource,
{
    pub fn new(ctx: IntentContext<C, E>, balance: Arc<B>, config: TraderConfig) -> Self {
        Self { ctx, balance, config: Arc::new(config) }
    }

    /// Drive the trader until `shutdown` reports `true`. Recovers journaled state first, then
    /// alternates path-find ticks with a blacklist sweep until told to stop; in-flight intents are
    /// left running so they reach a safe persisted state on their own (spec §5 cancellation
    /// semantics) rather than being torn down here.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        self.recover().await;

        let mut path_find_tick = tokio::time::interval(self.config.path_find_interval);
        let mut blacklist_tick = tokio::time::interval(self.config.blacklist_sweep_interval);

        loop {
            tokio::select! {
                _ = path_find_tick.tick() => self.tick().await,
                _ = blacklist_tick.tick() => self.sweep_blacklist().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("trader loop received shutdown signal, ceasing new ticks");
                        return;
                    }
                }
            }
        }
    }

    /// Crash-recovery pass: cancel/resume any resting Delayed-Trade order (the Processor side's
    /// `POWER_ON_RECOVERY`) and resume every `active_transactions` row at its exact
    /// `(id, marketIdx)` - spec §8's "idempotent recovery" invariant.
    async fn recover(&self) {
        match self.ctx.journal.list_order_ids().await {
            Ok(rows) => {
                for row in rows {
                    let Ok(side) = row.side.parse() else { continue };
                    let Some(market) = parse_market(&row.market) else { continue };
                    if let Err(err) = self
                        .ctx
                        .delayed_manager
                        .ensure_running(market, side, Some(OrderId(row.order_id)))
                        .await
                    {
                        warn!(market = %row.market, side = %row.side, ?err, "failed to recover resting order");
                    }
                }
            }
            Err(err) => warn!(?err, "failed to list resting order ids at startup"),
        }

        let rows = match self.ctx.journal.list_active_transactions().await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(?err, "failed to list active transactions at startup, starting with none resumed");
                return;
            }
        };

        info!(count = rows.len(), "resuming journaled transaction intents");
        for row in rows {
            match serde_json::from_value::<TransactionIntent>(row.state) {
                Ok(intent) => {
                    let ctx = self.ctx.clone();
                    tokio::spawn(async move { intent::run(intent, ctx).await });
                }
                Err(err) => warn!(id = %row.id, ?err, "failed to deserialize journaled intent, leaving it untouched"),
            }
        }
    }

    /// One path-find tick: for each primary currency with spare balance above
    /// `min_trade_amount`, ask the enumerator for its best candidate path and spawn a fresh
    /// intent for it.
    async fn tick(&self) {
        info!(currencies = self.config.primary_currencies.len(), "path-find tick");
        for currency in &self.config.primary_currencies {
            let spendable = match self.spendable(currency).await {
                Ok(amount) => amount,
                Err(err) => {
                    warn!(%currency, ?err, "failed to compute spendable balance, skipping this tick");
                    continue;
                }
            };

            if spendable < self.config.min_trade_amount {
                continue;
            }

            let in_flight = self.ctx.intent_manager.in_flight_shapes();
            let candidates = self
                .ctx
                .enumerator
                .enumerate(currency, spendable, &self.config.primary_currencies, &in_flight)
                .await;

            let Some(path) = candidates.into_iter().next() else {
                debug!(%currency, "no profitable path found this tick");
                continue;
            };

            let markets: Vec<TranIntentMarket> = path
                .chain
                .into_iter()
                .map(|order| TranIntentMarket::Predicted {
                    market: order.market,
                    speed: order.speed,
                    from_currency: order.from_currency,
                })
                .collect();

            let Some(first) = markets.first().cloned() else { continue };
            let mut markets = markets;
            markets[0] = first.with_from_amount(spendable);

            let intent = TransactionIntent::new(Uuid::new_v4(), markets);
            info!(id = %intent.id, %currency, %spendable, "starting new transaction intent");

            let ctx = self.ctx.clone();
            tokio::spawn(async move { intent::run(intent, ctx).await });
        }
    }

    /// Available balance for `currency` minus the configured fixed reserve and whatever is
    /// already committed to an in-flight step of that currency (spec SPEC_FULL §3's
    /// `reserved_amount`), summed directly off `active_transactions.from_currency`/`from_amount`
    /// rather than deserializing every row's `state`.
    async fn spendable(&self, currency: &Currency) -> Result<Decimal, arb_journal::JournalError> {
        let available = self.balance.available(currency).await;
        let reserve = self.config.fixed_reserve.get(currency).copied().unwrap_or(Decimal::ZERO);
        let reserved = self.ctx.journal.reserved_amount(&currency.to_string()).await?;
        Ok((available - reserve - reserved).max(Decimal::ZERO))
    }

    async fn sweep_blacklist(&self) {
        match self.ctx.journal.sweep_expired_blacklist().await {
            Ok(0) => {}
            Ok(n) => debug!(reaped = n, "swept expired blacklist entries"),
            Err(err) => warn!(?err, "failed to sweep expired blacklist entries"),
        }
    }
}

fn parse_market(raw: &str) -> Option<arb_instrument::Market> {
    let (base, quote) = raw.split_once('_')?;
    Some(arb_instrument::Market::new(Currency::new(base), Currency::new(quote)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_market_round_trips_display_format() {
        let market = arb_instrument::Market::new(Currency::new("BTC"), Currency::new("USDT"));
        assert_eq!(parse_market(&market.to_string()), Some(market));
    }

    #[test]
    fn parse_market_rejects_malformed_input() {
        assert!(parse_market("not-a-market").is_none());
    }
}
