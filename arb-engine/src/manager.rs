use crate::market::{shape_hash, TranIntentMarket};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// A merge request sent to a live intent: `(init_delta, current_delta, ack)`. `init_delta` is
/// added to the residue's contribution at step 0, `current_delta` to the intent's current step;
/// `ack` carries back whether the target intent accepted it (its underlying reservation may have
/// already closed).
pub type MergeRequest = (Decimal, Decimal, oneshot::Sender<bool>);

struct Entry {
    shape: u64,
    market_idx: usize,
    merge_tx: mpsc::UnboundedSender<MergeRequest>,
}

/// Thread-safe registry of every live Transaction Intent, indexed both by id (for removal) and by
/// `(marketsShape, marketIdx)` (for merge candidate lookup). Two intents with the same shape and
/// current step index are interchangeable merge targets - merging keeps one running and folds the
/// other's amount into it instead of placing a second, redundant reservation.
#[derive(Default)]
pub struct IntentManager {
    entries: Mutex<HashMap<Uuid, Entry>>,
}

impl IntentManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly-started intent's merge inbox. Replaces any prior registration for `id`.
    pub fn register(
        &self,
        id: Uuid,
        markets: &[TranIntentMarket],
        market_idx: usize,
        merge_tx: mpsc::UnboundedSender<MergeRequest>,
    ) {
        self.entries.lock().insert(
            id,
            Entry { shape: shape_hash(markets), market_idx, merge_tx },
        );
    }

    pub fn unregister(&self, id: Uuid) {
        self.entries.lock().remove(&id);
    }

    /// Shape hashes of every currently-registered intent, used by the Path Enumerator boundary to
    /// filter out paths already in flight.
    pub fn in_flight_shapes(&self) -> Vec<u64> {
        self.entries.lock().values().map(|e| e.shape).collect()
    }

    /// Try every merge candidate sharing `shape`/`market_idx` (skipping `exclude`) in registration
    /// order until one accepts, returning its id.
    pub async fn try_merge(
        &self,
        shape: u64,
        market_idx: usize,
        exclude: Uuid,
        init_delta: Decimal,
        current_delta: Decimal,
    ) -> Option<Uuid> {
        let candidates: Vec<(Uuid, mpsc::UnboundedSender<MergeRequest>)> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .filter(|(id, e)| **id != exclude && e.shape == shape && e.market_idx == market_idx)
                .map(|(id, e)| (*id, e.merge_tx.clone()))
                .collect()
        };

        for (id, tx) in candidates {
            let (ack_tx, ack_rx) = oneshot::channel();
            if tx.send((init_delta, current_delta, ack_tx)).is_err() {
                continue;
            }
            if let Ok(true) = ack_rx.await {
                return Some(id);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arb_instrument::{Currency, Market, Speed};

    fn markets() -> Vec<TranIntentMarket> {
        vec![TranIntentMarket::Predicted {
            market: Market::new(Currency::new("BTC"), Currency::new("USDT")),
            speed: Speed::Instant,
            from_currency: Currency::new("USDT"),
        }]
    }

    #[tokio::test]
    async fn try_merge_skips_excluded_and_returns_first_accepting() {
        let manager = IntentManager::new();
        let markets = markets();

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let a = Uuid::new_v4();
        manager.register(a, &markets, 0, tx_a);

        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let b = Uuid::new_v4();
        manager.register(b, &markets, 0, tx_b);

        tokio::spawn(async move {
            if let Some((_, _, ack)) = rx_a.recv().await {
                let _ = ack.send(false);
            }
        });
        tokio::spawn(async move {
            if let Some((_, _, ack)) = rx_b.recv().await {
                let _ = ack.send(true);
            }
        });

        let exclude = Uuid::new_v4();
        let accepted = manager
            .try_merge(shape_hash(&markets), 0, exclude, Decimal::ONE, Decimal::ONE)
            .await;
        assert!(accepted.is_some());
    }

    #[tokio::test]
    async fn try_merge_returns_none_with_no_candidates() {
        let manager = IntentManager::new();
        let accepted = manager.try_merge(123, 0, Uuid::new_v4(), Decimal::ONE, Decimal::ONE).await;
        assert!(accepted.is_none());
    }
}
