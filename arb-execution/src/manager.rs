use crate::{
    book::OrderBookCache,
    processor::{DelayedTradeProcessor, PauseAcks},
    scheduler::TradeScheduler,
};
use arb_instrument::{Market, Side};
use arb_integration::exchange::{AccountNotification, ExchangeClient, OrderId};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Live state for one `(market, side)` pair with an active Delayed-Trade Processor worker.
struct Worker {
    scheduler: Arc<TradeScheduler>,
    notification_tx: mpsc::UnboundedSender<AccountNotification>,
    pause_tx: watch::Sender<bool>,
    pause_acks: Arc<PauseAcks>,
}

/// RAII handle held by an Instant step for the duration it needs the opposite-side Processor held
/// off the book. Unpauses on drop regardless of how the Instant step finishes.
pub struct PauseGuard {
    pause_tx: Option<watch::Sender<bool>>,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        if let Some(tx) = &self.pause_tx {
            let _ = tx.send(false);
        }
    }
}

/// Owns the lifecycle of every Delayed-Trade Processor worker: lazily spawns one the first time a
/// path registers a reservation against a `(market, side)` pair, and tears it down once the
/// Processor reports it has reached `CANCEL_AND_IDLE` with nothing left to do. Also demultiplexes
/// the exchange's single account-notification stream to whichever worker(s) recognise the order.
pub struct DelayedTradeManager<C> {
    client: Arc<C>,
    book_cache: Arc<OrderBookCache<C>>,
    workers: Mutex<HashMap<(Market, Side), Worker>>,
}

impl<C> DelayedTradeManager<C>
where
    C: ExchangeClient,
{
    pub fn new(client: Arc<C>, book_cache: Arc<OrderBookCache<C>>) -> Arc<Self> {
        let manager = Arc::new(Self {
            client: client.clone(),
            book_cache,
            workers: Mutex::new(HashMap::new()),
        });
        manager.clone().spawn_notification_demux();
        manager
    }

    fn spawn_notification_demux(self: Arc<Self>) {
        let mut notifications = self.client.account_notifications();
        tokio::spawn(async move {
            while let Some(notification) = notifications.recv().await {
                self.broadcast(notification);
            }
            debug!("account notification stream ended, demux task exiting");
        });
    }

    fn broadcast(&self, notification: AccountNotification) {
        let mut workers = self.workers.lock();
        workers.retain(|key, worker| {
            if worker.notification_tx.send(notification.clone()).is_err() {
                debug!(market = %key.0, side = ?key.1, "dropping worker entry with a closed notification channel");
                return false;
            }
            true
        });
    }

    /// Ensure a Processor worker is running for `(market, side)` and return its [`TradeScheduler`],
    /// spawning one (optionally recovering a stale order left from a previous run) if absent.
    pub async fn ensure_running(
        self: &Arc<Self>,
        market: Market,
        side: Side,
        recovered_order_id: Option<OrderId>,
    ) -> Result<Arc<TradeScheduler>, arb_integration::error::ExchangeApiError> {
        {
            let workers = self.workers.lock();
            if let Some(worker) = workers.get(&(market.clone(), side)) {
                return Ok(worker.scheduler.clone());
            }
        }

        let scheduler = Arc::new(TradeScheduler::new(side));
        let book_subscription = self.book_cache.subscribe_book(&market).await?;
        let connection_rx: watch::Receiver<bool> = self.client.connection_state();
        let (notification_tx, notification_rx) = mpsc::unbounded_channel();
        let (pause_tx, pause_rx) = watch::channel(false);
        let pause_acks = Arc::new(PauseAcks::default());

        let processor = DelayedTradeProcessor::new(
            self.client.clone(),
            market.clone(),
            side,
            scheduler.clone(),
            book_subscription.rx.clone(),
            connection_rx,
            notification_rx,
            recovered_order_id,
            pause_rx,
            pause_acks.clone(),
        );

        let manager = self.clone();
        let key = (market.clone(), side);
        let worker_pause_acks = pause_acks.clone();
        tokio::spawn(async move {
            // Keep the book subscription alive for the worker's whole lifetime.
            let _book_subscription = book_subscription;
            if let Err(err) = processor.run().await {
                warn!(market = %key.0, side = ?key.1, ?err, "delayed-trade processor terminated with an error");
            }
            manager.workers.lock().remove(&key);
            // Release any pauser still awaiting an ack from this worker - it is never coming now.
            worker_pause_acks.drain();
            debug!(market = %key.0, side = ?key.1, "delayed-trade processor worker torn down");
        });

        self.workers.lock().insert(
            (market, side),
            Worker {
                scheduler: scheduler.clone(),
                notification_tx,
                pause_tx,
                pause_acks,
            },
        );

        Ok(scheduler)
    }

    /// Currently-running `(market, side)` pairs, used by crash recovery to avoid double-spawning.
    pub fn running(&self) -> Vec<(Market, Side)> {
        self.workers.lock().keys().cloned().collect()
    }

    /// Hold the `(market, side)` Processor's order off the book, awaiting the Processor's ack that
    /// it has actually cancelled (or was never live in the first place) before returning, so the
    /// caller is guaranteed the opposite order is off the book the moment this resolves. Returns a
    /// no-op (empty guard) if no worker is currently registered - an Instant step can't self-trade
    /// against a Processor that has no resting order.
    pub async fn pause(&self, market: &Market, side: Side) -> PauseGuard {
        let registered = {
            let workers = self.workers.lock();
            workers.get(&(market.clone(), side)).map(|worker| {
                let ack_rx = worker.pause_acks.push();
                let _ = worker.pause_tx.send(true);
                (worker.pause_tx.clone(), ack_rx)
            })
        };

        let Some((pause_tx, ack_rx)) = registered else {
            return PauseGuard { pause_tx: None };
        };

        let _ = ack_rx.await;
        PauseGuard { pause_tx: Some(pause_tx) }
    }
}
