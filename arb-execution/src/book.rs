use arb_instrument::{FeeMultiplier, Market};
use arb_integration::exchange::{ExchangeClient, OrderBookAbstract};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Grace period the cache keeps an upstream subscription alive after its last subscriber drops,
/// in case a new path subscribes to the same market moments later.
const UPSTREAM_TEARDOWN_GRACE: Duration = Duration::from_secs(5);

/// Lazily-multiplexed, reference-counted "latest value" view of a market's order book and fee
/// schedule. One upstream subscription per market regardless of how many Processors/Intents read
/// it; late subscribers immediately see the most recent snapshot via `watch::Receiver`.
pub struct OrderBookCache<C> {
    client: Arc<C>,
    books: Mutex<HashMap<Market, Entry<OrderBookAbstract>>>,
    fees: Mutex<HashMap<Market, Entry<FeeMultiplier>>>,
}

struct Entry<T> {
    rx: watch::Receiver<T>,
    subscriber_count: Arc<Mutex<usize>>,
}

impl<T> Clone for Entry<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
            subscriber_count: self.subscriber_count.clone(),
        }
    }
}

/// RAII handle returned to a caller of [`OrderBookCache::subscribe_book`] /
/// [`OrderBookCache::subscribe_fee`]. Dropping it decrements the refcount and, once it reaches
/// zero, starts the upstream teardown grace timer.
pub struct Subscription<T> {
    pub rx: watch::Receiver<T>,
    count: Arc<Mutex<usize>>,
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
    }
}

impl<C> OrderBookCache<C>
where
    C: ExchangeClient,
{
    pub fn new(client: Arc<C>) -> Self {
        Self {
            client,
            books: Mutex::new(HashMap::new()),
            fees: Mutex::new(HashMap::new()),
        }
    }

    pub async fn subscribe_book(
        self: &Arc<Self>,
        market: &Market,
    ) -> Result<Subscription<OrderBookAbstract>, arb_integration::ExchangeApiError> {
        if let Some(entry) = self.books.lock().get(market).cloned() {
            *entry.subscriber_count.lock() += 1;
            return Ok(Subscription {
                rx: entry.rx,
                count: entry.subscriber_count,
            });
        }

        let mut upstream = self.client.order_book_stream(market).await?;
        let initial = upstream.recv().await.unwrap_or_default();
        let (tx, rx) = watch::channel(initial);
        let subscriber_count = Arc::new(Mutex::new(1));

        self.spawn_book_relay(market.clone(), upstream, tx, subscriber_count.clone());

        self.books.lock().insert(
            market.clone(),
            Entry {
                rx: rx.clone(),
                subscriber_count: subscriber_count.clone(),
            },
        );

        Ok(Subscription {
            rx,
            count: subscriber_count,
        })
    }

    pub async fn subscribe_fee(
        self: &Arc<Self>,
        market: &Market,
    ) -> Result<Subscription<FeeMultiplier>, arb_integration::ExchangeApiError> {
        if let Some(entry) = self.fees.lock().get(market).cloned() {
            *entry.subscriber_count.lock() += 1;
            return Ok(Subscription {
                rx: entry.rx,
                count: entry.subscriber_count,
            });
        }

        let mut upstream = self.client.fee_stream(market).await?;
        let initial = upstream
            .recv()
            .await
            .unwrap_or(FeeMultiplier::new(Default::default(), Default::default()));
        let (tx, rx) = watch::channel(initial);
        let subscriber_count = Arc::new(Mutex::new(1));

        let market_owned = market.clone();
        let count_for_task = subscriber_count.clone();
        let cache = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    fee = upstream.recv() => {
                        let Some(fee) = fee else {
                            debug!(%market_owned, "fee stream upstream ended");
                            break;
                        };
                        if tx.send(fee).is_err() {
                            break;
                        }
                    }
                }
                if *count_for_task.lock() == 0 {
                    tokio::time::sleep(UPSTREAM_TEARDOWN_GRACE).await;
                    if *count_for_task.lock() == 0 {
                        debug!(%market_owned, "tearing down idle fee subscription");
                        break;
                    }
                }
            }
            // Remove the stale entry so the next subscriber triggers a fresh upstream
            // subscription instead of being handed a receiver whose producer is dead. Only
            // remove it if it still belongs to this task - a fresh subscribe may have already
            // replaced it.
            let mut fees = cache.fees.lock();
            if fees.get(&market_owned).is_some_and(|e| Arc::ptr_eq(&e.subscriber_count, &count_for_task)) {
                fees.remove(&market_owned);
            }
        });

        self.fees.lock().insert(
            market.clone(),
            Entry {
                rx: rx.clone(),
                subscriber_count: subscriber_count.clone(),
            },
        );

        Ok(Subscription {
            rx,
            count: subscriber_count,
        })
    }

    fn spawn_book_relay(
        self: &Arc<Self>,
        market: Market,
        mut upstream: tokio::sync::mpsc::UnboundedReceiver<OrderBookAbstract>,
        tx: watch::Sender<OrderBookAbstract>,
        subscriber_count: Arc<Mutex<usize>>,
    ) {
        let cache = self.clone();
        tokio::spawn(async move {
            loop {
                match upstream.recv().await {
                    Some(book) => {
                        if tx.send(book).is_err() {
                            break;
                        }
                    }
                    None => {
                        warn!(%market, "order book upstream ended, no reconnect scheduled by cache itself");
                        break;
                    }
                }

                if *subscriber_count.lock() == 0 {
                    tokio::time::sleep(UPSTREAM_TEARDOWN_GRACE).await;
                    if *subscriber_count.lock() == 0 {
                        debug!(%market, "tearing down idle order book subscription");
                        break;
                    }
                }
            }
            // Same compare-and-remove as the fee task: only drop the entry if it's still ours.
            let mut books = cache.books.lock();
            if books.get(&market).is_some_and(|e| Arc::ptr_eq(&e.subscriber_count, &subscriber_count)) {
                books.remove(&market);
            }
        });
    }
}
