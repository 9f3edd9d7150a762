use crate::error::{ProcessorError, SchedulerRejected};
use arb_amount::{split_trade, AmountType, BareTrade};
use arb_instrument::Side;
use arb_integration::channel::{mpsc_unbounded, ChannelState, ChannelTxDroppable, UnboundedTx};
use indexmap::IndexMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, trace};
use uuid::Uuid;

/// Item delivered to a registered path: either a trade attributed to it, or the terminal error a
/// `unregisterAll` force-close carried.
pub type SchedulerItem = Result<BareTrade, ProcessorError>;

/// Marker error satisfying [`arb_integration::channel::Tx`]'s bound - attribution only cares
/// whether a send succeeded, never why it failed, so nothing is carried inside.
#[derive(Debug, Clone)]
pub struct SchedulerSendError;

impl From<mpsc::error::SendError<SchedulerItem>> for SchedulerSendError {
    fn from(_: mpsc::error::SendError<SchedulerItem>) -> Self {
        Self
    }
}

type EntryTx = ChannelTxDroppable<UnboundedTx<SchedulerItem, SchedulerSendError>>;

struct Entry {
    remaining: Decimal,
    out: EntryTx,
}

impl Entry {
    fn is_closed(&self) -> bool {
        !self.out.is_active()
    }

    fn send(&mut self, item: SchedulerItem) {
        self.out.send(item);
    }

    fn close(&mut self) {
        self.out.state = ChannelState::Disabled;
    }
}

struct ExitIntent {
    id: Uuid,
    ack: Option<oneshot::Sender<()>>,
}

struct Inner {
    entries: IndexMap<Uuid, Entry>,
    exit_intent: Option<ExitIntent>,
}

/// Per-`(market, side)` registry mapping live paths to their share of a single pooled order
///. All mutating operations take the same mutex, and attribution walks entries in a
/// fixed insertion order - this is what lets `addTrades` deliver full-fit trades deterministically
/// to the earliest-registered path still holding unconsumed reservation.
pub struct TradeScheduler {
    inner: Mutex<Inner>,
    common_tx: watch::Sender<Decimal>,
    order_type: Side,
}

impl TradeScheduler {
    pub fn new(order_type: Side) -> Self {
        let (common_tx, _) = watch::channel(Decimal::ZERO);
        Self {
            inner: Mutex::new(Inner {
                entries: IndexMap::new(),
                exit_intent: None,
            }),
            common_tx,
            order_type,
        }
    }

    /// Latest-value view of `commonFromAmount`, driving the Delayed-Trade Processor worker.
    pub fn common_from_amount(&self) -> watch::Receiver<Decimal> {
        self.common_tx.subscribe()
    }

    pub fn register(&self, id: Uuid) -> mpsc::UnboundedReceiver<SchedulerItem> {
        let (tx, rx) = mpsc_unbounded();
        let mut inner = self.inner.lock();
        inner.entries.insert(
            id,
            Entry {
                remaining: Decimal::ZERO,
                out: ChannelTxDroppable::new(tx),
            },
        );
        rx
    }

    pub fn add_amount(&self, id: Uuid, delta: Decimal) -> Result<(), SchedulerRejected> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(&id) else {
            return Err(SchedulerRejected(id));
        };
        if entry.is_closed() {
            return Err(SchedulerRejected(id));
        }
        entry.remaining += delta;
        self.publish_common(&inner);
        Ok(())
    }

    /// Two-phase unregister: the path's reservation is excluded from the published
    /// `commonFromAmount` immediately, but the entry stays live for attribution until the
    /// Processor calls [`Self::ack_exit`] from a safe state.
    pub async fn unregister(&self, id: Uuid) {
        let ack_rx = {
            let mut inner = self.inner.lock();
            if !inner.entries.contains_key(&id) {
                return;
            }
            let (ack_tx, ack_rx) = oneshot::channel();
            inner.exit_intent = Some(ExitIntent {
                id,
                ack: Some(ack_tx),
            });
            self.publish_common(&inner);
            ack_rx
        };

        let _ = ack_rx.await;

        let mut inner = self.inner.lock();
        if let Some(mut entry) = inner.entries.shift_remove(&id) {
            entry.close();
        }
        inner.exit_intent = None;
        self.publish_common(&inner);
    }

    /// Called by the Delayed-Trade Processor once it has repositioned/cancelled to a state safe
    /// for the exiting path's reservation to disappear.
    pub fn ack_exit(&self, id: Uuid) {
        let mut inner = self.inner.lock();
        if let Some(exit) = &mut inner.exit_intent {
            if exit.id == id {
                if let Some(ack) = exit.ack.take() {
                    let _ = ack.send(());
                }
            }
        }
    }

    pub fn pending_exit(&self) -> Option<Uuid> {
        self.inner.lock().exit_intent.as_ref().map(|e| e.id)
    }

    /// Attribute each incoming trade to the paths that reserved it.
    pub fn add_trades(&self, trades: impl IntoIterator<Item = BareTrade>) {
        let mut inner = self.inner.lock();
        for trade in trades {
            self.attribute_one(&mut inner, trade);
        }
        self.publish_common(&inner);
    }

    /// Force-close every registered path with a terminal error, used when the Processor hits a
    /// fatal exchange error.
    pub fn unregister_all(&self, err: ProcessorError) {
        let mut inner = self.inner.lock();
        for (_, entry) in inner.entries.iter_mut() {
            entry.send(Err(err.clone()));
            entry.close();
        }
        inner.entries.clear();
        inner.exit_intent = None;
        self.publish_common(&inner);
    }

    fn publish_common(&self, inner: &Inner) {
        let exiting = inner.exit_intent.as_ref().map(|e| e.id);
        let common: Decimal = inner
            .entries
            .iter()
            .filter(|(id, _)| Some(**id) != exiting)
            .map(|(_, e)| e.remaining)
            .sum();
        let _ = self.common_tx.send(common);
    }

    fn attribute_one(&self, inner: &mut Inner, trade: BareTrade) {
        let trade_from = trade.from_amount(self.order_type);
        let exiting = inner.exit_intent.as_ref().map(|e| e.id);

        // Pass 1: deliver the whole trade to the first non-exiting entry it fits inside.
        for (id, entry) in inner.entries.iter_mut() {
            if Some(*id) == exiting {
                continue;
            }
            if entry.remaining.is_zero() || entry.is_closed() {
                continue;
            }
            if trade_from <= entry.remaining {
                entry.remaining -= trade_from;
                entry.send(Ok(trade));
                if entry.remaining.is_zero() {
                    entry.close();
                }
                return;
            }
        }

        // Pass 2: the trade is bigger than any single entry - carve it across non-exiting entries
        // in order. The exiting path already told the Scheduler it's leaving and must not receive
        // a carved partial fill.
        let mut remainder = trade;
        let ids: Vec<Uuid> = inner
            .entries
            .keys()
            .copied()
            .filter(|id| Some(*id) != exiting)
            .collect();
        for id in ids {
            if remainder.from_amount(self.order_type).is_zero() {
                break;
            }
            let Some(entry) = inner.entries.get_mut(&id) else {
                continue;
            };
            if entry.remaining.is_zero() || entry.is_closed() {
                continue;
            }

            let cut = entry.remaining;
            let split = split_trade(remainder, self.order_type, AmountType::From, cut);

            entry.remaining = Decimal::ZERO;
            entry.send(Ok(split.left));
            if let Some(adj) = split.left_adjustment {
                entry.send(Ok(adj));
            }
            entry.close();

            remainder = split.right;
        }

        let leftover = remainder.from_amount(self.order_type);
        if !leftover.is_zero() {
            error!(
                order_type = ?self.order_type,
                leftover = %leftover,
                "unattributable trade: Processor filled quantity no registered path reserved"
            );
        } else {
            trace!("trade fully attributed across entries");
        }
    }
}
