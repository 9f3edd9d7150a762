use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use tracing::warn;

/// Uniform send interface over the three channel flavours the engine uses: rendezvous (bounded
/// `1`), latest-value-only (`watch`, used for order book and `commonFromAmount` conflation), and
/// unbounded (the Scheduler -> Intent trade hand-off, whose only consumer never backpressures the
/// Scheduler's single writer task).
pub trait Tx
where
    Self: Clone + Send,
{
    type Item;
    type Error;
    fn send(&self, item: Self::Item) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone)]
pub struct UnboundedTx<T, Error> {
    pub tx: tokio::sync::mpsc::UnboundedSender<T>,
    phantom: PhantomData<Error>,
}

impl<T, Error> UnboundedTx<T, Error> {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<T>) -> Self {
        Self {
            tx,
            phantom: PhantomData,
        }
    }
}

impl<T, Error> Tx for UnboundedTx<T, Error>
where
    T: Clone + Send,
    Error: From<tokio::sync::mpsc::error::SendError<T>> + Clone + Send,
{
    type Item = T;
    type Error = Error;

    fn send(&self, item: Self::Item) -> Result<(), Self::Error> {
        self.tx.send(item).map_err(Error::from)
    }
}

pub fn mpsc_unbounded<T, Error>() -> (UnboundedTx<T, Error>, tokio::sync::mpsc::UnboundedReceiver<T>)
{
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    (UnboundedTx::new(tx), rx)
}

/// A channel handle that silently disables itself once its receiver drops, instead of every send
/// site having to handle the error. Mirrors the Scheduler's requirement that a closed output
/// channel is a normal "path has exited" signal, not a fault.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Display)]
pub enum ChannelState<Tx> {
    Active(Tx),
    Disabled,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct ChannelTxDroppable<ChannelTx> {
    pub state: ChannelState<ChannelTx>,
}

impl<ChannelTx> ChannelTxDroppable<ChannelTx> {
    pub fn new(tx: ChannelTx) -> Self {
        Self {
            state: ChannelState::Active(tx),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, ChannelState::Active(_))
    }
}

impl<ChannelTx> ChannelTxDroppable<ChannelTx>
where
    ChannelTx: Tx,
{
    /// Send `item`, disabling the channel for all future sends if the receiver has gone away.
    /// Returns whether the send succeeded - callers that need to know an entry just closed (eg/
    /// the Scheduler deciding whether to remove an entry) use the return value.
    pub fn send(&mut self, item: ChannelTx::Item) -> bool {
        let ChannelState::Active(tx) = &self.state else {
            return false;
        };

        if tx.send(item).is_err() {
            let name = std::any::type_name::<ChannelTx::Item>();
            warn!(name, "channel receiver dropped, disabling further sends");
            self.state = ChannelState::Disabled;
            false
        } else {
            true
        }
    }
}
