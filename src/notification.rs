//! Events flowing from the data store through the registry to each session
//!
//! The store raises global [`Notification`]s. The registry's outer stage turns
//! each one into per-session [`NotificationPacket`]s, and a session turns a
//! packet into a [`CallbackMessage`] for its client.

use crate::types::{LedgerEntry, TxHash, ZcTx};
use crossbeam_channel::Sender;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBlockEvent {
    pub height: u32,
    /// Transactions that left the mempool with this block
    pub confirmed: Vec<TxHash>,
}

/// Mempool transactions relevant to one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZcNotificationPacket {
    pub bdv_id: String,
    pub txs: Vec<ZcTx>,
}

/// A global event raised by the data store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    NewBlock(NewBlockEvent),
    ZeroConf(ZcNotificationPacket),
    ZcError {
        bdv_id: String,
        message: String,
        tx_hash: TxHash,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    NewBlock(Arc<NewBlockEvent>),
    ZeroConf(Vec<ZcTx>),
    Error { message: String, tx_hash: TxHash },
}

/// Per-session delivery unit produced by the outer notification stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationPacket {
    pub bdv_id: String,
    pub event: SessionEvent,
}

/// What a client receives on its callback channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CallbackMessage {
    #[serde(rename_all = "camelCase")]
    Ready { top_height: u32 },
    #[serde(rename_all = "camelCase")]
    NewBlock { height: u32 },
    #[serde(rename_all = "camelCase")]
    ZeroConf {
        wallet_ids: Vec<String>,
        entries: Vec<LedgerEntry>,
    },
    #[serde(rename_all = "camelCase")]
    Refresh { wallet_ids: Vec<String> },
    #[serde(rename_all = "camelCase")]
    Error { message: String, tx_hash: TxHash },
    Terminate,
}

/// Item-or-sentinel envelope carried by every worker queue.
#[derive(Debug)]
pub(crate) enum Queued<T> {
    Item(T),
    Shutdown,
}

/// Handle the data store uses to feed the registry's outer notification queue.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    tx: Sender<Queued<Notification>>,
}

impl NotificationSink {
    pub(crate) fn new(tx: Sender<Queued<Notification>>) -> Self {
        Self { tx }
    }

    /// Returns false once the registry side is gone.
    pub fn notify(&self, notification: Notification) -> bool {
        self.tx.send(Queued::Item(notification)).is_ok()
    }
}
