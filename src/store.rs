//! Contract with the shared blockchain data store
//!
//! The registry only needs a narrow view of the store: address scans, balance
//! and history lookups, and a way to receive block and mempool events.
//! [`MemoryStore`] is a self-contained implementation used by the demo server
//! and the test suite.

use crate::error::ViewError;
use crate::notification::{NewBlockEvent, Notification, NotificationSink, ZcNotificationPacket};
use crate::types::{LedgerEntry, ScrAddr, TxHash, TxOut, ZcTx};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Callbacks the store invokes while processing mempool transactions.
pub trait ZeroConfCallbacks: Send + Sync {
    /// Ids of the sessions tracking this address.
    fn has_scr_addr(&self, scr_addr: &ScrAddr) -> BTreeSet<String>;
    fn push_zc_notification(&self, packet: ZcNotificationPacket);
    fn error_callback(&self, bdv_id: &str, error: String, tx_hash: &str);
}

pub trait BlockDataStore: Send + Sync {
    fn top_block_height(&self) -> u32;

    /// Bring the given addresses under tracking. `is_new` wallets have no
    /// history to scan for.
    fn scan_addresses(&self, addrs: &[ScrAddr], is_new: bool) -> Result<(), ViewError>;

    fn address_balance(&self, addr: &ScrAddr) -> u64;

    fn balance(&self, addrs: &[ScrAddr]) -> u64 {
        addrs
            .iter()
            .map(|a| self.address_balance(a))
            .fold(0, u64::saturating_add)
    }

    /// Confirmed history for the address set, one entry per transaction,
    /// newest first.
    fn history(&self, addrs: &[ScrAddr]) -> Vec<LedgerEntry>;

    fn register_zc_callbacks(&self, callbacks: Arc<dyn ZeroConfCallbacks>);

    fn register_notification_sink(&self, sink: NotificationSink);
}

#[derive(Default)]
struct MemoryStoreInner {
    height: u32,
    balances: HashMap<ScrAddr, u64>,
    history: HashMap<ScrAddr, Vec<LedgerEntry>>,
    mempool: BTreeMap<TxHash, ZcTx>,
    scanned: HashSet<ScrAddr>,
    next_nonce: u64,
    scan_failure: Option<String>,
    scan_delay: Duration,
}

/// In-memory store holding balances, history and a mempool.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryStoreInner>>,
    callbacks: Arc<RwLock<Option<Arc<dyn ZeroConfCallbacks>>>>,
    sinks: Arc<RwLock<Vec<NotificationSink>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a transaction with a fresh hash over its outputs.
    pub fn build_tx(&self, outputs: Vec<TxOut>) -> ZcTx {
        let nonce = {
            let mut inner = self.inner.write();
            inner.next_nonce += 1;
            inner.next_nonce
        };
        let mut hasher = Sha256::new();
        for out in &outputs {
            hasher.update(out.scr_addr.as_str().as_bytes());
            hasher.update(out.value.to_le_bytes());
        }
        hasher.update(nonce.to_le_bytes());
        ZcTx {
            hash: hex::encode(hasher.finalize()),
            outputs,
        }
    }

    /// Accept a transaction into the mempool and notify the sessions it pays.
    ///
    /// Returns the number of sessions notified.
    pub fn add_zero_conf(&self, tx: ZcTx) -> usize {
        self.inner.write().mempool.insert(tx.hash.clone(), tx.clone());

        let Some(callbacks) = self.callbacks.read().clone() else {
            return 0;
        };

        let mut interested = BTreeSet::new();
        for out in &tx.outputs {
            interested.extend(callbacks.has_scr_addr(&out.scr_addr));
        }
        for bdv_id in &interested {
            callbacks.push_zc_notification(ZcNotificationPacket {
                bdv_id: bdv_id.clone(),
                txs: vec![tx.clone()],
            });
        }
        debug!(tx = %tx.hash, sessions = interested.len(), "zero conf accepted");
        interested.len()
    }

    /// Drop a mempool transaction and report the failure to one session.
    pub fn reject_zero_conf(&self, bdv_id: &str, tx_hash: &str, reason: &str) {
        self.inner.write().mempool.remove(tx_hash);
        if let Some(callbacks) = self.callbacks.read().clone() {
            callbacks.error_callback(bdv_id, reason.to_string(), tx_hash);
        }
    }

    /// Confirm transactions in a new block and raise the block event.
    pub fn add_block(&self, txs: Vec<ZcTx>) -> u32 {
        let event = {
            let mut inner = self.inner.write();
            inner.height += 1;
            let height = inner.height;
            let timestamp = chrono::Utc::now().timestamp();

            let mut confirmed = Vec::with_capacity(txs.len());
            for tx in txs {
                inner.mempool.remove(&tx.hash);
                for out in &tx.outputs {
                    let balance = inner.balances.entry(out.scr_addr.clone()).or_insert(0);
                    *balance = balance.saturating_add(out.value);
                    inner
                        .history
                        .entry(out.scr_addr.clone())
                        .or_default()
                        .push(LedgerEntry::confirmed(
                            tx.hash.clone(),
                            out.value,
                            height,
                            timestamp,
                        ));
                }
                confirmed.push(tx.hash);
            }
            NewBlockEvent { height, confirmed }
        };

        let height = event.height;
        for sink in self.sinks.read().iter() {
            sink.notify(Notification::NewBlock(event.clone()));
        }
        height
    }

    pub fn mempool_len(&self) -> usize {
        self.inner.read().mempool.len()
    }

    pub fn is_scanned(&self, addr: &ScrAddr) -> bool {
        self.inner.read().scanned.contains(addr)
    }

    /// Make subsequent scans fail with the given reason.
    pub fn set_scan_failure(&self, reason: Option<String>) {
        self.inner.write().scan_failure = reason;
    }

    /// Make subsequent scans take at least this long.
    pub fn set_scan_delay(&self, delay: Duration) {
        self.inner.write().scan_delay = delay;
    }
}

impl BlockDataStore for MemoryStore {
    fn top_block_height(&self) -> u32 {
        self.inner.read().height
    }

    fn scan_addresses(&self, addrs: &[ScrAddr], is_new: bool) -> Result<(), ViewError> {
        let delay = self.inner.read().scan_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut inner = self.inner.write();
        if let Some(reason) = inner.scan_failure.clone() {
            return Err(ViewError::Store(reason));
        }
        inner.scanned.extend(addrs.iter().cloned());
        debug!(count = addrs.len(), is_new, "scanned addresses");
        Ok(())
    }

    fn address_balance(&self, addr: &ScrAddr) -> u64 {
        self.inner.read().balances.get(addr).copied().unwrap_or(0)
    }

    fn history(&self, addrs: &[ScrAddr]) -> Vec<LedgerEntry> {
        let inner = self.inner.read();
        let mut by_tx: HashMap<&str, LedgerEntry> = HashMap::new();
        for addr in addrs {
            for entry in inner.history.get(addr).into_iter().flatten() {
                by_tx
                    .entry(entry.tx_hash.as_str())
                    .and_modify(|e| e.value += entry.value)
                    .or_insert_with(|| entry.clone());
            }
        }
        let mut entries: Vec<LedgerEntry> = by_tx.into_values().collect();
        entries.sort_by(|a, b| b.height.cmp(&a.height).then_with(|| a.tx_hash.cmp(&b.tx_hash)));
        entries
    }

    fn register_zc_callbacks(&self, callbacks: Arc<dyn ZeroConfCallbacks>) {
        *self.callbacks.write() = Some(callbacks);
    }

    fn register_notification_sink(&self, sink: NotificationSink) {
        self.sinks.write().push(sink);
    }
}
