//! BDV session: one client's view over the shared data store
//!
//! A session tracks the wallets and lockboxes its client registered, answers
//! the client's commands, and turns notification packets into callback
//! messages. Commands that read scanned state wait on the readiness gate,
//! which opens once the initial scan has merged every pending registration.

use crate::callback::{CallbackMonitor, PushChannel};
use crate::command::{Command, HISTORY_PAGE_SIZE};
use crate::error::ViewError;
use crate::notification::{CallbackMessage, NotificationPacket, SessionEvent};
use crate::ready::{ReadyGate, ReadyState};
use crate::store::BlockDataStore;
use crate::types::{LedgerEntry, ScrAddr, TxHash, WalletType, ZcTx};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// A registration waiting to be scanned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletRegistration {
    pub addresses: Vec<ScrAddr>,
    pub id: String,
    /// New wallets have no history, so the scan starts from scratch
    pub is_new: bool,
    pub wallet_type: WalletType,
}

#[derive(Debug, Clone)]
struct TrackedWallet {
    wallet_type: WalletType,
    addresses: BTreeSet<ScrAddr>,
}

/// View-scoped history query handle.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LedgerDelegate {
    Wallets,
    Lockboxes,
    ScrAddr { wallet_id: String, scr_addr: ScrAddr },
}

#[derive(Debug, Default)]
struct RegistrationState {
    pending: BTreeMap<String, WalletRegistration>,
    wallets: BTreeMap<String, TrackedWallet>,
    delegates: BTreeMap<String, LedgerDelegate>,
    /// Relevant mempool transactions in arrival order
    zero_conf: Vec<ZcTx>,
}

impl RegistrationState {
    fn is_registered(&self, id: &str) -> bool {
        self.pending.contains_key(id) || self.wallets.contains_key(id)
    }

    fn merge(&mut self, id: &str) {
        if let Some(reg) = self.pending.remove(id) {
            self.wallets.insert(
                reg.id,
                TrackedWallet {
                    wallet_type: reg.wallet_type,
                    addresses: reg.addresses.into_iter().collect(),
                },
            );
        }
    }

    fn wallet(&self, id: &str) -> Result<&TrackedWallet, ViewError> {
        self.wallets
            .get(id)
            .ok_or_else(|| ViewError::Protocol(format!("unknown wallet id {}", id)))
    }

    fn addresses_of_type(&self, wallet_type: WalletType) -> BTreeSet<ScrAddr> {
        self.wallets
            .values()
            .filter(|w| w.wallet_type == wallet_type)
            .flat_map(|w| w.addresses.iter().cloned())
            .collect()
    }

    fn delegate_addresses(&self, delegate: &LedgerDelegate) -> BTreeSet<ScrAddr> {
        match delegate {
            LedgerDelegate::Wallets => self.addresses_of_type(WalletType::Wallet),
            LedgerDelegate::Lockboxes => self.addresses_of_type(WalletType::Lockbox),
            LedgerDelegate::ScrAddr { scr_addr, .. } => BTreeSet::from([scr_addr.clone()]),
        }
    }

    /// Mempool entries paying the address set, newest first.
    fn zero_conf_entries(&self, addrs: &BTreeSet<ScrAddr>) -> Vec<LedgerEntry> {
        self.zero_conf
            .iter()
            .rev()
            .filter_map(|tx| {
                let value = tx.value_to(|a| addrs.contains(a));
                (value > 0).then(|| LedgerEntry::zero_conf(tx.hash.clone(), value))
            })
            .collect()
    }

    fn unconfirmed_value(&self, addrs: &BTreeSet<ScrAddr>) -> u64 {
        self.zero_conf
            .iter()
            .map(|tx| tx.value_to(|a| addrs.contains(a)))
            .fold(0, u64::saturating_add)
    }

    fn forget_zero_conf(&mut self, hashes: &[TxHash]) {
        self.zero_conf.retain(|tx| !hashes.contains(&tx.hash));
    }
}

pub struct BdvSession {
    id: String,
    store: Arc<dyn BlockDataStore>,
    ready: Arc<ReadyGate>,
    state: Mutex<RegistrationState>,
    callback: Arc<CallbackMonitor>,
    init_thread: Mutex<Option<JoinHandle<()>>>,
    halted: AtomicBool,
    scan_failed: AtomicBool,
}

impl BdvSession {
    pub fn new(
        id: String,
        store: Arc<dyn BlockDataStore>,
        channel: Option<Box<dyn PushChannel>>,
        poll_timeout: Duration,
    ) -> Self {
        let ready = Arc::new(ReadyGate::new());
        let callback = Arc::new(CallbackMonitor::new(
            Arc::clone(&ready),
            channel,
            poll_timeout,
        ));

        Self {
            id,
            store,
            ready,
            state: Mutex::new(RegistrationState::default()),
            callback,
            init_thread: Mutex::new(None),
            halted: AtomicBool::new(false),
            scan_failed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn callback(&self) -> &CallbackMonitor {
        &self.callback
    }

    pub fn ready_state(&self) -> ReadyState {
        self.ready.state()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.is_ready()
    }

    /// Block until the initial scan has finished, returning its outcome.
    pub fn wait_ready(&self) -> Result<(), ViewError> {
        self.ready.wait()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn scan_failed(&self) -> bool {
        self.scan_failed.load(Ordering::Acquire)
    }

    /// Launch the initial scan on the session's own thread.
    pub fn start(self: &Arc<Self>) -> Result<(), ViewError> {
        let session = Arc::clone(self);
        let short_id: String = self.id.chars().take(8).collect();
        let handle = thread::Builder::new()
            .name(format!("bdv-init-{}", short_id))
            .spawn(move || {
                let _ = session.init();
            })
            .map_err(|e| ViewError::ThreadSpawn(e.to_string()))?;
        *self.init_thread.lock() = Some(handle);
        Ok(())
    }

    /// Scan every pending registration, then open the readiness gate.
    ///
    /// Registrations arriving while the scan runs are picked up by the next
    /// round. The gate is opened under the registration lock, so a
    /// registration either lands before the final round or sees the session
    /// ready and scans itself.
    pub fn init(&self) -> Result<(), ViewError> {
        loop {
            if self.is_halted() {
                self.ready.set_failed("session halted");
                return Err(ViewError::ShuttingDown);
            }

            let batch: Vec<WalletRegistration> = {
                let state = self.state.lock();
                if state.pending.is_empty() {
                    let top_height = self.store.top_block_height();
                    self.callback.callback(CallbackMessage::Ready { top_height });
                    self.ready.set_ready();
                    info!(bdv_id = %self.id, wallets = state.wallets.len(), "session ready");
                    drop(state);
                    self.callback.emit();
                    return Ok(());
                }
                state.pending.values().cloned().collect()
            };

            for reg in batch {
                if let Err(e) = self.store.scan_addresses(&reg.addresses, reg.is_new) {
                    warn!(bdv_id = %self.id, wallet_id = %reg.id, error = %e, "initial scan failed");
                    self.scan_failed.store(true, Ordering::Release);
                    self.ready.set_failed(e.to_string());
                    return Err(ViewError::ScanFailure(e.to_string()));
                }
                self.state.lock().merge(&reg.id);
            }
        }
    }

    pub fn register_wallet(
        &self,
        addresses: Vec<ScrAddr>,
        id: String,
        is_new: bool,
    ) -> Result<(), ViewError> {
        self.register_addresses(WalletRegistration {
            addresses,
            id,
            is_new,
            wallet_type: WalletType::Wallet,
        })
    }

    pub fn register_lockbox(
        &self,
        addresses: Vec<ScrAddr>,
        id: String,
        is_new: bool,
    ) -> Result<(), ViewError> {
        self.register_addresses(WalletRegistration {
            addresses,
            id,
            is_new,
            wallet_type: WalletType::Lockbox,
        })
    }

    fn register_addresses(&self, reg: WalletRegistration) -> Result<(), ViewError> {
        if reg.id.is_empty() {
            return Err(ViewError::Protocol("empty registration id".to_string()));
        }

        let mut state = self.state.lock();
        if state.is_registered(&reg.id) {
            return Err(ViewError::RegistrationConflict(format!(
                "id {} is already registered",
                reg.id
            )));
        }
        let id = reg.id.clone();
        debug!(bdv_id = %self.id, wallet_id = %id, kind = ?reg.wallet_type, "registering addresses");
        state.pending.insert(id.clone(), reg.clone());

        if !self.ready.is_ready() {
            // The initial scan merges it
            return Ok(());
        }

        if let Err(e) = self.store.scan_addresses(&reg.addresses, reg.is_new) {
            state.pending.remove(&id);
            return Err(e);
        }
        state.merge(&id);
        drop(state);

        self.callback.callback(CallbackMessage::Refresh {
            wallet_ids: vec![id],
        });
        self.callback.emit();
        Ok(())
    }

    /// Whether any tracked wallet holds the address. Before the session is
    /// ready, pending registrations count as well.
    pub fn has_scr_addr(&self, scr_addr: &ScrAddr) -> bool {
        let state = self.state.lock();
        state.wallets.values().any(|w| w.addresses.contains(scr_addr))
            || (!self.ready.is_ready()
                && state
                    .pending
                    .values()
                    .any(|r| r.addresses.contains(scr_addr)))
    }

    pub fn execute_command(
        &self,
        method: &str,
        ids: &[String],
        args: &[Value],
    ) -> Result<Value, ViewError> {
        let command = Command::parse(method, ids, args)?;
        self.execute(command)
    }

    /// Run an already parsed command. A halted session answers `null`.
    pub fn execute(&self, command: Command) -> Result<Value, ViewError> {
        if self.is_halted() {
            debug!(bdv_id = %self.id, ?command, "command against halted session ignored");
            return Ok(Value::Null);
        }
        self.callback.reset_counter();

        if command.requires_ready() {
            self.ready.wait()?;
        }
        debug!(bdv_id = %self.id, ?command, "executing command");
        self.dispatch(command)
    }

    fn dispatch(&self, command: Command) -> Result<Value, ViewError> {
        match command {
            Command::RegisterWallet {
                wallet_id,
                addresses,
                is_new,
            } => {
                self.register_wallet(addresses, wallet_id, is_new)?;
                Ok(Value::Bool(true))
            }
            Command::RegisterLockbox {
                wallet_id,
                addresses,
                is_new,
            } => {
                self.register_lockbox(addresses, wallet_id, is_new)?;
                Ok(Value::Bool(true))
            }
            Command::GetBalance { wallet_id } => {
                let state = self.state.lock();
                let wallet = state.wallet(&wallet_id)?;
                let addrs: Vec<ScrAddr> = wallet.addresses.iter().cloned().collect();
                let full = self
                    .store
                    .balance(&addrs)
                    .saturating_add(state.unconfirmed_value(&wallet.addresses));
                Ok(json!(full))
            }
            Command::GetBalancesAndCount { wallet_id } => {
                let state = self.state.lock();
                let wallet = state.wallet(&wallet_id)?;
                let addrs: Vec<ScrAddr> = wallet.addresses.iter().cloned().collect();
                let confirmed = self.store.balance(&addrs);
                let unconfirmed = state.unconfirmed_value(&wallet.addresses);
                let tx_count = self.store.history(&addrs).len()
                    + state.zero_conf_entries(&wallet.addresses).len();
                Ok(json!({
                    "full": confirmed.saturating_add(unconfirmed),
                    "confirmed": confirmed,
                    "unconfirmed": unconfirmed,
                    "txCount": tx_count,
                }))
            }
            Command::GetAddressBalances { wallet_id } => {
                let state = self.state.lock();
                let wallet = state.wallet(&wallet_id)?;
                let balances: serde_json::Map<String, Value> = wallet
                    .addresses
                    .iter()
                    .map(|a| (a.to_string(), json!(self.store.address_balance(a))))
                    .collect();
                Ok(Value::Object(balances))
            }
            Command::GetRegisteredAddresses { wallet_id } => {
                let state = self.state.lock();
                let wallet = state.wallet(&wallet_id)?;
                Ok(json!(wallet.addresses))
            }
            Command::GetWalletIds => {
                let state = self.state.lock();
                Ok(json!(state.wallets.keys().collect::<Vec<_>>()))
            }
            Command::GetLedgerDelegateForWallets => {
                Ok(json!(self.insert_delegate("wallets", LedgerDelegate::Wallets)))
            }
            Command::GetLedgerDelegateForLockboxes => {
                Ok(json!(self.insert_delegate("lockboxes", LedgerDelegate::Lockboxes)))
            }
            Command::GetLedgerDelegateForScrAddr {
                wallet_id,
                scr_addr,
            } => {
                {
                    let state = self.state.lock();
                    if !state.wallet(&wallet_id)?.addresses.contains(&scr_addr) {
                        return Err(ViewError::Protocol(format!(
                            "address {} is not registered in {}",
                            scr_addr, wallet_id
                        )));
                    }
                }
                let name = format!("{}:{}", wallet_id, scr_addr);
                Ok(json!(self.insert_delegate(
                    &name,
                    LedgerDelegate::ScrAddr { wallet_id, scr_addr }
                )))
            }
            Command::GetHistoryPage { delegate_id, page } => {
                let ledger = self.delegate_ledger(&delegate_id)?;
                let start = page
                    .checked_mul(HISTORY_PAGE_SIZE)
                    .filter(|&start| page == 0 || start < ledger.len())
                    .ok_or_else(|| ViewError::Protocol(format!("page {} out of range", page)))?;
                let entries: Vec<&LedgerEntry> = ledger
                    .iter()
                    .skip(start)
                    .take(HISTORY_PAGE_SIZE)
                    .collect();
                Ok(json!(entries))
            }
            Command::GetPageCount { delegate_id } => {
                let ledger = self.delegate_ledger(&delegate_id)?;
                Ok(json!(ledger.len().div_ceil(HISTORY_PAGE_SIZE).max(1)))
            }
            Command::GetTopBlockHeight => Ok(json!(self.store.top_block_height())),
            Command::GetStatus => {
                let state = self.state.lock();
                let ready = match self.ready.state() {
                    ReadyState::NotReady => "pending",
                    ReadyState::Ready => "ready",
                    ReadyState::Failed(_) => "failed",
                };
                Ok(json!({
                    "id": self.id,
                    "ready": ready,
                    "wallets": state.wallets.len(),
                    "pending": state.pending.len(),
                    "delegates": state.delegates.len(),
                }))
            }
        }
    }

    fn insert_delegate(&self, name: &str, delegate: LedgerDelegate) -> String {
        self.state
            .lock()
            .delegates
            .entry(name.to_string())
            .or_insert(delegate);
        name.to_string()
    }

    /// Zero-conf entries first, then confirmed history.
    fn delegate_ledger(&self, delegate_id: &str) -> Result<Vec<LedgerEntry>, ViewError> {
        let state = self.state.lock();
        let delegate = state
            .delegates
            .get(delegate_id)
            .ok_or_else(|| ViewError::Protocol(format!("unknown delegate {}", delegate_id)))?;
        let addrs = state.delegate_addresses(delegate);
        let mut ledger = state.zero_conf_entries(&addrs);
        let addrs: Vec<ScrAddr> = addrs.into_iter().collect();
        ledger.extend(self.store.history(&addrs));
        Ok(ledger)
    }

    /// Apply one packet to session state and hand the result to the callback.
    pub fn push_notification(&self, packet: &NotificationPacket) {
        if self.is_halted() {
            return;
        }

        let message = {
            let mut state = self.state.lock();
            match &packet.event {
                SessionEvent::NewBlock(event) => {
                    state.forget_zero_conf(&event.confirmed);
                    Some(CallbackMessage::NewBlock {
                        height: event.height,
                    })
                }
                SessionEvent::ZeroConf(txs) => {
                    let mut wallet_ids = BTreeSet::new();
                    let mut entries = Vec::new();
                    for tx in txs {
                        if state.zero_conf.iter().any(|known| known.hash == tx.hash) {
                            continue;
                        }
                        let touched: Vec<String> = state
                            .wallets
                            .iter()
                            .filter(|(_, w)| tx.value_to(|a| w.addresses.contains(a)) > 0)
                            .map(|(id, _)| id.clone())
                            .collect();
                        // Kept for registrations still scanning; they see it once merged
                        let pays_pending = state
                            .pending
                            .values()
                            .any(|r| tx.value_to(|a| r.addresses.contains(a)) > 0);
                        if touched.is_empty() && !pays_pending {
                            continue;
                        }
                        state.zero_conf.push(tx.clone());
                        if touched.is_empty() {
                            continue;
                        }

                        wallet_ids.extend(touched);
                        let all: BTreeSet<ScrAddr> = state
                            .wallets
                            .values()
                            .flat_map(|w| w.addresses.iter().cloned())
                            .collect();
                        entries.push(LedgerEntry::zero_conf(
                            tx.hash.clone(),
                            tx.value_to(|a| all.contains(a)),
                        ));
                    }
                    (!entries.is_empty()).then(|| CallbackMessage::ZeroConf {
                        wallet_ids: wallet_ids.into_iter().collect(),
                        entries,
                    })
                }
                SessionEvent::Error { message, tx_hash } => {
                    state.forget_zero_conf(std::slice::from_ref(tx_hash));
                    Some(CallbackMessage::Error {
                        message: message.clone(),
                        tx_hash: tx_hash.clone(),
                    })
                }
            }
        };

        if let Some(message) = message {
            self.callback.callback(message);
            self.callback.emit();
        }
    }

    /// Stop the init thread and the callback. Idempotent.
    pub fn halt_threads(&self) {
        if self.halted.swap(true, Ordering::AcqRel) {
            return;
        }

        let handle = self.init_thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!(bdv_id = %self.id, "init thread panicked");
            }
        }
        self.ready.set_failed("session halted");
        self.callback.shutdown();
        debug!(bdv_id = %self.id, "session halted");
    }
}

impl Drop for BdvSession {
    fn drop(&mut self) {
        self.halt_threads();
    }
}

impl std::fmt::Debug for BdvSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BdvSession")
            .field("id", &self.id)
            .field("ready", &self.ready.state())
            .field("halted", &self.is_halted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::NewBlockEvent;
    use crate::store::MemoryStore;
    use crate::types::TxOut;
    use serde_json::json;

    fn session_with(store: &MemoryStore) -> Arc<BdvSession> {
        Arc::new(BdvSession::new(
            "bdv-test".to_string(),
            Arc::new(store.clone()),
            None,
            Duration::from_millis(200),
        ))
    }

    fn addrs(raw: &[&str]) -> Vec<ScrAddr> {
        raw.iter().map(|a| ScrAddr::from(*a)).collect()
    }

    fn zc_packet(tx: ZcTx) -> NotificationPacket {
        NotificationPacket {
            bdv_id: "bdv-test".to_string(),
            event: SessionEvent::ZeroConf(vec![tx]),
        }
    }

    #[test]
    fn test_init_merges_pending_and_opens_gate() {
        let store = MemoryStore::new();
        let session = session_with(&store);
        session
            .register_wallet(addrs(&["a1", "a2"]), "w1".to_string(), true)
            .unwrap();
        assert!(session.has_scr_addr(&ScrAddr::from("a1")));

        session.init().unwrap();
        assert!(session.is_ready());
        assert!(store.is_scanned(&ScrAddr::from("a2")));
        assert_eq!(
            session.execute_command("getWalletIds", &[], &[]).unwrap(),
            json!(["w1"])
        );
        assert_eq!(
            session.callback().respond("waitOnBDV").unwrap(),
            vec![CallbackMessage::Ready { top_height: 0 }]
        );
    }

    #[test]
    fn test_duplicate_registration_conflicts() {
        let store = MemoryStore::new();
        let session = session_with(&store);
        session
            .register_wallet(addrs(&["a1"]), "w1".to_string(), false)
            .unwrap();
        assert!(matches!(
            session.register_lockbox(addrs(&["a9"]), "w1".to_string(), false),
            Err(ViewError::RegistrationConflict(_))
        ));

        session.init().unwrap();
        assert!(matches!(
            session.register_wallet(addrs(&["a2"]), "w1".to_string(), false),
            Err(ViewError::RegistrationConflict(_))
        ));
    }

    #[test]
    fn test_same_address_under_two_ids() {
        let store = MemoryStore::new();
        let session = session_with(&store);
        session
            .register_wallet(addrs(&["shared"]), "w1".to_string(), false)
            .unwrap();
        session
            .register_lockbox(addrs(&["shared"]), "lb1".to_string(), false)
            .unwrap();
        session.init().unwrap();
        session.callback().respond("waitOnBDV").unwrap();

        let tx = store.build_tx(vec![TxOut {
            scr_addr: ScrAddr::from("shared"),
            value: 3,
        }]);
        session.push_notification(&zc_packet(tx));
        match &session.callback().respond("getStatus").unwrap()[0] {
            CallbackMessage::ZeroConf { wallet_ids, .. } => {
                assert_eq!(wallet_ids, &vec!["lb1".to_string(), "w1".to_string()]);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_registration_after_ready_scans_immediately() {
        let store = MemoryStore::new();
        let session = session_with(&store);
        session.init().unwrap();
        session.callback().respond("waitOnBDV").unwrap();

        session
            .register_lockbox(addrs(&["lb1"]), "box".to_string(), false)
            .unwrap();
        assert!(store.is_scanned(&ScrAddr::from("lb1")));
        assert_eq!(
            session.callback().respond("getStatus").unwrap(),
            vec![CallbackMessage::Refresh {
                wallet_ids: vec!["box".to_string()]
            }]
        );
    }

    #[test]
    fn test_scan_failure_fails_gate() {
        let store = MemoryStore::new();
        store.set_scan_failure(Some("index offline".to_string()));
        let session = session_with(&store);
        session
            .register_wallet(addrs(&["a1"]), "w1".to_string(), false)
            .unwrap();

        assert!(session.init().is_err());
        assert!(session.scan_failed());
        assert!(matches!(
            session.execute_command("getBalance", &["w1".to_string()], &[]),
            Err(ViewError::ScanFailure(_))
        ));
        // Status stays answerable
        let status = session.execute_command("getStatus", &[], &[]).unwrap();
        assert_eq!(status["ready"], "failed");
    }

    #[test]
    fn test_balance_includes_zero_conf() {
        let store = MemoryStore::new();
        let confirmed = store.build_tx(vec![TxOut {
            scr_addr: ScrAddr::from("a1"),
            value: 40,
        }]);
        store.add_block(vec![confirmed]);

        let session = session_with(&store);
        session
            .register_wallet(addrs(&["a1", "a2"]), "w1".to_string(), false)
            .unwrap();
        session.init().unwrap();

        let pending = store.build_tx(vec![TxOut {
            scr_addr: ScrAddr::from("a2"),
            value: 2,
        }]);
        session.push_notification(&zc_packet(pending.clone()));

        let ids = ["w1".to_string()];
        assert_eq!(session.execute_command("getBalance", &ids, &[]).unwrap(), json!(42));
        let counts = session
            .execute_command("getBalancesAndCount", &ids, &[])
            .unwrap();
        assert_eq!(counts["confirmed"], 40);
        assert_eq!(counts["unconfirmed"], 2);
        assert_eq!(counts["txCount"], 2);

        // Confirmation removes the mempool entry
        session.push_notification(&NotificationPacket {
            bdv_id: "bdv-test".to_string(),
            event: SessionEvent::NewBlock(Arc::new(NewBlockEvent {
                height: 2,
                confirmed: vec![pending.hash],
            })),
        });
        assert_eq!(session.execute_command("getBalance", &ids, &[]).unwrap(), json!(40));
    }

    #[test]
    fn test_zero_conf_message_names_wallets() {
        let store = MemoryStore::new();
        let session = session_with(&store);
        session
            .register_wallet(addrs(&["a1"]), "w1".to_string(), false)
            .unwrap();
        session
            .register_wallet(addrs(&["b1"]), "w2".to_string(), false)
            .unwrap();
        session.init().unwrap();
        session.callback().respond("waitOnBDV").unwrap();

        let tx = store.build_tx(vec![TxOut {
            scr_addr: ScrAddr::from("a1"),
            value: 7,
        }]);
        session.push_notification(&zc_packet(tx.clone()));
        // Replays are ignored
        session.push_notification(&zc_packet(tx.clone()));

        let batch = session.callback().respond("getStatus").unwrap();
        assert_eq!(batch.len(), 1);
        match &batch[0] {
            CallbackMessage::ZeroConf {
                wallet_ids,
                entries,
            } => {
                assert_eq!(wallet_ids, &vec!["w1".to_string()]);
                assert_eq!(entries[0].tx_hash, tx.hash);
                assert_eq!(entries[0].value, 7);
                assert!(entries[0].is_zero_conf);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_history_pages() {
        let store = MemoryStore::new();
        for _ in 0..(HISTORY_PAGE_SIZE + 5) {
            let tx = store.build_tx(vec![TxOut {
                scr_addr: ScrAddr::from("a1"),
                value: 1,
            }]);
            store.add_block(vec![tx]);
        }

        let session = session_with(&store);
        session
            .register_wallet(addrs(&["a1"]), "w1".to_string(), false)
            .unwrap();
        session.init().unwrap();

        let delegate = session
            .execute_command("getLedgerDelegateForWallets", &[], &[])
            .unwrap();
        let delegate_id = vec![delegate.as_str().unwrap().to_string()];
        assert_eq!(
            session.execute_command("getPageCount", &delegate_id, &[]).unwrap(),
            json!(2)
        );

        let first = session
            .execute_command("getHistoryPage", &delegate_id, &[json!(0)])
            .unwrap();
        assert_eq!(first.as_array().unwrap().len(), HISTORY_PAGE_SIZE);
        assert_eq!(first[0]["height"], json!(HISTORY_PAGE_SIZE + 5));

        let second = session
            .execute_command("getHistoryPage", &delegate_id, &[json!(1)])
            .unwrap();
        assert_eq!(second.as_array().unwrap().len(), 5);

        assert!(matches!(
            session.execute_command("getHistoryPage", &delegate_id, &[json!(2)]),
            Err(ViewError::Protocol(_))
        ));
        assert!(matches!(
            session.execute_command("getHistoryPage", &delegate_id, &[json!(u64::MAX)]),
            Err(ViewError::Protocol(_))
        ));
    }

    #[test]
    fn test_zero_conf_during_initial_scan_is_kept() {
        let store = MemoryStore::new();
        let session = session_with(&store);
        session
            .register_wallet(addrs(&["A1"]), "w1".to_string(), false)
            .unwrap();
        assert!(session.has_scr_addr(&ScrAddr::from("A1")));

        let tx = store.build_tx(vec![TxOut {
            scr_addr: ScrAddr::from("A1"),
            value: 77,
        }]);
        session.push_notification(&zc_packet(tx.clone()));
        // Unrelated mempool traffic is still ignored
        session.push_notification(&zc_packet(store.build_tx(vec![TxOut {
            scr_addr: ScrAddr::from("elsewhere"),
            value: 5,
        }])));

        session.init().unwrap();
        assert_eq!(
            session.callback().respond("waitOnBDV").unwrap(),
            vec![CallbackMessage::Ready { top_height: 0 }]
        );

        let ids = ["w1".to_string()];
        assert_eq!(session.execute_command("getBalance", &ids, &[]).unwrap(), json!(77));
        let delegate = session
            .execute_command("getLedgerDelegateForWallets", &[], &[])
            .unwrap();
        let delegate_id = vec![delegate.as_str().unwrap().to_string()];
        let page = session
            .execute_command("getHistoryPage", &delegate_id, &[json!(0)])
            .unwrap();
        assert_eq!(page.as_array().unwrap().len(), 1);
        assert_eq!(page[0]["txHash"], json!(tx.hash));
        assert_eq!(page[0]["isZeroConf"], json!(true));
    }

    #[test]
    fn test_scr_addr_delegate_requires_membership() {
        let store = MemoryStore::new();
        let session = session_with(&store);
        session
            .register_wallet(addrs(&["a1"]), "w1".to_string(), false)
            .unwrap();
        session.init().unwrap();

        let ids = ["w1".to_string()];
        assert_eq!(
            session
                .execute_command("getLedgerDelegateForScrAddr", &ids, &[json!("a1")])
                .unwrap(),
            json!("w1:a1")
        );
        assert!(matches!(
            session.execute_command("getLedgerDelegateForScrAddr", &ids, &[json!("zz")]),
            Err(ViewError::Protocol(_))
        ));
    }

    #[test]
    fn test_halt_is_idempotent_and_silences_session() {
        let store = MemoryStore::new();
        let session = session_with(&store);
        session.start().unwrap();
        session.wait_ready().unwrap();

        session.halt_threads();
        session.halt_threads();
        assert!(session.is_halted());
        assert!(!session.callback().is_valid());
        assert_eq!(
            session.execute_command("getTopBlockHeight", &[], &[]).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_commands_wait_for_initial_scan() {
        let store = MemoryStore::new();
        store.set_scan_delay(Duration::from_millis(100));
        let session = session_with(&store);
        session
            .register_wallet(addrs(&["a1"]), "w1".to_string(), false)
            .unwrap();
        session.start().unwrap();

        // Blocks until the scan has merged w1
        let balance = session
            .execute_command("getBalance", &["w1".to_string()], &[])
            .unwrap();
        assert_eq!(balance, json!(0));
        assert!(session.is_ready());
    }
}
