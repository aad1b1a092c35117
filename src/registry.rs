//! Session registry: owns every live session and the worker threads
//!
//! Threads, all long-lived and fed by unbounded queues:
//!
//! - one command thread executing client commands in arrival order
//! - one outer notification thread expanding store events into per-session
//!   packets
//! - N inner notification threads, sharded by session id so a session's packets
//!   are always delivered in order by the same thread
//! - an optional garbage collector sweeping dead sessions
//!
//! Shutdown stops accepting commands, halts every session, sends the shutdown
//! sentinel down every queue and joins the workers.

use crate::callback::PushChannel;
use crate::command::{Command, MetaMethod, RawCommand};
use crate::config::{Config, RegistrySettings};
use crate::error::ViewError;
use crate::notification::{
    CallbackMessage, Notification, NotificationPacket, NotificationSink, Queued, SessionEvent,
};
use crate::session::BdvSession;
use crate::session_map::SessionMap;
use crate::store::BlockDataStore;
use crate::zeroconf::ZeroConfBridge;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

/// Called once when the transport should stop reading requests.
pub type ShutdownHook = Box<dyn FnOnce() + Send>;

/// Builds the push channel for a freshly registered session.
pub type ChannelFactory = Box<dyn Fn(&str) -> Box<dyn PushChannel> + Send + Sync>;

/// Transport-side integration points.
#[derive(Default)]
pub struct RegistryHooks {
    pub shutdown: Option<ShutdownHook>,
    pub channel_factory: Option<ChannelFactory>,
}

struct CommandJob {
    session: Arc<BdvSession>,
    command: Command,
    reply: Sender<Result<Value, ViewError>>,
}

pub(crate) struct RegistryInner {
    state: Mutex<RegistryState>,
    settings: RegistrySettings,
    network_id: String,
    shutdown_cookie: Option<String>,
    store: Arc<dyn BlockDataStore>,
    sessions: SessionMap,
    command_tx: Sender<Queued<CommandJob>>,
    outer_tx: Sender<Queued<Notification>>,
    inner_txs: Vec<Sender<Queued<NotificationPacket>>>,
    gc_stop: Sender<()>,
    shutdown_hook: Mutex<Option<ShutdownHook>>,
    channel_factory: Option<ChannelFactory>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RegistryInner {
    pub(crate) fn is_running(&self) -> bool {
        *self.state.lock() == RegistryState::Running
    }

    pub(crate) fn sessions(&self) -> &SessionMap {
        &self.sessions
    }

    pub(crate) fn enqueue_notification(&self, notification: Notification) {
        if self.outer_tx.send(Queued::Item(notification)).is_err() {
            debug!("outer notification queue closed");
        }
    }

    fn ensure_running(&self) -> Result<(), ViewError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(ViewError::ShuttingDown)
        }
    }

    fn shard(&self, bdv_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        bdv_id.hash(&mut hasher);
        (hasher.finish() % self.inner_txs.len() as u64) as usize
    }

    fn unregister(&self, bdv_id: &str) -> bool {
        match self.sessions.remove(bdv_id) {
            Some(session) => {
                session.halt_threads();
                info!(bdv_id, "session unregistered");
                true
            }
            None => false,
        }
    }

    /// Remove sessions whose callback expired or whose initial scan failed.
    fn sweep(&self) -> Vec<String> {
        let snapshot = self.sessions.snapshot();
        let mut dead: Vec<String> = snapshot
            .iter()
            .filter(|(_, session)| session.scan_failed() || !session.callback().is_valid())
            .map(|(id, _)| id.clone())
            .collect();
        dead.sort();
        drop(snapshot);

        for bdv_id in &dead {
            warn!(bdv_id = %bdv_id, "collecting dead session");
            self.unregister(bdv_id);
        }
        dead
    }

    fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                RegistryState::ShuttingDown | RegistryState::Stopped => return,
                _ => *state = RegistryState::ShuttingDown,
            }
        }
        info!(sessions = self.sessions.len(), "registry shutting down");

        for session in self.sessions.drain_all() {
            session.halt_threads();
        }

        let _ = self.command_tx.send(Queued::Shutdown);
        let _ = self.outer_tx.send(Queued::Shutdown);
        for tx in &self.inner_txs {
            let _ = tx.send(Queued::Shutdown);
        }
        let _ = self.gc_stop.send(());

        let workers = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                error!(thread = %name, "worker thread panicked during shutdown");
            }
        }

        *self.state.lock() = RegistryState::Stopped;
        info!("registry stopped");
    }
}

pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct WorkerQueues {
    command_rx: Receiver<Queued<CommandJob>>,
    outer_rx: Receiver<Queued<Notification>>,
    inner_rxs: Vec<Receiver<Queued<NotificationPacket>>>,
    gc_stop_rx: Receiver<()>,
}

impl SessionRegistry {
    pub fn new(
        store: Arc<dyn BlockDataStore>,
        config: &Config,
        hooks: RegistryHooks,
    ) -> Result<Self, ViewError> {
        let settings = config.registry.resolve()?;

        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let (outer_tx, outer_rx) = crossbeam_channel::unbounded();
        let (inner_txs, inner_rxs): (Vec<_>, Vec<_>) = (0..settings.inner_thread_count)
            .map(|_| crossbeam_channel::unbounded())
            .unzip();
        let (gc_stop, gc_stop_rx) = crossbeam_channel::bounded(1);

        let inner = Arc::new(RegistryInner {
            state: Mutex::new(RegistryState::Starting),
            settings: settings.clone(),
            network_id: config.server.network_id.clone(),
            shutdown_cookie: config.server.shutdown_cookie.clone(),
            store: Arc::clone(&store),
            sessions: SessionMap::new(),
            command_tx,
            outer_tx: outer_tx.clone(),
            inner_txs,
            gc_stop,
            shutdown_hook: Mutex::new(hooks.shutdown),
            channel_factory: hooks.channel_factory,
            workers: Mutex::new(Vec::new()),
        });

        // On a spawn failure, dropping the registry joins what already started
        let registry = SessionRegistry { inner };
        registry.spawn_workers(WorkerQueues {
            command_rx,
            outer_rx,
            inner_rxs,
            gc_stop_rx,
        })?;

        store.register_zc_callbacks(Arc::new(ZeroConfBridge::new(Arc::downgrade(
            &registry.inner,
        ))));
        store.register_notification_sink(NotificationSink::new(outer_tx));

        *registry.inner.state.lock() = RegistryState::Running;
        info!(
            role = ?settings.node_role,
            inner_threads = settings.inner_thread_count,
            gc = settings.enable_garbage_collector,
            "session registry running"
        );
        Ok(registry)
    }

    fn spawn_workers(&self, queues: WorkerQueues) -> Result<(), ViewError> {
        let inner = Arc::clone(&self.inner);
        self.spawn("bdv-command", move || command_loop(queues.command_rx))?;

        let outer_inner = Arc::clone(&inner);
        self.spawn("bdv-notify-outer", move || {
            outer_loop(&outer_inner, queues.outer_rx)
        })?;

        for (index, rx) in queues.inner_rxs.into_iter().enumerate() {
            let shard_inner = Arc::clone(&inner);
            self.spawn(&format!("bdv-notify-inner-{}", index), move || {
                inner_loop(&shard_inner, rx)
            })?;
        }

        if inner.settings.enable_garbage_collector {
            let gc_inner = Arc::clone(&inner);
            let gc_stop_rx = queues.gc_stop_rx;
            self.spawn("bdv-gc", move || gc_loop(&gc_inner, gc_stop_rx))?;
        }
        Ok(())
    }

    fn spawn<F>(&self, name: &str, body: F) -> Result<(), ViewError>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
            .map_err(|e| ViewError::ThreadSpawn(format!("{}: {}", name, e)))?;
        self.inner.workers.lock().push(handle);
        Ok(())
    }

    pub fn state(&self) -> RegistryState {
        *self.inner.state.lock()
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.inner.settings
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn bdv_ids(&self) -> Vec<String> {
        self.inner.sessions.ids()
    }

    /// Create a session and launch its initial scan.
    ///
    /// The optional first argument is the client's network id and must match
    /// the configured one.
    pub fn register_bdv(&self, args: &[Value]) -> Result<String, ViewError> {
        self.inner.ensure_running()?;
        if let Some(network_id) = args.first().and_then(Value::as_str) {
            if network_id != self.inner.network_id {
                return Err(ViewError::Protocol(format!(
                    "network mismatch: server runs {}, client asked for {}",
                    self.inner.network_id, network_id
                )));
            }
        }

        let session = loop {
            let bdv_id = hex::encode(rand::random::<[u8; 20]>());
            let channel = self
                .inner
                .channel_factory
                .as_ref()
                .map(|factory| factory(bdv_id.as_str()));
            let session = Arc::new(BdvSession::new(
                bdv_id.clone(),
                Arc::clone(&self.inner.store),
                channel,
                self.inner.settings.callback_poll_timeout,
            ));
            if self.inner.sessions.insert_new(bdv_id, Arc::clone(&session)) {
                break session;
            }
        };
        let bdv_id = session.id().to_string();

        if let Err(e) = session.start() {
            self.inner.unregister(&bdv_id);
            return Err(e);
        }
        // Lost a race with shutdown after the running check
        if !self.inner.is_running() {
            self.inner.unregister(&bdv_id);
            return Err(ViewError::ShuttingDown);
        }

        info!(bdv_id = %bdv_id, sessions = self.inner.sessions.len(), "session registered");
        Ok(bdv_id)
    }

    /// Returns whether the session was present.
    pub fn unregister_bdv(&self, bdv_id: &str) -> bool {
        self.inner.unregister(bdv_id)
    }

    pub fn get(&self, bdv_id: &str) -> Option<Arc<BdvSession>> {
        self.inner.sessions.get(bdv_id)
    }

    /// Parse and run one raw JSON command.
    pub fn run_command(&self, raw: &str) -> Result<Value, ViewError> {
        let command = RawCommand::parse(raw)?;
        self.execute(command)
    }

    pub fn execute(&self, raw: RawCommand) -> Result<Value, ViewError> {
        if let Some(meta) = MetaMethod::from_method(&raw.method) {
            return self.run_meta(meta, &raw);
        }
        self.inner.ensure_running()?;

        let (bdv_id, local_ids) = raw
            .ids
            .split_first()
            .ok_or_else(|| ViewError::Protocol("missing bdv id".to_string()))?;
        let session = self
            .get(bdv_id)
            .ok_or_else(|| ViewError::SessionNotFound(bdv_id.clone()))?;
        let command = Command::parse(&raw.method, local_ids, &raw.args)?;

        // Wait here so a slow scan never holds up the command thread
        if command.requires_ready() {
            if let Err(e) = session.wait_ready() {
                if session.is_halted() {
                    return Ok(Value::Null);
                }
                return Err(e);
            }
        }

        let (reply, reply_rx) = crossbeam_channel::bounded(1);
        self.inner
            .command_tx
            .send(Queued::Item(CommandJob {
                session,
                command,
                reply,
            }))
            .map_err(|_| ViewError::ShuttingDown)?;
        reply_rx.recv().map_err(|_| ViewError::ShuttingDown)?
    }

    fn run_meta(&self, meta: MetaMethod, raw: &RawCommand) -> Result<Value, ViewError> {
        debug!(method = %raw.method, "meta command");
        match meta {
            MetaMethod::RegisterBdv => Ok(json!(self.register_bdv(&raw.args)?)),
            MetaMethod::UnregisterBdv => {
                let bdv_id = raw
                    .ids
                    .first()
                    .ok_or_else(|| ViewError::Protocol("missing bdv id".to_string()))?;
                Ok(json!(self.unregister_bdv(bdv_id)))
            }
            MetaMethod::Shutdown => {
                self.process_shutdown_command(&raw.args)?;
                Ok(Value::Bool(true))
            }
            MetaMethod::GetBdvIds => Ok(json!(self.bdv_ids())),
            MetaMethod::RegisterCallback => {
                let bdv_id = raw
                    .ids
                    .first()
                    .ok_or_else(|| ViewError::Protocol("missing bdv id".to_string()))?;
                let request = raw
                    .args
                    .first()
                    .and_then(Value::as_str)
                    .unwrap_or("getStatus");
                let messages = match self.get(bdv_id) {
                    Some(session) => session.callback().respond(request)?,
                    // Tells the client to stop polling
                    None => vec![CallbackMessage::Terminate],
                };
                Ok(serde_json::to_value(messages)?)
            }
        }
    }

    /// Check the cookie, stop the transport, then shut down.
    pub fn process_shutdown_command(&self, args: &[Value]) -> Result<(), ViewError> {
        if let Some(cookie) = self.inner.shutdown_cookie.as_deref() {
            if args.first().and_then(Value::as_str) != Some(cookie) {
                warn!("shutdown request with bad cookie refused");
                return Err(ViewError::Protocol("invalid shutdown cookie".to_string()));
            }
        }
        self.exit_request_loop();
        self.shutdown();
        Ok(())
    }

    /// Invoke the transport's shutdown hook. Runs at most once.
    pub fn exit_request_loop(&self) {
        let hook = self.inner.shutdown_hook.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }

    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Sweep now instead of waiting for the next GC tick. Returns removed ids.
    pub fn collect_garbage(&self) -> Vec<String> {
        if !self.inner.is_running() {
            return Vec::new();
        }
        self.inner.sweep()
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

/// Wire shape for a command outcome.
pub fn response_json(result: &Result<Value, ViewError>) -> Value {
    match result {
        Ok(value) => json!({ "result": value }),
        Err(e) => json!({
            "error": {
                "kind": e.kind(),
                "message": e.to_string(),
            }
        }),
    }
}

fn command_loop(rx: Receiver<Queued<CommandJob>>) {
    while let Ok(Queued::Item(job)) = rx.recv() {
        let CommandJob {
            session,
            command,
            reply,
        } = job;
        let result = panic::catch_unwind(AssertUnwindSafe(|| session.execute(command)))
            .unwrap_or_else(|_| {
                error!(bdv_id = %session.id(), "command panicked");
                Err(ViewError::Protocol("command failed unexpectedly".to_string()))
            });
        let _ = reply.send(result);
    }

    for job in rx.try_iter() {
        if let Queued::Item(job) = job {
            let _ = job.reply.send(Err(ViewError::ShuttingDown));
        }
    }
    debug!("command thread exiting");
}

fn outer_loop(inner: &RegistryInner, rx: Receiver<Queued<Notification>>) {
    while let Ok(Queued::Item(notification)) = rx.recv() {
        let result = panic::catch_unwind(AssertUnwindSafe(|| fan_out(inner, notification)));
        if result.is_err() {
            error!("notification fan-out panicked");
        }
    }
    debug!("outer notification thread exiting");
}

/// Expand one store event into per-session packets.
fn fan_out(inner: &RegistryInner, notification: Notification) {
    let packets: Vec<NotificationPacket> = match notification {
        Notification::NewBlock(event) => {
            let event = Arc::new(event);
            inner
                .sessions
                .snapshot()
                .keys()
                .map(|bdv_id| NotificationPacket {
                    bdv_id: bdv_id.clone(),
                    event: SessionEvent::NewBlock(Arc::clone(&event)),
                })
                .collect()
        }
        Notification::ZeroConf(packet) => vec![NotificationPacket {
            bdv_id: packet.bdv_id,
            event: SessionEvent::ZeroConf(packet.txs),
        }],
        Notification::ZcError {
            bdv_id,
            message,
            tx_hash,
        } => vec![NotificationPacket {
            bdv_id,
            event: SessionEvent::Error { message, tx_hash },
        }],
    };

    for packet in packets {
        let shard = inner.shard(&packet.bdv_id);
        if inner.inner_txs[shard].send(Queued::Item(packet)).is_err() {
            debug!(shard, "inner notification queue closed");
        }
    }
}

fn inner_loop(inner: &RegistryInner, rx: Receiver<Queued<NotificationPacket>>) {
    while let Ok(Queued::Item(packet)) = rx.recv() {
        // Unknown or removed sessions drop the packet
        let Some(session) = inner.sessions.get(&packet.bdv_id) else {
            continue;
        };
        let result = panic::catch_unwind(AssertUnwindSafe(|| session.push_notification(&packet)));
        if result.is_err() {
            error!(bdv_id = %packet.bdv_id, "notification delivery panicked");
        }
    }
    debug!("inner notification thread exiting");
}

fn gc_loop(inner: &RegistryInner, stop: Receiver<()>) {
    loop {
        match stop.recv_timeout(inner.settings.gc_interval) {
            Err(RecvTimeoutError::Timeout) => {
                if !inner.is_running() {
                    continue;
                }
                let result = panic::catch_unwind(AssertUnwindSafe(|| inner.sweep()));
                match result {
                    Ok(removed) if !removed.is_empty() => {
                        info!(removed = removed.len(), "garbage collector swept sessions")
                    }
                    Ok(_) => {}
                    Err(_) => error!("garbage collector sweep panicked"),
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("gc thread exiting");
}
