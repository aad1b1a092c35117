//! Callback liveness monitor for a client's push channel
//!
//! Every session owns one [`CallbackMonitor`]. Notifications are queued on it
//! and leave either through [`CallbackMonitor::emit`] (push transports) or
//! through [`CallbackMonitor::respond`] (long-poll transports).
//!
//! Liveness is tracked with an attempt counter. The garbage collector calls
//! [`CallbackMonitor::is_valid`] once per sweep, which bumps the counter; any
//! client activity resets it. Reaching [`CALLBACK_EXPIRE_COUNT`] means the
//! channel is presumed dead.
//!
//! The check path never blocks and never takes the guard. If the guard is
//! held, a responder or an emission is in flight, so the channel is being
//! serviced right now and the check reports alive without counting. A wedged
//! client therefore cannot stall the sweep, at the price of a missed detection
//! for that cycle.

use crate::error::ViewError;
use crate::notification::CallbackMessage;
use crate::ready::ReadyGate;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Unanswered liveness checks before a channel is presumed dead
pub const CALLBACK_EXPIRE_COUNT: u32 = 5;

/// Largest payload pushed in a single message (1 GiB)
pub const MAX_CONTENT_LENGTH: usize = 1024 * 1024 * 1024;

/// Transport-side sink for serialized callback messages.
pub trait PushChannel: Send + Sync {
    fn push(&self, payload: &str) -> Result<(), ViewError>;
}

pub struct CallbackMonitor {
    /// Held for the duration of every responder and emission
    guard: Mutex<()>,
    count: AtomicU32,
    running: AtomicBool,
    pending_tx: Sender<CallbackMessage>,
    pending_rx: Receiver<CallbackMessage>,
    /// Readiness of the owning session
    ready: Arc<ReadyGate>,
    channel: Option<Box<dyn PushChannel>>,
    poll_timeout: Duration,
}

impl CallbackMonitor {
    pub fn new(
        ready: Arc<ReadyGate>,
        channel: Option<Box<dyn PushChannel>>,
        poll_timeout: Duration,
    ) -> Self {
        let (pending_tx, pending_rx) = crossbeam_channel::unbounded();
        Self {
            guard: Mutex::new(()),
            count: AtomicU32::new(0),
            running: AtomicBool::new(true),
            pending_tx,
            pending_rx,
            ready,
            channel,
            poll_timeout,
        }
    }

    /// Liveness check. See the module docs for the busy-guard case.
    pub fn is_valid(&self) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        // Probe without taking the guard so emitters never lose it to a sweep
        if self.guard.is_locked() {
            return true;
        }
        let count = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        count < CALLBACK_EXPIRE_COUNT
    }

    pub fn reset_counter(&self) {
        self.count.store(0, Ordering::Release);
    }

    pub fn attempt_count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Queue a message for the client. Dropped after shutdown.
    pub fn callback(&self, message: CallbackMessage) {
        if !self.is_running() {
            return;
        }
        let _ = self.pending_tx.send(message);
    }

    pub fn pending_len(&self) -> usize {
        self.pending_rx.len()
    }

    /// Flush queued messages to the push channel.
    ///
    /// Returns the number of messages pushed. Without a channel, or while a
    /// responder holds the guard, messages stay queued.
    pub fn emit(&self) -> usize {
        let Some(channel) = self.channel.as_ref() else {
            return 0;
        };

        let mut pushed = 0;
        loop {
            let Some(held) = self.guard.try_lock() else {
                return pushed;
            };
            let (count, refused) = self.drain_to(&**channel);
            pushed += count;
            drop(held);

            // Another emitter may have queued and bailed while we held the guard
            if refused || !self.is_running() || self.pending_rx.is_empty() {
                return pushed;
            }
        }
    }

    /// Returns the number pushed and whether the channel refused a payload.
    fn drain_to(&self, channel: &dyn PushChannel) -> (usize, bool) {
        let mut pushed = 0;
        while self.is_running() {
            let Ok(message) = self.pending_rx.try_recv() else {
                break;
            };
            let payload = match serde_json::to_string(&message) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "failed to serialize callback message");
                    continue;
                }
            };
            if payload.len() > MAX_CONTENT_LENGTH {
                warn!(len = payload.len(), "dropping oversized callback payload");
                continue;
            }
            match channel.push(&payload) {
                Ok(()) => pushed += 1,
                Err(e) => {
                    debug!(error = %e, "push channel refused payload");
                    return (pushed, true);
                }
            }
        }
        (pushed, false)
    }

    /// Serve an inbound callback request from the client.
    ///
    /// `waitOnBDV` blocks until the session's readiness gate settles; anything
    /// else blocks until at least one message is queued. Both give up after the poll
    /// timeout or on shutdown.
    pub fn respond(&self, command: &str) -> Result<Vec<CallbackMessage>, ViewError> {
        let Some(_held) = self.guard.try_lock() else {
            return Err(ViewError::Protocol(
                "conflicting callback request in flight".to_string(),
            ));
        };
        self.reset_counter();

        if !self.is_running() {
            return Ok(vec![CallbackMessage::Terminate]);
        }

        match command {
            "waitOnBDV" => Ok(self.wait_on_ready()),
            _ => Ok(self.drain_pending()),
        }
    }

    fn wait_on_ready(&self) -> Vec<CallbackMessage> {
        match self.ready.wait_timeout(self.poll_timeout) {
            // The scan queues its Ready message before opening the gate
            Ok(true) if self.is_running() => self.pending_rx.try_iter().collect(),
            Ok(_) => self.terminal_or_empty(),
            // A failed or halted session will not recover
            Err(_) => vec![CallbackMessage::Terminate],
        }
    }

    fn drain_pending(&self) -> Vec<CallbackMessage> {
        let first = match self.pending_rx.recv_timeout(self.poll_timeout) {
            Ok(message) => message,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                return self.terminal_or_empty();
            }
        };
        if !self.is_running() {
            return vec![CallbackMessage::Terminate];
        }

        let mut batch = vec![first];
        batch.extend(self.pending_rx.try_iter());
        batch
    }

    fn terminal_or_empty(&self) -> Vec<CallbackMessage> {
        if self.is_running() {
            Vec::new()
        } else {
            vec![CallbackMessage::Terminate]
        }
    }

    /// Signal in-flight responders to stop, then wait for them to exit.
    ///
    /// After this returns no responder or emission is running against this
    /// monitor. Idempotent.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            // Wakes a responder parked on the pending queue
            let _ = self.pending_tx.send(CallbackMessage::Terminate);
        }
        let _held = self.guard.lock();
    }
}

impl Drop for CallbackMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for CallbackMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackMonitor")
            .field("count", &self.attempt_count())
            .field("running", &self.is_running())
            .field("pending", &self.pending_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    struct RecordingChannel {
        payloads: Arc<Mutex<Vec<String>>>,
    }

    impl PushChannel for RecordingChannel {
        fn push(&self, payload: &str) -> Result<(), ViewError> {
            self.payloads.lock().push(payload.to_string());
            Ok(())
        }
    }

    fn ready_gate() -> Arc<ReadyGate> {
        let gate = Arc::new(ReadyGate::new());
        gate.set_ready();
        gate
    }

    fn monitor() -> CallbackMonitor {
        CallbackMonitor::new(ready_gate(), None, Duration::from_millis(200))
    }

    #[test]
    fn test_expires_on_fifth_check() {
        let cb = monitor();
        for _ in 0..CALLBACK_EXPIRE_COUNT - 1 {
            assert!(cb.is_valid());
        }
        assert!(!cb.is_valid());
    }

    #[test]
    fn test_reset_restarts_count() {
        let cb = monitor();
        for _ in 0..CALLBACK_EXPIRE_COUNT - 1 {
            assert!(cb.is_valid());
        }
        cb.reset_counter();
        assert_eq!(cb.attempt_count(), 0);
        for _ in 0..CALLBACK_EXPIRE_COUNT - 1 {
            assert!(cb.is_valid());
        }
        assert!(!cb.is_valid());
    }

    #[test]
    fn test_busy_guard_assumes_alive_without_counting() {
        let cb = monitor();
        let held = cb.guard.lock();
        for _ in 0..CALLBACK_EXPIRE_COUNT * 2 {
            assert!(cb.is_valid());
        }
        drop(held);
        assert_eq!(cb.attempt_count(), 0);
    }

    #[test]
    fn test_respond_counts_as_activity() {
        let cb = monitor();
        cb.is_valid();
        cb.is_valid();
        cb.callback(CallbackMessage::NewBlock { height: 3 });
        let batch = cb.respond("getStatus").unwrap();
        assert_eq!(batch, vec![CallbackMessage::NewBlock { height: 3 }]);
        assert_eq!(cb.attempt_count(), 0);
    }

    #[test]
    fn test_respond_times_out_empty() {
        let cb = monitor();
        assert!(cb.respond("getStatus").unwrap().is_empty());
    }

    #[test]
    fn test_wait_on_bdv_returns_queued_ready() {
        let cb = monitor();
        cb.callback(CallbackMessage::Ready { top_height: 12 });
        let batch = cb.respond("waitOnBDV").unwrap();
        assert_eq!(batch, vec![CallbackMessage::Ready { top_height: 12 }]);
    }

    #[test]
    fn test_emit_pushes_in_order() {
        let payloads = Arc::new(Mutex::new(Vec::new()));
        let channel = RecordingChannel {
            payloads: Arc::clone(&payloads),
        };
        let cb = CallbackMonitor::new(
            ready_gate(),
            Some(Box::new(channel)),
            Duration::from_secs(1),
        );
        cb.callback(CallbackMessage::NewBlock { height: 1 });
        cb.callback(CallbackMessage::NewBlock { height: 2 });
        assert_eq!(cb.emit(), 2);

        let payloads = payloads.lock();
        assert!(payloads[0].contains("\"height\":1"));
        assert!(payloads[1].contains("\"height\":2"));
    }

    #[test]
    fn test_shutdown_waits_for_in_flight_responder() {
        let cb = Arc::new(CallbackMonitor::new(
            ready_gate(),
            None,
            Duration::from_secs(10),
        ));
        let responder = {
            let cb = Arc::clone(&cb);
            thread::spawn(move || cb.respond("getStatus"))
        };
        // Let the responder park on the queue
        thread::sleep(Duration::from_millis(50));

        cb.shutdown();
        assert_eq!(
            responder.join().unwrap().unwrap(),
            vec![CallbackMessage::Terminate]
        );
        assert!(!cb.is_valid());
    }

    #[test]
    fn test_concurrent_respond_rejected() {
        let cb = monitor();
        let _held = cb.guard.lock();
        assert!(matches!(cb.respond("getStatus"), Err(ViewError::Protocol(_))));
    }

    #[test]
    fn test_wait_on_bdv_wakes_when_scan_finishes() {
        let gate = Arc::new(ReadyGate::new());
        let cb = Arc::new(CallbackMonitor::new(
            Arc::clone(&gate),
            None,
            Duration::from_secs(10),
        ));
        let responder = {
            let cb = Arc::clone(&cb);
            thread::spawn(move || cb.respond("waitOnBDV"))
        };
        thread::sleep(Duration::from_millis(50));

        cb.callback(CallbackMessage::Ready { top_height: 4 });
        gate.set_ready();
        assert_eq!(
            responder.join().unwrap().unwrap(),
            vec![CallbackMessage::Ready { top_height: 4 }]
        );
    }

    #[test]
    fn test_wait_on_bdv_terminates_on_failed_scan() {
        let gate = Arc::new(ReadyGate::new());
        gate.set_failed("index offline");
        let cb = CallbackMonitor::new(gate, None, Duration::from_secs(10));
        assert_eq!(
            cb.respond("waitOnBDV").unwrap(),
            vec![CallbackMessage::Terminate]
        );
    }

    #[test]
    fn test_wait_on_bdv_times_out_empty() {
        let cb = CallbackMonitor::new(
            Arc::new(ReadyGate::new()),
            None,
            Duration::from_millis(50),
        );
        assert!(cb.respond("waitOnBDV").unwrap().is_empty());
    }
}
