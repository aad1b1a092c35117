//! One-shot readiness gate for a session's initial scan

use crate::error::ViewError;
use parking_lot::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyState {
    NotReady,
    Ready,
    Failed(String),
}

/// NotReady transitions exactly once, to Ready or Failed. Every waiter,
/// including late ones, observes the same final state.
#[derive(Debug)]
pub struct ReadyGate {
    state: Mutex<ReadyState>,
    cond: Condvar,
}

impl ReadyGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ReadyState::NotReady),
            cond: Condvar::new(),
        }
    }

    /// Returns false if the gate was already settled.
    pub fn set_ready(&self) -> bool {
        self.settle(ReadyState::Ready)
    }

    pub fn set_failed(&self, reason: impl Into<String>) -> bool {
        self.settle(ReadyState::Failed(reason.into()))
    }

    fn settle(&self, outcome: ReadyState) -> bool {
        let mut state = self.state.lock();
        if *state != ReadyState::NotReady {
            return false;
        }
        *state = outcome;
        self.cond.notify_all();
        true
    }

    pub fn is_ready(&self) -> bool {
        *self.state.lock() == ReadyState::Ready
    }

    pub fn state(&self) -> ReadyState {
        self.state.lock().clone()
    }

    /// Block until the gate settles.
    pub fn wait(&self) -> Result<(), ViewError> {
        let mut state = self.state.lock();
        while *state == ReadyState::NotReady {
            self.cond.wait(&mut state);
        }
        Self::outcome(&state)
    }

    /// Block until the gate settles or the timeout elapses; `Ok(false)` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, ViewError> {
        let mut state = self.state.lock();
        if *state == ReadyState::NotReady {
            self.cond
                .wait_while_for(&mut state, |s| *s == ReadyState::NotReady, timeout);
        }
        if *state == ReadyState::NotReady {
            return Ok(false);
        }
        Self::outcome(&state).map(|_| true)
    }

    fn outcome(state: &ReadyState) -> Result<(), ViewError> {
        match state {
            ReadyState::Failed(reason) => Err(ViewError::ScanFailure(reason.clone())),
            _ => Ok(()),
        }
    }
}

impl Default for ReadyGate {
    fn default() -> Self {
        Self::new()
    }
}
