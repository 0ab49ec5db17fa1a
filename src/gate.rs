use std::sync::{Condvar, Mutex, PoisonError};

use crate::lock;

/// A single-fire latch.
///
/// Readers that reach a connection before its stream exists park here.
/// `fire` releases every current waiter and makes later `wait` calls return
/// immediately. Firing never blocks and a second `fire` is a no-op.
#[derive(Debug, Default)]
pub struct ReadyGate {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl ReadyGate {
    /// Creates a gate that has not fired yet.
    pub fn new() -> ReadyGate {
        ReadyGate::default()
    }

    /// Opens the gate. Returns `true` if this call was the one that fired it.
    pub fn fire(&self) -> bool {
        let mut fired = lock(&self.fired);
        if *fired {
            return false;
        }
        *fired = true;
        self.cond.notify_all();
        true
    }

    /// Blocks until the gate fires.
    pub fn wait(&self) {
        let fired = lock(&self.fired);
        let _fired = self
            .cond
            .wait_while(fired, |fired| !*fired)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// True once the gate has fired.
    pub fn is_fired(&self) -> bool {
        *lock(&self.fired)
    }
}
