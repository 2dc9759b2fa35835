//! Listener fan-out for subscription providers.
//!
//! # Delivery rules
//!
//! - Listeners form a set keyed by `Arc` identity.  Registering the same
//!   `Arc` twice keeps one entry; two different `Arc`s wrapping equal
//!   closures are two listeners.
//! - A sample goes to the listeners registered when delivery starts, in
//!   registration order, on the caller's thread.
//! - A panicking listener is logged and skipped.  The others still receive
//!   the sample and later samples keep flowing.
//! - [`ListenerSet::close`] waits for an in-progress delivery to finish and
//!   then shuts the gate: once it returns, no listener is ever called again.
//!
//! A listener must not call `close` on the set it is being called from; the
//! delivery gate is not reentrant.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::warn;

use crate::model::value::ElementValue;

/// Receives values pushed by a subscription.
pub trait NewDataListener: Send + Sync {
    fn new_data_received(&self, value: &ElementValue);
}

impl<F> NewDataListener for F
where
    F: Fn(&ElementValue) + Send + Sync,
{
    fn new_data_received(&self, value: &ElementValue) {
        self(value)
    }
}

/// Thread-safe set of listeners with a close gate.
pub struct ListenerSet {
    listeners: Mutex<Vec<Arc<dyn NewDataListener>>>,
    /// `true` while the set is open.  Held for the duration of a delivery.
    gate: Mutex<bool>,
}

impl std::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("listeners", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Default for ListenerSet {
    fn default() -> Self {
        Self::new()
    }
}

fn same_listener(a: &Arc<dyn NewDataListener>, b: &Arc<dyn NewDataListener>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ListenerSet {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            gate: Mutex::new(true),
        }
    }

    /// Adds `listener`; returns `false` if it was already registered.
    pub fn add(&self, listener: Arc<dyn NewDataListener>) -> bool {
        let mut listeners = lock(&self.listeners);
        if listeners.iter().any(|l| same_listener(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Removes `listener`; returns `false` if it was not registered.
    pub fn remove(&self, listener: &Arc<dyn NewDataListener>) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|l| !same_listener(l, listener));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        lock(&self.listeners).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hands `value` to every registered listener.
    ///
    /// Returns the number of listeners that returned normally.  Nothing is
    /// delivered once the set is closed.
    pub fn deliver(&self, value: &ElementValue) -> usize {
        let open = lock(&self.gate);
        if !*open {
            return 0;
        }
        let snapshot: Vec<Arc<dyn NewDataListener>> = lock(&self.listeners).clone();

        let mut delivered = 0;
        for listener in snapshot {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                listener.new_data_received(value);
            }));
            match result {
                Ok(()) => delivered += 1,
                Err(payload) => {
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_string());
                    warn!(panic = %message, "new-data listener panicked; continuing delivery");
                }
            }
        }
        drop(open);
        delivered
    }

    /// Closes the set.  Blocks until any delivery in progress has finished.
    pub fn close(&self) {
        *lock(&self.gate) = false;
    }

    pub fn is_closed(&self) -> bool {
        !*lock(&self.gate)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
