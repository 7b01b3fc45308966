//! Readiness gate with queued callbacks.
//!
//! [`CallbackSet`] is a small two-state machine (`Loading` → `Ready`) used by
//! providers that finish their setup asynchronously. Callbacks registered
//! while loading are queued and fired exactly once when the gate opens;
//! callbacks registered after that fire immediately. [`CallbackSet::reset`]
//! closes the gate again for the next connect cycle without dropping
//! callbacks that are still queued.

use std::sync::Mutex;

/// A zero-argument callback fired once when the gate becomes ready.
pub type ReadyCallback = Box<dyn FnOnce() + Send>;

enum Gate {
    Loading(Vec<ReadyCallback>),
    Ready,
}

/// A collection of callbacks gated by a readiness flag.
pub struct CallbackSet {
    gate: Mutex<Gate>,
}

impl CallbackSet {
    /// Create a new gate in the loading state.
    pub fn new() -> Self {
        Self {
            gate: Mutex::new(Gate::Loading(Vec::new())),
        }
    }

    /// Whether the gate is open.
    pub fn is_ready(&self) -> bool {
        matches!(*self.gate.lock().unwrap(), Gate::Ready)
    }

    /// Register a callback.
    ///
    /// While loading the callback is queued; once ready it runs immediately
    /// on the calling thread. Either way it runs exactly once.
    pub fn add<F: FnOnce() + Send + 'static>(&self, callback: F) {
        {
            let mut gate = self.gate.lock().unwrap();
            if let Gate::Loading(queue) = &mut *gate {
                queue.push(Box::new(callback));
                return;
            }
        }
        // Already ready: fire outside the lock.
        callback();
    }

    /// Open the gate and fire all queued callbacks.
    ///
    /// Idempotent: opening an already-open gate does nothing.
    pub fn set_ready(&self) {
        self.set_ready_if(|| true);
    }

    /// Open the gate only if `condition` still holds.
    ///
    /// The condition is evaluated under the gate lock, so it is atomic with
    /// the transition: a concurrent [`reset`](CallbackSet::reset) on one side
    /// of the evaluation cannot interleave with the gate opening on the
    /// other. When the condition is false the gate stays closed and queued
    /// callbacks stay queued. Callbacks fire outside the lock. Returns
    /// whether the gate is open afterwards.
    pub fn set_ready_if(&self, condition: impl FnOnce() -> bool) -> bool {
        let queued = {
            let mut gate = self.gate.lock().unwrap();
            if !condition() {
                return matches!(*gate, Gate::Ready);
            }
            match std::mem::replace(&mut *gate, Gate::Ready) {
                Gate::Loading(queue) => queue,
                Gate::Ready => Vec::new(),
            }
        };
        for callback in queued {
            callback();
        }
        true
    }

    /// Close the gate for a new connect cycle.
    ///
    /// Callbacks queued but not yet fired remain queued; they fire on the
    /// next `set_ready`.
    pub fn reset(&self) {
        let mut gate = self.gate.lock().unwrap();
        if matches!(*gate, Gate::Ready) {
            *gate = Gate::Loading(Vec::new());
        }
    }

    /// Number of callbacks currently queued.
    pub fn pending_count(&self) -> usize {
        match &*self.gate.lock().unwrap() {
            Gate::Loading(queue) => queue.len(),
            Gate::Ready => 0,
        }
    }
}

impl Default for CallbackSet {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CallbackSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackSet")
            .field("ready", &self.is_ready())
            .field("pending", &self.pending_count())
            .finish()
    }
}
