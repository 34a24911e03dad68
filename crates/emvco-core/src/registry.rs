//! Single-slot listener registry and notifier.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{trace, warn};

use crate::events::{ControlEvent, ControlListener};

/// Holds at most one listener. Registering replaces the previous one.
#[derive(Default)]
pub struct ListenerRegistry {
    slot: RwLock<Option<Arc<dyn ControlListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `listener`, returning the one it replaced.
    pub fn register(&self, listener: Arc<dyn ControlListener>) -> Option<Arc<dyn ControlListener>> {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        let previous = slot.replace(listener);
        trace!(replaced = previous.is_some(), "Listener registered");
        previous
    }

    /// Clear the slot, returning the listener that was installed.
    pub fn unregister(&self) -> Option<Arc<dyn ControlListener>> {
        self.slot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn is_registered(&self) -> bool {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Deliver `event` to the current listener, if any.
    ///
    /// The slot lock is released before the call, so a listener may
    /// re-register or unregister from inside `on_event`.
    pub fn notify(&self, event: &ControlEvent) {
        let listener = self
            .slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let Some(listener) = listener else {
            trace!(?event, "No listener registered, event dropped");
            return;
        };

        if panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(event))).is_err() {
            warn!(?event, "Listener panicked while handling event");
        }
    }
}
