// Listener registry for relay events.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use checkin_common::protocol::events::InboundEvent;
use tracing::warn;

type Handler = Arc<dyn Fn(&InboundEvent) + Send + Sync>;

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    entries: Vec<(u64, Handler)>,
}

/// Insertion-ordered set of listeners.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl HandlerRegistry {
    pub(crate) fn register<F>(&self, handler: F) -> HandlerHandle
    where
        F: Fn(&InboundEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.next_id += 1;
        let id = inner.next_id;
        inner.entries.push((id, Arc::new(handler)));
        HandlerHandle { id, registry: Arc::downgrade(&self.inner), detached: false }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).entries.len()
    }

    /// Call every listener in registration order. A panicking listener is
    /// logged and skipped. Returns the number of listeners that panicked.
    pub(crate) fn dispatch(&self, event: &InboundEvent) -> usize {
        // Listeners may register or drop handles while running.
        let snapshot: Vec<(u64, Handler)> =
            self.inner.lock().unwrap_or_else(PoisonError::into_inner).entries.clone();

        let mut failed = 0;
        for (id, handler) in snapshot {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(event))) {
                failed += 1;
                warn!(handler_id = id, panic = panic_message(&*panic), "relay listener panicked");
            }
        }
        failed
    }
}

/// Keeps a listener registered.
///
/// Dropping the handle (or calling [`HandlerHandle::unregister`]) removes the
/// listener. [`HandlerHandle::detach`] keeps it for as long as the relay
/// lives.
#[must_use = "dropping the handle unregisters the listener; call `detach` to keep it"]
pub struct HandlerHandle {
    id: u64,
    registry: Weak<Mutex<RegistryInner>>,
    detached: bool,
}

impl HandlerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unregister(self) {}

    pub fn detach(mut self) {
        self.detached = true;
    }
}

impl std::fmt::Debug for HandlerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerHandle").field("id", &self.id).field("detached", &self.detached).finish()
    }
}

impl Drop for HandlerHandle {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            let mut inner = registry.lock().unwrap_or_else(PoisonError::into_inner);
            inner.entries.retain(|(id, _)| *id != self.id);
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
