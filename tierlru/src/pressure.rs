//! Memory Pressure Hook
//!
//! The host process owns a [`PressureMonitor`] and wires it to whatever
//! low-memory notification its platform offers. Caches register themselves
//! as [`PressureHandler`]s; each `notify()` delivers the payload-less signal
//! to every handler still alive.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Receiver of low-memory signals
pub trait PressureHandler: Send + Sync {
    fn on_low_memory(&self);
}

/// Registration handle returned by [`PressureMonitor::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Registry of pressure handlers.
///
/// Holds handlers weakly, so registering a cache does not keep it alive.
#[derive(Default)]
pub struct PressureMonitor {
    handlers: RwLock<HashMap<HandlerId, Weak<dyn PressureHandler>>>,
    next_id: AtomicU64,
}

impl PressureMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `handler` to future signals
    pub fn register<H: PressureHandler + 'static>(&self, handler: &Arc<H>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let erased: Arc<dyn PressureHandler> = handler.clone();
        self.handlers.write().insert(id, Arc::downgrade(&erased));
        debug!("Pressure handler {:?} registered", id);
        id
    }

    /// Returns `false` if `id` was not registered
    pub fn unregister(&self, id: HandlerId) -> bool {
        let removed = self.handlers.write().remove(&id).is_some();
        if removed {
            debug!("Pressure handler {:?} unregistered", id);
        }
        removed
    }

    /// Deliver a low-memory signal to every live handler.
    ///
    /// Handlers run on the calling thread, outside the registry lock.
    /// Dropped handlers are pruned. Returns the number notified.
    pub fn notify(&self) -> usize {
        let live: Vec<Arc<dyn PressureHandler>> = {
            let mut handlers = self.handlers.write();
            handlers.retain(|_, handler| handler.strong_count() > 0);
            handlers.values().filter_map(Weak::upgrade).collect()
        };

        info!("Low memory signal -> {} handlers", live.len());
        for handler in &live {
            handler.on_low_memory();
        }
        live.len()
    }

    /// Number of registered handlers that are still alive
    pub fn handler_count(&self) -> usize {
        self.handlers
            .read()
            .values()
            .filter(|handler| handler.strong_count() > 0)
            .count()
    }
}
