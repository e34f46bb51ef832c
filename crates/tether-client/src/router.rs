//! Envelope routing between the transport and module clients.
//!
//! One router sits between the supervisor's transport event loop and the
//! registered module handlers. Inbound envelopes go to the handler owning
//! their module name, in arrival order; envelopes for unregistered modules
//! are logged and dropped so a newer sidecar never crashes an older client.
//! Outbound sends pass through a gate that holds the current transport:
//! while the sidecar is down the gate is empty and sends fail fast with
//! [`SendError::NotConnected`].
//!
//! Handlers are held as weak references. A dropped module client simply
//! stops receiving; the router prunes the dead entry on next dispatch.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, RwLock, Weak},
};

use tether_proto::Envelope;

use crate::{error::SendError, transport::Transport};

/// Link-state notifications the supervisor fans out to module clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The sidecar died or its pipe closed; in-flight work is gone.
    Lost {
        /// Short human-readable cause (exit code, pipe error).
        reason: String,
    },

    /// A restarted sidecar reached readiness.
    Restored,

    /// The restart budget is exhausted; no further restarts will happen.
    Unavailable,

    /// The transport shed this queued envelope before it reached the wire.
    SendDropped {
        /// The envelope that never made it out.
        envelope: Box<Envelope>,
    },
}

/// A module client's receive surface.
///
/// Methods take `&self`: handlers guard their own state internally so the
/// router can hold them behind `Arc` and dispatch without coordination.
pub trait ModuleHandler: Send + Sync {
    /// Module name this handler owns (an `Envelope::module` value).
    fn module(&self) -> &'static str;

    /// One inbound envelope for this module, in arrival order.
    fn handle_envelope(&self, envelope: Envelope);

    /// A link-state change affecting the whole sidecar.
    fn handle_link(&self, event: &LinkEvent);
}

/// Dispatch table plus the outbound transport gate.
#[derive(Default)]
pub struct Router {
    table: Mutex<HashMap<String, Weak<dyn ModuleHandler>>>,
    gate: RwLock<Option<Transport>>,
}

impl Router {
    /// Create a router with no handlers and no transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, HashMap<String, Weak<dyn ModuleHandler>>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handler for its module name.
    ///
    /// Registering a second handler for the same module replaces the first.
    pub fn register(&self, handler: &Arc<dyn ModuleHandler>) {
        let module = handler.module();
        let previous = self.lock_table().insert(module.to_owned(), Arc::downgrade(handler));
        if previous.is_some_and(|old| old.upgrade().is_some()) {
            tracing::warn!(module, "replacing registered module handler");
        }
    }

    /// Remove the handler for `module`, if any.
    pub fn unregister(&self, module: &str) {
        self.lock_table().remove(module);
    }

    /// Install or clear the outbound transport.
    ///
    /// The supervisor sets this when a sidecar reaches readiness and clears
    /// it the moment the process is stopping or gone.
    pub fn set_transport(&self, transport: Option<Transport>) {
        let mut gate = self.gate.write().unwrap_or_else(PoisonError::into_inner);
        *gate = transport;
    }

    /// Queue an envelope for the sidecar.
    ///
    /// # Errors
    ///
    /// [`SendError::NotConnected`] while no ready transport is installed.
    pub fn send(&self, envelope: Envelope) -> Result<(), SendError> {
        let gate = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        match gate.as_ref() {
            Some(transport) => transport.send(envelope),
            None => Err(SendError::NotConnected),
        }
    }

    /// Route one inbound envelope to the handler owning its module.
    ///
    /// Unregistered or dropped handlers: warn and drop the envelope.
    pub fn dispatch(&self, envelope: Envelope) {
        let handler = {
            let mut table = self.lock_table();
            match table.get(&envelope.module).map(Weak::upgrade) {
                Some(Some(handler)) => Some(handler),
                Some(None) => {
                    table.remove(&envelope.module);
                    None
                },
                None => None,
            }
        };

        match handler {
            Some(handler) => handler.handle_envelope(envelope),
            None => {
                tracing::warn!(
                    module = %envelope.module,
                    kind = %envelope.kind,
                    "dropping envelope for unregistered module"
                );
            },
        }
    }

    /// Deliver a link-state change to every live handler.
    pub fn broadcast_link(&self, event: &LinkEvent) {
        let handlers: Vec<_> = {
            let mut table = self.lock_table();
            table.retain(|_, weak| weak.upgrade().is_some());
            table.values().filter_map(Weak::upgrade).collect()
        };

        for handler in handlers {
            handler.handle_link(event);
        }
    }

    /// Report a shed outbound envelope back to the module that queued it.
    pub fn notify_overflow(&self, envelope: Box<Envelope>, dropped: u64) {
        tracing::warn!(
            module = %envelope.module,
            dropped,
            "outbound envelope shed by transport queue"
        );

        let handler = self.lock_table().get(&envelope.module).and_then(Weak::upgrade);
        match handler {
            Some(handler) => handler.handle_link(&LinkEvent::SendDropped { envelope }),
            None => {
                tracing::warn!(module = %envelope.module, "shed envelope's module not registered");
            },
        }
    }
}
