//! In-process fan-out of inbound frames and lifecycle transitions.
//!
//! Dispatch is keyed by a closed set of event kinds rather than free-form
//! strings. Handlers for a kind fire in registration order; a failing
//! handler is logged and never blocks delivery to the rest.
//!
//! Inbound frames raise a generic [`EventKind::Message`] event, and frames
//! whose envelope declares a `type` additionally reach handlers registered
//! for that kind string via [`EventBus::on_message_kind`].

use crate::envelope::Envelope;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Error type handlers may surface; logged per handler, never propagated.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type Handler = Arc<dyn Fn(&TransportEvent) -> Result<(), BoxError> + Send + Sync>;

/// A transport lifecycle transition or an inbound frame.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Socket opened; queue flushed and subscriptions replayed.
    Connected,
    /// Socket closed, whether expected or not.
    Disconnected,
    /// Socket opened after one or more failed attempts. Raised before
    /// `Connected`; the very first connection of a session does not raise it.
    Reconnected,
    /// An inbound frame.
    Message { envelope: Envelope },
    /// A transport failure, including the terminal reconnect-exhausted case.
    Error { cause: String },
    /// The local subscription set changed.
    SubscriptionChanged { topic: String, subscribed: bool },
}

impl TransportEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connected => EventKind::Connected,
            Self::Disconnected => EventKind::Disconnected,
            Self::Reconnected => EventKind::Reconnected,
            Self::Message { .. } => EventKind::Message,
            Self::Error { .. } => EventKind::Error,
            Self::SubscriptionChanged { .. } => EventKind::SubscriptionChanged,
        }
    }
}

/// Discriminant used for handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    Reconnected,
    Message,
    Error,
    SubscriptionChanged,
}

/// Opaque registration handle returned by `on`/`on_message_kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Multi-listener event registry.
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    lifecycle: RwLock<HashMap<EventKind, Vec<(HandlerId, Handler)>>>,
    by_message_kind: RwLock<HashMap<String, Vec<(HandlerId, Handler)>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an event kind.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&TransportEvent) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        self.lifecycle
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Register a handler for inbound frames whose envelope `type` equals
    /// `message_kind`. Fires after the generic `Message` handlers.
    pub fn on_message_kind<F>(&self, message_kind: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(&TransportEvent) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        self.by_message_kind
            .write()
            .entry(message_kind.into())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a previously registered handler. Returns `false` if unknown.
    pub fn off(&self, id: HandlerId) -> bool {
        let mut removed = false;
        for handlers in self.lifecycle.write().values_mut() {
            let before = handlers.len();
            handlers.retain(|(hid, _)| *hid != id);
            removed |= handlers.len() != before;
        }
        if !removed {
            for handlers in self.by_message_kind.write().values_mut() {
                let before = handlers.len();
                handlers.retain(|(hid, _)| *hid != id);
                removed |= handlers.len() != before;
            }
        }
        removed
    }

    /// Fan an event out to all matching handlers.
    ///
    /// Runs on the caller's task; a slow handler delays the ones after it.
    pub fn dispatch(&self, event: &TransportEvent) {
        let generic = {
            self.lifecycle
                .read()
                .get(&event.kind())
                .cloned()
                .unwrap_or_default()
        };
        self.run_handlers(&generic, event);

        if let TransportEvent::Message { envelope } = event {
            if let Some(kind) = &envelope.kind {
                let typed = { self.by_message_kind.read().get(kind).cloned() };
                if let Some(handlers) = typed {
                    self.run_handlers(&handlers, event);
                }
            }
        }
    }

    fn run_handlers(&self, handlers: &[(HandlerId, Handler)], event: &TransportEvent) {
        for (id, handler) in handlers {
            if let Err(e) = handler(event) {
                warn!(handler = ?id, event = ?event.kind(), error = %e, "event handler failed");
            }
        }
    }

    fn allocate_id(&self) -> HandlerId {
        HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn recording_handler(
        log: &Arc<Mutex<Vec<&'static str>>>,
        tag: &'static str,
    ) -> impl Fn(&TransportEvent) -> Result<(), BoxError> + Send + Sync + 'static {
        let log = log.clone();
        move |_| {
            log.lock().unwrap().push(tag);
            Ok(())
        }
    }

    #[test]
    fn test_handlers_fire_in_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.on(EventKind::Connected, recording_handler(&log, "first"));
        bus.on(EventKind::Connected, recording_handler(&log, "second"));
        bus.dispatch(&TransportEvent::Connected);

        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_failing_handler_does_not_block_the_rest() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.on(EventKind::Error, |_| Err("boom".into()));
        bus.on(EventKind::Error, recording_handler(&log, "survivor"));
        bus.dispatch(&TransportEvent::Error {
            cause: "test".to_string(),
        });

        assert_eq!(*log.lock().unwrap(), vec!["survivor"]);
    }

    #[test]
    fn test_off_removes_handler() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let id = bus.on(EventKind::Disconnected, recording_handler(&log, "gone"));
        assert!(bus.off(id));
        assert!(!bus.off(id));

        bus.dispatch(&TransportEvent::Disconnected);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_message_dispatches_generic_then_typed() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.on_message_kind("alert", recording_handler(&log, "typed"));
        bus.on(EventKind::Message, recording_handler(&log, "generic"));

        let envelope = Envelope::from(json!({"type":"alert","severity":"high"}));
        bus.dispatch(&TransportEvent::Message { envelope });

        assert_eq!(*log.lock().unwrap(), vec!["generic", "typed"]);
    }

    #[test]
    fn test_untyped_message_skips_typed_handlers() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.on_message_kind("alert", recording_handler(&log, "typed"));

        let envelope = Envelope::from(json!({"hello":1}));
        bus.dispatch(&TransportEvent::Message { envelope });

        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_off_removes_typed_handler() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let id = bus.on_message_kind("tick", recording_handler(&log, "tick"));
        assert!(bus.off(id));

        let envelope = Envelope::from(json!({"type":"tick"}));
        bus.dispatch(&TransportEvent::Message { envelope });
        assert!(log.lock().unwrap().is_empty());
    }
}
