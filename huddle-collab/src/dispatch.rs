//! Observer registry keyed by message kind.

use std::collections::HashMap;

use crate::protocol::{Envelope, MessageKind};

/// Inbound message observer.
pub type Handler = Box<dyn FnMut(&Envelope) + Send>;

/// Handlers per message kind, invoked in registration order.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<MessageKind, Vec<Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for every inbound message of `kind`.
    pub fn on<F>(&mut self, kind: MessageKind, handler: F)
    where
        F: FnMut(&Envelope) + Send + 'static,
    {
        self.handlers.entry(kind).or_default().push(Box::new(handler));
    }

    /// Run the handlers for `envelope`'s kind. Returns how many ran.
    pub fn dispatch(&mut self, envelope: &Envelope) -> usize {
        match self.handlers.get_mut(&envelope.kind()) {
            Some(handlers) => {
                for handler in handlers.iter_mut() {
                    handler(envelope);
                }
                handlers.len()
            }
            None => 0,
        }
    }

    pub fn handler_count(&self, kind: MessageKind) -> usize {
        self.handlers.get(&kind).map_or(0, Vec::len)
    }

    pub fn clear(&mut self, kind: MessageKind) {
        self.handlers.remove(&kind);
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<&MessageKind, usize> =
            self.handlers.iter().map(|(k, v)| (k, v.len())).collect();
        f.debug_struct("HandlerRegistry").field("handlers", &counts).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_dispatch_by_kind_in_order() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        for tag in ["first", "second"] {
            let seen = seen.clone();
            registry.on(MessageKind::Pong, move |_| seen.lock().unwrap().push(tag));
        }

        let pong = Envelope::new(Message::Pong, "relay", None);
        assert_eq!(registry.dispatch(&pong), 2);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);

        let ping = Envelope::new(Message::Ping, "relay", None);
        assert_eq!(registry.dispatch(&ping), 0);
    }

    #[test]
    fn test_clear_kind() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        let h = hits.clone();
        registry.on(MessageKind::Ping, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(registry.handler_count(MessageKind::Ping), 1);
        registry.clear(MessageKind::Ping);
        registry.dispatch(&Envelope::new(Message::Ping, "relay", None));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
