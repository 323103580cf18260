//! Inbound Message Dispatch
//!
//! The session task owns the socket and decodes frames in order; everything
//! it does not handle itself is routed by [`MessageType`] to a registered
//! [`MessageHandler`]. Handlers run synchronously on the session task and
//! must not block.

use std::collections::HashMap;
use std::sync::Arc;

use super::messages::{Message, MessageType};

/// Consumer of a subset of inbound messages.
pub trait MessageHandler: Send + Sync {
    /// Process one message routed to this handler.
    fn handle(&self, message: Message);

    /// The session ended; resolve anything still in flight.
    fn close(&self);
}

/// Routing table from message type to handler.
#[derive(Default)]
pub struct HandlerTable {
    routes: HashMap<MessageType, Arc<dyn MessageHandler>>,
    handlers: Vec<Arc<dyn MessageHandler>>,
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut routed: Vec<u16> = self.routes.keys().map(|ty| ty.code()).collect();
        routed.sort_unstable();
        f.debug_struct("HandlerTable")
            .field("routes", &routed)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl HandlerTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `types` to `handler`, replacing earlier routes for those types.
    pub fn register(&mut self, types: &[MessageType], handler: Arc<dyn MessageHandler>) {
        for ty in types {
            self.routes.insert(*ty, Arc::clone(&handler));
        }
        if !self.handlers.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            self.handlers.push(handler);
        }
    }

    /// Whether a handler is registered for `ty`.
    #[must_use]
    pub fn handles(&self, ty: MessageType) -> bool {
        self.routes.contains_key(&ty)
    }

    /// Route a message.
    ///
    /// # Errors
    ///
    /// Hands the message back when no handler is registered for its type.
    pub fn dispatch(&self, message: Message) -> Result<(), Message> {
        let handler = message
            .message_type()
            .and_then(|ty| self.routes.get(&ty));
        match handler {
            Some(handler) => {
                handler.handle(message);
                Ok(())
            }
            None => Err(message),
        }
    }

    /// Close every registered handler once.
    pub fn close_all(&self) {
        for handler in &self.handlers {
            handler.close();
        }
    }
}
