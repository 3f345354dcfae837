//! Callback-driven bus interface consumed by the reactive adapters.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::envelope::RawMessage;
use crate::error::{BusError, ReplyError};

/// One-shot callback receiving the reply to a send (or a reply).
pub type ReplyHandler = Box<dyn FnOnce(Result<RawMessage, ReplyError>) + Send>;

/// Callback invoked for every message delivered to a registered address.
pub type MessageHandler = Arc<dyn Fn(RawMessage) + Send + Sync>;

/// Callback invoked once the bus finished shutting down.
pub type CloseHandler = Box<dyn FnOnce(Result<(), BusError>) + Send>;

/// Identifies one handler registration so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

/// Addressable message bus with send/publish/reply and handler registration.
///
/// Implementations deliver every callback asynchronously on their own event
/// loop. The reactive layer never blocks on the bus: it hands over a
/// callback and reacts when it is invoked.
///
/// Callbacks for a given bus are expected to be invoked from one delivery
/// context at a time. The adapters guard their own state with short
/// critical sections, but ordering guarantees only hold for buses that
/// deliver sequentially.
pub trait EventBus: Send + Sync + 'static {
    /// Point-to-point send. When `reply` is given the receiver gets a reply
    /// address and the callback fires once with the outcome.
    fn send(&self, address: &str, body: Value, reply: Option<ReplyHandler>);

    /// Point-to-point send that fails the callback with a timeout when no
    /// reply arrives within `timeout`.
    fn send_with_timeout(&self, address: &str, body: Value, timeout: Duration, reply: ReplyHandler);

    /// Fan-out to every handler registered at `address`. Fire-and-forget.
    fn publish(&self, address: &str, body: Value);

    /// Register a handler that may be reached from anywhere on the bus.
    fn register_handler(&self, address: &str, handler: MessageHandler) -> HandlerId;

    /// Register a handler visible to this node only.
    fn register_local_handler(&self, address: &str, handler: MessageHandler) -> HandlerId;

    /// Remove a registration. Returns `false` when it was already gone.
    fn unregister_handler(&self, address: &str, id: HandlerId) -> bool;

    /// Shut the bus down; `done` fires when shutdown has finished.
    fn close(&self, done: CloseHandler);
}

impl<B: EventBus + ?Sized> EventBus for Arc<B> {
    fn send(&self, address: &str, body: Value, reply: Option<ReplyHandler>) {
        (**self).send(address, body, reply)
    }

    fn send_with_timeout(&self, address: &str, body: Value, timeout: Duration, reply: ReplyHandler) {
        (**self).send_with_timeout(address, body, timeout, reply)
    }

    fn publish(&self, address: &str, body: Value) {
        (**self).publish(address, body)
    }

    fn register_handler(&self, address: &str, handler: MessageHandler) -> HandlerId {
        (**self).register_handler(address, handler)
    }

    fn register_local_handler(&self, address: &str, handler: MessageHandler) -> HandlerId {
        (**self).register_local_handler(address, handler)
    }

    fn unregister_handler(&self, address: &str, id: HandlerId) -> bool {
        (**self).unregister_handler(address, id)
    }

    fn close(&self, done: CloseHandler) {
        (**self).close(done)
    }
}
