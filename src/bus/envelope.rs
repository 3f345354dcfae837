//! A message as delivered by the bus.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::event_bus::ReplyHandler;

/// One bus envelope: a body plus, when the sender allows it, a way back.
///
/// The envelope is owned by the bus; holders only use it to read the body
/// and to answer the sender.
pub trait Envelope: Send + Sync {
    /// Opaque payload.
    fn body(&self) -> &Value;

    /// Present only when the sender is waiting for a reply. An absent reply
    /// address marks the final chunk of a streaming exchange.
    fn reply_address(&self) -> Option<&str>;

    /// Answer the sender. With a `continuation` the reply itself carries a
    /// reply address and the continuation receives the answer to it.
    fn reply(&self, body: Value, continuation: Option<ReplyHandler>);

    /// Answer the sender and wait at most `timeout` for the answer to the reply.
    fn reply_with_timeout(&self, body: Value, timeout: Duration, continuation: ReplyHandler);

    /// Report a failure back to the sender.
    fn fail(&self, code: i32, message: &str);
}

/// Shared handle to an envelope.
pub type RawMessage = Arc<dyn Envelope>;
