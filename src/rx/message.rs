//! Reactive view of a delivered message.

use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::adapter::{Emitter, FireMode};
use super::observable::Observable;
use crate::bus::{RawMessage, ReplyHandler};
use crate::error::BusError;

/// Reactive view of a bus envelope.
///
/// Cloning shares the envelope. Replies go back through the bus that
/// delivered the message.
#[derive(Clone)]
pub struct Message {
    raw: RawMessage,
    default_timeout: Duration,
}

impl Message {
    pub fn new(raw: RawMessage, default_timeout: Duration) -> Self {
        Self { raw, default_timeout }
    }

    pub fn body(&self) -> &Value {
        self.raw.body()
    }

    /// Decode the body into a typed value.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        Ok(T::deserialize(self.raw.body())?)
    }

    pub fn reply_address(&self) -> Option<&str> {
        self.raw.reply_address()
    }

    /// Timeout applied by [`observe_reply`](Self::observe_reply).
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Underlying envelope.
    pub fn raw(&self) -> &RawMessage {
        &self.raw
    }

    /// Fire-and-forget reply.
    pub fn reply(&self, body: impl Into<Value>) {
        self.raw.reply(body.into(), None);
    }

    /// Reply and hand the answer to the reply to `continuation`.
    pub fn reply_with_handler(&self, body: impl Into<Value>, continuation: ReplyHandler) {
        self.raw.reply(body.into(), Some(continuation));
    }

    /// Report a failure to the sender.
    pub fn fail(&self, code: i32, message: &str) {
        self.raw.fail(code, message);
    }

    /// Reply and observe the answer, waiting at most the default timeout.
    ///
    /// The reply is sent on first subscription and its answer is memoized.
    pub fn observe_reply(&self, body: impl Into<Value>) -> Observable<Message> {
        self.observe_reply_with_timeout(body, self.default_timeout)
    }

    pub fn observe_reply_with_timeout(&self, body: impl Into<Value>, timeout: Duration) -> Observable<Message> {
        let raw = self.raw.clone();
        let body = body.into();
        let inherited = self.default_timeout;
        Observable::new(FireMode::Memoized, move |emitter| {
            raw.reply_with_timeout(body.clone(), timeout, reply_handler(emitter, inherited));
        })
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("body", self.body())
            .field("reply_address", &self.reply_address())
            .finish()
    }
}

/// Bridge a one-shot bus reply into a single-fire emitter.
pub(crate) fn reply_handler(emitter: Emitter<Message>, default_timeout: Duration) -> ReplyHandler {
    Box::new(move |outcome| {
        emitter.fire(
            outcome
                .map(|raw| Message::new(raw, default_timeout))
                .map_err(BusError::from),
        )
    })
}
