//! Chunked request/response exchanges.
//!
//! The requester sends once; every reply is a chunk. A chunk that carries a
//! reply address invites the consumer to pull the next one by replying to
//! it; the first chunk without one is the last. Each chunk reaches the
//! consumer as a [`StreamCursor`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use super::adapter::Emitter;
use super::message::Message;
use super::regulator::{GateHandle, PendingPull};
use crate::bus::{RawMessage, ReplyHandler};
use crate::error::{BusError, ReplyError};
use crate::sync::lock;

/// State shared by every cursor of one exchange.
pub(crate) struct Exchange {
    emitter: Emitter<StreamCursor>,
    default_timeout: Duration,
    chunks: AtomicU64,
    gate: Mutex<Option<GateHandle>>,
}

impl Exchange {
    pub(crate) fn open(emitter: Emitter<StreamCursor>, default_timeout: Duration) -> Arc<Self> {
        let exchange = Arc::new(Self {
            emitter,
            default_timeout,
            chunks: AtomicU64::new(0),
            gate: Mutex::new(None),
        });
        let weak = Arc::downgrade(&exchange);
        exchange.emitter.on_cancel(move || {
            if let Some(exchange) = weak.upgrade() {
                exchange.detach_gate();
            }
        });
        exchange
    }

    /// Reply callback that turns the next chunk into a cursor.
    pub(crate) fn chunk_handler(self: &Arc<Self>) -> ReplyHandler {
        let exchange = Arc::clone(self);
        Box::new(move |outcome| exchange.on_chunk(outcome))
    }

    fn on_chunk(self: Arc<Self>, outcome: Result<RawMessage, ReplyError>) {
        // Counted under the gate lock so a chunk is reported to a gate
        // exactly once: by `arrived` here or in the count taken on attach.
        let (position, gate) = {
            let slot = lock(&self.gate);
            let position = match &outcome {
                Ok(_) => self.chunks.fetch_add(1, Ordering::SeqCst),
                Err(_) => self.chunks.load(Ordering::SeqCst),
            };
            (position, slot.clone())
        };
        if let Some(gate) = gate {
            gate.arrived();
        }
        match outcome {
            Ok(raw) => {
                let message = Message::new(raw, self.default_timeout);
                let last = message.reply_address().is_none();
                let cursor = StreamCursor {
                    message,
                    position,
                    requested: Arc::new(AtomicBool::new(false)),
                    exchange: Arc::clone(&self),
                };
                self.emitter.next(cursor);
                if last {
                    debug!(chunks = position + 1, "stream exchange finished");
                    self.emitter.complete();
                }
            }
            Err(err) => self.emitter.error(err.into()),
        }
    }

    fn gate(&self) -> Option<GateHandle> {
        lock(&self.gate).clone()
    }

    fn attach_gate(&self, gate: &GateHandle) {
        let mut slot = lock(&self.gate);
        if slot.is_none() && self.emitter.is_active() {
            gate.attached(self.chunks.load(Ordering::SeqCst));
            *slot = Some(gate.clone());
        }
    }

    fn detach_gate(&self) {
        let gate = lock(&self.gate).take();
        if let Some(gate) = gate {
            gate.terminate();
        }
    }
}

/// One chunk of a streaming exchange plus the right to pull the next one.
#[derive(Clone)]
pub struct StreamCursor {
    message: Message,
    position: u64,
    requested: Arc<AtomicBool>,
    exchange: Arc<Exchange>,
}

impl StreamCursor {
    pub fn value(&self) -> &Value {
        self.message.body()
    }

    pub fn value_as<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        self.message.body_as()
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Zero-based index of this chunk within the exchange.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// The final chunk cannot be answered.
    pub fn is_last(&self) -> bool {
        self.message.reply_address().is_none()
    }

    /// Ask the producer for the next chunk by replying `body` to this one.
    ///
    /// Fails on the last chunk, once the exchange has ended or been
    /// cancelled, and when the next chunk was already requested.
    pub fn request_next(&self, body: impl Into<Value>) -> Result<(), BusError> {
        if self.is_last() {
            warn!(position = self.position, "next chunk requested after the last one");
            return Err(BusError::Protocol(format!(
                "chunk {} is the last chunk of the exchange",
                self.position
            )));
        }
        if !self.exchange.emitter.is_active() {
            warn!(position = self.position, "next chunk requested on an inactive exchange");
            return Err(BusError::Protocol("stream exchange is no longer active".to_string()));
        }
        if self.requested.swap(true, Ordering::SeqCst) {
            warn!(position = self.position, "next chunk requested twice");
            return Err(BusError::Protocol(format!(
                "chunk after {} was already requested",
                self.position
            )));
        }

        let pull = PendingPull::new(self.message.clone(), body.into(), self.exchange.chunk_handler());
        match self.exchange.gate() {
            Some(gate) => gate.submit(pull),
            None => {
                pull.issue();
                Ok(())
            }
        }
    }

    /// Route this exchange's pulls through a regulator gate from now on.
    pub(crate) fn attach_gate(&self, gate: &GateHandle) {
        self.exchange.attach_gate(gate);
    }
}

impl fmt::Debug for StreamCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCursor")
            .field("position", &self.position)
            .field("value", self.value())
            .field("last", &self.is_last())
            .finish()
    }
}
