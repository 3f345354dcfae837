//! Stream-returning facade over a callback bus.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use super::adapter::{Emitter, FireMode};
use super::cursor::{Exchange, StreamCursor};
use super::message::{reply_handler, Message};
use super::observable::Observable;
use crate::bus::{EventBus, MessageHandler, RawMessage};
use crate::config::BusConfig;

/// Stream-returning facade over an [`EventBus`].
///
/// Every operation hands the bus a callback and returns an [`Observable`]
/// fed by it:
///
/// | operation              | mode              | triggered on        |
/// |------------------------|-------------------|---------------------|
/// | `send`                 | memoized          | call                |
/// | `observe_send`         | per subscription  | each subscription   |
/// | `register_handler`     | multi-fire        | each subscription   |
/// | `observe_stream`       | multi-fire        | each subscription   |
/// | `close`                | memoized          | call                |
pub struct RxBus<B> {
    bus: Arc<B>,
    config: BusConfig,
}

impl<B> Clone for RxBus<B> {
    fn clone(&self) -> Self {
        Self {
            bus: Arc::clone(&self.bus),
            config: self.config.clone(),
        }
    }
}

impl<B: EventBus> RxBus<B> {
    pub fn new(bus: B) -> Self {
        Self::with_config(bus, BusConfig::default())
    }

    pub fn with_config(bus: B, config: BusConfig) -> Self {
        Self::from_arc(Arc::new(bus), config)
    }

    pub fn from_arc(bus: Arc<B>, config: BusConfig) -> Self {
        Self { bus, config }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// The wrapped callback bus.
    pub fn inner(&self) -> &Arc<B> {
        &self.bus
    }

    fn default_timeout(&self) -> Duration {
        self.config.default_timeout()
    }

    /// Send now; every subscriber sees the same reply.
    pub fn send(&self, address: &str, body: impl Into<Value>) -> Observable<Message> {
        let bus = Arc::clone(&self.bus);
        let address = address.to_string();
        let body = body.into();
        let inherited = self.default_timeout();
        let reply = Observable::new(FireMode::Memoized, move |emitter| {
            bus.send(&address, body.clone(), Some(reply_handler(emitter, inherited)));
        });
        reply.start();
        reply
    }

    /// Send now, failing the reply with a timeout after `timeout`.
    pub fn send_with_timeout(&self, address: &str, body: impl Into<Value>, timeout: Duration) -> Observable<Message> {
        let bus = Arc::clone(&self.bus);
        let address = address.to_string();
        let body = body.into();
        let inherited = self.default_timeout();
        let reply = Observable::new(FireMode::Memoized, move |emitter| {
            bus.send_with_timeout(&address, body.clone(), timeout, reply_handler(emitter, inherited));
        });
        reply.start();
        reply
    }

    /// Send once per subscription, with the default timeout.
    pub fn observe_send(&self, address: &str, body: impl Into<Value>) -> Observable<Message> {
        self.observe_send_with_timeout(address, body, self.default_timeout())
    }

    pub fn observe_send_with_timeout(
        &self,
        address: &str,
        body: impl Into<Value>,
        timeout: Duration,
    ) -> Observable<Message> {
        let bus = Arc::clone(&self.bus);
        let address = address.to_string();
        let body = body.into();
        let inherited = self.default_timeout();
        Observable::new(FireMode::PerSubscription, move |emitter| {
            bus.send_with_timeout(&address, body.clone(), timeout, reply_handler(emitter, inherited));
        })
    }

    /// Every subscription registers its own handler and receives every
    /// message delivered to it. Cancelling unregisters.
    pub fn register_handler(&self, address: &str) -> Observable<Message> {
        self.listen(address, false)
    }

    /// Like [`register_handler`](Self::register_handler), visible to this node only.
    pub fn register_local_handler(&self, address: &str) -> Observable<Message> {
        self.listen(address, true)
    }

    fn listen(&self, address: &str, local: bool) -> Observable<Message> {
        let bus = Arc::clone(&self.bus);
        let address = address.to_string();
        let inherited = self.default_timeout();
        Observable::new(FireMode::MultiFire, move |emitter: Emitter<Message>| {
            let deliver = emitter.clone();
            let handler: MessageHandler = Arc::new(move |raw: RawMessage| deliver.next(Message::new(raw, inherited)));
            let id = if local {
                bus.register_local_handler(&address, handler)
            } else {
                bus.register_handler(&address, handler)
            };

            let (bus, address) = (Arc::clone(&bus), address.clone());
            emitter.on_cancel(move || {
                if bus.unregister_handler(&address, id) {
                    debug!(address = %address, %id, "subscription ended, handler unregistered");
                }
            });
        })
    }

    /// Start a chunked exchange per subscription: one cursor per chunk,
    /// completing after the chunk that carries no reply address.
    pub fn observe_stream(&self, address: &str, body: impl Into<Value>) -> Observable<StreamCursor> {
        let bus = Arc::clone(&self.bus);
        let address = address.to_string();
        let body = body.into();
        let inherited = self.default_timeout();
        Observable::new(FireMode::MultiFire, move |emitter| {
            let exchange = Exchange::open(emitter, inherited);
            bus.send(&address, body.clone(), Some(exchange.chunk_handler()));
        })
    }

    /// Fan out to every handler at `address`.
    pub fn publish(&self, address: &str, body: impl Into<Value>) {
        self.bus.publish(address, body.into());
    }

    /// Shut the bus down now. The returned stream yields `()` and completes
    /// once shutdown has finished.
    pub fn close(&self) -> Observable<()> {
        let bus = Arc::clone(&self.bus);
        let done = Observable::new(FireMode::Memoized, move |emitter: Emitter<()>| {
            bus.close(Box::new(move |result| emitter.fire(result)));
        });
        done.start();
        done
    }
}
