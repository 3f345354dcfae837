//! In-memory event bus for tests and single-process deployments.
//!
//! This module provides an [`EventBus`] that needs no broker, useful for:
//! - Unit and integration testing of the reactive adapters
//! - Single-process applications
//! - Development and prototyping
//!
//! Every callback (handlers, replies, timeouts, close) runs on a single
//! delivery task per bus, in the order it was enqueued.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use super::envelope::{Envelope, RawMessage};
use super::event_bus::{CloseHandler, EventBus, HandlerId, MessageHandler, ReplyHandler};
use crate::error::ReplyError;
use crate::sync::lock;

type Job = Box<dyn FnOnce() + Send>;

/// In-memory event bus.
///
/// Features:
/// - Cheap to clone; clones share the same registry and delivery loop
/// - `send` picks one handler per message (round-robin), `publish` reaches all
/// - Replies, reply-to-reply chains and timeouts
/// - `close` fails pending replies and drops every registration
///
/// Must be created inside a Tokio runtime: construction spawns the delivery loop.
///
/// ## Example
///
/// ```
/// use std::sync::Arc;
/// use rx_eventbus::bus::{EventBus, InMemoryBus, RawMessage, ReplyHandler};
/// use serde_json::json;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let bus = InMemoryBus::new();
/// bus.register_handler("echo", Arc::new(|msg: RawMessage| msg.reply(msg.body().clone(), None)));
///
/// let (tx, rx) = tokio::sync::oneshot::channel();
/// let on_reply: ReplyHandler = Box::new(move |reply| {
///     let _ = tx.send(reply.map(|m| m.body().clone()));
/// });
/// bus.send("echo", json!("hi"), Some(on_reply));
/// assert_eq!(rx.await.unwrap().unwrap(), json!("hi"));
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBus {
    shared: Arc<Shared>,
}

struct Shared {
    registry: Mutex<Registry>,
    jobs: mpsc::UnboundedSender<Job>,
    next_id: AtomicU64,
    closed: AtomicBool,
    timers: Arc<AtomicUsize>,
}

#[derive(Default)]
struct Registry {
    handlers: HashMap<String, Vec<Registration>>,
    round_robin: HashMap<String, usize>,
    replies: HashMap<String, ReplySlot>,
}

/// A reply callback waiting for its answer, plus the timer that fails it.
struct ReplySlot {
    handler: ReplyHandler,
    timer: Option<AbortHandle>,
}

impl ReplySlot {
    fn settle(self) -> ReplyHandler {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        self.handler
    }
}

/// Held by a timeout task until it finishes or is aborted.
struct ArmedTimer(Arc<AtomicUsize>);

impl ArmedTimer {
    fn new(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(count))
    }
}

impl Drop for ArmedTimer {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Registration {
    id: HandlerId,
    local: bool,
    handler: MessageHandler,
}

impl Registry {
    fn next_handler(&mut self, address: &str) -> Option<MessageHandler> {
        let registrations = self.handlers.get(address).filter(|r| !r.is_empty())?;
        let turn = self.round_robin.entry(address.to_string()).or_insert(0);
        let picked = registrations[*turn % registrations.len()].handler.clone();
        *turn = turn.wrapping_add(1);
        Some(picked)
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    /// Create a bus and spawn its delivery loop on the current runtime.
    pub fn new() -> Self {
        let (jobs, mut queue) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = queue.recv().await {
                job();
            }
            trace!("in-memory bus delivery loop stopped");
        });

        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                jobs,
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                timers: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    /// Number of handlers currently registered at `address`.
    pub fn handler_count(&self, address: &str) -> usize {
        lock(&self.shared.registry)
            .handlers
            .get(address)
            .map_or(0, Vec::len)
    }

    /// Whether the registration `id` at `address` was made with
    /// `register_local_handler`.
    pub fn is_local(&self, address: &str, id: HandlerId) -> Option<bool> {
        lock(&self.shared.registry)
            .handlers
            .get(address)?
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.local)
    }

    /// Reply slots still waiting for an answer.
    pub fn pending_replies(&self) -> usize {
        lock(&self.shared.registry).replies.len()
    }

    /// Reply timeouts still scheduled.
    pub fn armed_timers(&self) -> usize {
        self.shared.timers.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn register(&self, address: &str, handler: MessageHandler, local: bool) -> HandlerId {
        let id = HandlerId(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        if self.is_closed() {
            debug!(address, %id, "bus closed, registration ignored");
            return id;
        }
        lock(&self.shared.registry)
            .handlers
            .entry(address.to_string())
            .or_default()
            .push(Registration { id, local, handler });
        debug!(address, %id, local, "handler registered");
        id
    }
}

impl Shared {
    fn enqueue(&self, job: Job) {
        if self.jobs.send(job).is_err() {
            debug!("delivery loop gone, callback dropped");
        }
    }

    fn allocate_reply(&self, handler: ReplyHandler) -> String {
        let address = format!("__reply.{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        lock(&self.registry)
            .replies
            .insert(address.clone(), ReplySlot { handler, timer: None });
        address
    }

    fn envelope(self: &Arc<Self>, body: Value, reply_address: Option<String>) -> RawMessage {
        Arc::new(Delivered {
            body,
            reply_address,
            bus: Arc::downgrade(self),
        })
    }

    /// Settle a reply slot. Returns `false` when it was already settled.
    fn complete_reply(&self, address: &str, outcome: Result<RawMessage, ReplyError>) -> bool {
        let slot = lock(&self.registry).replies.remove(address);
        match slot {
            Some(slot) => {
                let handler = slot.settle();
                self.enqueue(Box::new(move || handler(outcome)));
                true
            }
            None => {
                trace!(address, "reply slot already settled");
                false
            }
        }
    }

    fn arm_timeout(self: &Arc<Self>, reply_address: String, timeout: Duration, target: String) {
        let shared: Weak<Shared> = Arc::downgrade(self);
        let armed = ArmedTimer::new(&self.timers);
        let address = reply_address.clone();
        let timer = tokio::spawn(async move {
            let _armed = armed;
            tokio::time::sleep(timeout).await;
            if let Some(shared) = shared.upgrade() {
                shared.complete_reply(&address, Err(ReplyError::timeout(&target)));
            }
        });

        // Settling the slot aborts the timer; a slot settled already needs none.
        let mut registry = lock(&self.registry);
        match registry.replies.get_mut(&reply_address) {
            Some(slot) => slot.timer = Some(timer.abort_handle()),
            None => timer.abort(),
        }
    }

    fn dispatch(
        self: &Arc<Self>,
        address: &str,
        body: Value,
        reply: Option<ReplyHandler>,
        timeout: Option<Duration>,
    ) {
        if self.closed.load(Ordering::SeqCst) {
            if let Some(reply) = reply {
                self.enqueue(Box::new(move || reply(Err(ReplyError::closed()))));
            }
            return;
        }

        let target = lock(&self.registry).next_handler(address);
        let Some(handler) = target else {
            match reply {
                Some(reply) => {
                    let err = ReplyError::no_handlers(address);
                    self.enqueue(Box::new(move || reply(Err(err))));
                }
                None => debug!(address, "no handlers, message dropped"),
            }
            return;
        };

        let reply_address = reply.map(|r| self.allocate_reply(r));
        if let (Some(reply_address), Some(timeout)) = (&reply_address, timeout) {
            self.arm_timeout(reply_address.clone(), timeout, address.to_string());
        }
        let message = self.envelope(body, reply_address);
        self.enqueue(Box::new(move || handler(message)));
    }

    fn answer(
        self: &Arc<Self>,
        address: &str,
        body: Value,
        continuation: Option<ReplyHandler>,
        timeout: Option<Duration>,
    ) {
        let next_address = continuation.map(|c| self.allocate_reply(c));
        let reply = self.envelope(body, next_address.clone());
        let delivered = self.complete_reply(address, Ok(reply));

        match next_address {
            Some(next) if !delivered => {
                let orphan = lock(&self.registry).replies.remove(&next);
                if let Some(continuation) = orphan.map(ReplySlot::settle) {
                    let err = ReplyError::no_handlers(address);
                    self.enqueue(Box::new(move || continuation(Err(err))));
                }
            }
            Some(next) => {
                if let Some(timeout) = timeout {
                    self.arm_timeout(next, timeout, address.to_string());
                }
            }
            None => {}
        }
    }
}

impl EventBus for InMemoryBus {
    fn send(&self, address: &str, body: Value, reply: Option<ReplyHandler>) {
        self.shared.dispatch(address, body, reply, None);
    }

    fn send_with_timeout(&self, address: &str, body: Value, timeout: Duration, reply: ReplyHandler) {
        self.shared.dispatch(address, body, Some(reply), Some(timeout));
    }

    fn publish(&self, address: &str, body: Value) {
        if self.is_closed() {
            return;
        }
        let handlers: Vec<MessageHandler> = lock(&self.shared.registry)
            .handlers
            .get(address)
            .map(|regs| regs.iter().map(|r| r.handler.clone()).collect())
            .unwrap_or_default();

        if handlers.is_empty() {
            debug!(address, "publish with no handlers");
        }
        for handler in handlers {
            let message = self.shared.envelope(body.clone(), None);
            self.shared.enqueue(Box::new(move || handler(message)));
        }
    }

    fn register_handler(&self, address: &str, handler: MessageHandler) -> HandlerId {
        self.register(address, handler, false)
    }

    fn register_local_handler(&self, address: &str, handler: MessageHandler) -> HandlerId {
        self.register(address, handler, true)
    }

    fn unregister_handler(&self, address: &str, id: HandlerId) -> bool {
        let mut registry = lock(&self.shared.registry);
        let Some(registrations) = registry.handlers.get_mut(address) else {
            return false;
        };
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        let removed = registrations.len() != before;
        if registrations.is_empty() {
            registry.handlers.remove(address);
            registry.round_robin.remove(address);
        }
        if removed {
            debug!(address, %id, "handler unregistered");
        }
        removed
    }

    fn close(&self, done: CloseHandler) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let pending: Vec<ReplyHandler> = {
            let mut registry = lock(&self.shared.registry);
            registry.handlers.clear();
            registry.round_robin.clear();
            registry.replies.drain().map(|(_, slot)| slot.settle()).collect()
        };
        debug!(pending = pending.len(), "closing in-memory bus");

        for handler in pending {
            self.shared
                .enqueue(Box::new(move || handler(Err(ReplyError::closed()))));
        }
        self.shared.enqueue(Box::new(move || done(Ok(()))));
    }
}

/// Envelope handed to handlers and reply callbacks by [`InMemoryBus`].
struct Delivered {
    body: Value,
    reply_address: Option<String>,
    bus: Weak<Shared>,
}

impl Delivered {
    fn route(&self) -> Option<(&str, Arc<Shared>)> {
        let address = self.reply_address.as_deref()?;
        let bus = self.bus.upgrade()?;
        Some((address, bus))
    }
}

impl Envelope for Delivered {
    fn body(&self) -> &Value {
        &self.body
    }

    fn reply_address(&self) -> Option<&str> {
        self.reply_address.as_deref()
    }

    fn reply(&self, body: Value, continuation: Option<ReplyHandler>) {
        match self.route() {
            Some((address, bus)) => bus.answer(address, body, continuation, None),
            None => trace!("reply to a message without reply address dropped"),
        }
    }

    fn reply_with_timeout(&self, body: Value, timeout: Duration, continuation: ReplyHandler) {
        match self.route() {
            Some((address, bus)) => bus.answer(address, body, Some(continuation), Some(timeout)),
            None => {
                trace!("reply to a message without reply address dropped");
                continuation(Err(ReplyError::no_handlers("<no reply address>")));
            }
        }
    }

    fn fail(&self, code: i32, message: &str) {
        match self.route() {
            Some((address, bus)) => {
                bus.complete_reply(address, Err(ReplyError::recipient(code, message)));
            }
            None => trace!(code, message, "failure for a message without reply address dropped"),
        }
    }
}
