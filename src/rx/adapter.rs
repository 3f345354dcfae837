//! Callback-to-stream adapter.
//!
//! An [`Emitter`] is the bus-facing half of an adapter: bus callbacks push
//! outcomes into it. The stream-facing half is a
//! [`Subscription`](super::Subscription). Both share one slot holding the
//! completion state, so whichever side reaches a terminal state first wins
//! and every later event is dropped.

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::trace;

use super::observable::MemoCell;
use super::subscription::Subscription;
use crate::error::BusError;
use crate::sync::lock;

/// One stream event: an element or the error that ends the stream.
pub type Outcome<T> = Result<T, BusError>;

/// How an adapter reacts to subscriptions and callback invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireMode {
    /// Trigger the bus action at most once; cache and replay its outcome.
    Memoized,
    /// Trigger the bus action again for every subscription.
    PerSubscription,
    /// Forward every callback invocation; never completes by itself.
    MultiFire,
}

impl FireMode {
    /// Single-fire adapters complete right after their one element.
    pub fn is_single_fire(self) -> bool {
        !matches!(self, FireMode::MultiFire)
    }
}

/// Lifecycle of one pending bus interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Unfired,
    Succeeded,
    Failed,
    Cancelled,
}

impl Completion {
    pub fn is_terminal(self) -> bool {
        self != Completion::Unfired
    }
}

pub(crate) type Teardown = Box<dyn FnOnce() + Send>;

/// Where an emitter's events go.
pub(crate) enum Sink<T> {
    /// Straight to one subscriber.
    Channel(mpsc::UnboundedSender<Outcome<T>>),
    /// Into the cache of a memoized observable, which fans out to subscribers.
    Memo(Arc<MemoCell<T>>),
}

impl<T: Clone + Send + 'static> Sink<T> {
    fn finish(self, last: Option<Outcome<T>>) {
        match self {
            Sink::Channel(events) => {
                if let Some(item) = last {
                    let _ = events.send(item);
                }
            }
            Sink::Memo(cell) => cell.resolve(last),
        }
    }
}

pub(crate) struct Slot<T> {
    sink: Option<Sink<T>>,
    completion: Completion,
    teardown: Option<Teardown>,
}

impl<T> Slot<T> {
    fn new(sink: Sink<T>) -> Self {
        Self {
            sink: Some(sink),
            completion: Completion::Unfired,
            teardown: None,
        }
    }
}

/// Cancel from the subscriber side. Returns `false` if the slot was already
/// terminal. The teardown runs synchronously, outside the lock.
pub(crate) fn cancel_slot<T>(slot: &Mutex<Slot<T>>) -> bool {
    let teardown = {
        let mut slot = lock(slot);
        if slot.completion.is_terminal() {
            return false;
        }
        slot.completion = Completion::Cancelled;
        slot.sink = None;
        slot.teardown.take()
    };
    if let Some(teardown) = teardown {
        teardown();
    }
    true
}

pub(crate) fn slot_completion<T>(slot: &Mutex<Slot<T>>) -> Completion {
    lock(slot).completion
}

/// Capability to push events to one downstream subscriber (or memo cache).
///
/// Cloning is cheap; all clones drive the same adapter.
pub struct Emitter<T> {
    slot: Arc<Mutex<Slot<T>>>,
    mode: FireMode,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            mode: self.mode,
        }
    }
}

impl<T> fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("mode", &self.mode)
            .field("completion", &slot_completion(&self.slot))
            .finish()
    }
}

impl<T: Clone + Send + 'static> Emitter<T> {
    /// New adapter bound directly to a fresh subscriber.
    pub(crate) fn attach(mode: FireMode) -> (Self, Subscription<T>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let slot = Arc::new(Mutex::new(Slot::new(Sink::Channel(events))));
        let emitter = Self {
            slot: Arc::clone(&slot),
            mode,
        };
        (emitter, Subscription::new(receiver, slot))
    }

    /// Emitter whose single outcome is cached by a memoized observable.
    pub(crate) fn feeding(cell: Arc<MemoCell<T>>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::new(Sink::Memo(cell)))),
            mode: FireMode::Memoized,
        }
    }

    pub fn mode(&self) -> FireMode {
        self.mode
    }

    pub fn completion(&self) -> Completion {
        slot_completion(&self.slot)
    }

    /// Still accepting events (not fired, failed or cancelled).
    pub fn is_active(&self) -> bool {
        !self.completion().is_terminal()
    }

    /// Emit an element. Single-fire adapters complete right after it.
    pub fn next(&self, value: T) {
        if self.mode.is_single_fire() {
            self.terminate(Completion::Succeeded, Some(Ok(value)));
            return;
        }
        let slot = lock(&self.slot);
        match (slot.completion, &slot.sink) {
            (Completion::Unfired, Some(Sink::Channel(events))) => {
                let _ = events.send(Ok(value));
            }
            (completion, _) => trace!(?completion, "late element dropped"),
        }
    }

    /// End the stream with an error.
    pub fn error(&self, err: BusError) {
        self.terminate(Completion::Failed, Some(Err(err)));
    }

    /// End the stream normally.
    pub fn complete(&self) {
        self.terminate(Completion::Succeeded, None);
    }

    /// Forward a callback outcome: `Ok` as an element, `Err` as the error.
    pub fn fire(&self, outcome: Outcome<T>) {
        match outcome {
            Ok(value) => self.next(value),
            Err(err) => self.error(err),
        }
    }

    /// Register an action to run once when the adapter terminates, whether by
    /// cancellation, completion or error. Runs immediately if it already has.
    pub fn on_cancel<F>(&self, teardown: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = lock(&self.slot);
        if slot.completion.is_terminal() {
            drop(slot);
            teardown();
            return;
        }
        let teardown: Teardown = match slot.teardown.take() {
            Some(previous) => Box::new(move || {
                previous();
                teardown();
            }),
            None => Box::new(teardown),
        };
        slot.teardown = Some(teardown);
    }

    pub(crate) fn settle(&self, last: Option<Outcome<T>>) {
        match last {
            Some(outcome) => self.fire(outcome),
            None => self.complete(),
        }
    }

    fn terminate(&self, completion: Completion, last: Option<Outcome<T>>) {
        let (sink, teardown) = {
            let mut slot = lock(&self.slot);
            if slot.completion.is_terminal() {
                trace!(?completion, previous = ?slot.completion, "late event dropped");
                return;
            }
            slot.completion = completion;
            (slot.sink.take(), slot.teardown.take())
        };
        if let Some(sink) = sink {
            sink.finish(last);
        }
        if let Some(teardown) = teardown {
            teardown();
        }
    }
}
