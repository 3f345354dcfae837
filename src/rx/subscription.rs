//! Stream side of an adapter.

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::stream::{FusedStream, Stream};
use tokio::sync::mpsc;

use super::adapter::{cancel_slot, slot_completion, Completion, Outcome, Slot};

/// One subscriber's view of an adapter, as a `futures::Stream`.
///
/// Yields `Ok` elements, at most one `Err` (which ends the stream), and
/// ends with `None` on completion. Dropping the subscription cancels it.
pub struct Subscription<T> {
    events: mpsc::UnboundedReceiver<Outcome<T>>,
    slot: Arc<Mutex<Slot<T>>>,
    cancelled: bool,
    finished: bool,
}

impl<T> Subscription<T> {
    pub(crate) fn new(events: mpsc::UnboundedReceiver<Outcome<T>>, slot: Arc<Mutex<Slot<T>>>) -> Self {
        Self {
            events,
            slot,
            cancelled: false,
            finished: false,
        }
    }

    /// Detach from the adapter. Idempotent; no element is yielded afterwards,
    /// not even one that was already buffered.
    pub fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        self.events.close();
        cancel_slot(&self.slot);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// State of the underlying adapter.
    pub fn completion(&self) -> Completion {
        slot_completion(&self.slot)
    }
}

impl<T> Stream for Subscription<T> {
    type Item = Outcome<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancelled || self.finished {
            return Poll::Ready(None);
        }
        match self.events.poll_recv(cx) {
            Poll::Ready(Some(Err(err))) => {
                self.finished = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl<T> FusedStream for Subscription<T> {
    fn is_terminated(&self) -> bool {
        self.cancelled || self.finished
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("completion", &self.completion())
            .field("cancelled", &self.cancelled)
            .finish()
    }
}
