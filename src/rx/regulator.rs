//! Backpressure for streaming exchanges.
//!
//! A [`Regulator`] sits between a cursor stream and a rate-limited
//! [`WriteSink`]. Pulls requested by the consumer do not go to the producer
//! directly: they park at a gate, a small coordinator task that releases a
//! pull only when no chunk is in flight, the sink is not suspended and
//! demand is left over for the chunk it would produce.
//!
//! ```text
//!  cursor.request_next ───────Pull──▶ ┌──────────┐ ──issue──▶ producer
//!                                     │   gate   │
//!  exchange ──────Attached/Arrived──▶ │  (task)  │
//!  driver ──Seed/Accepted/Full/       └──────────┘
//!           Drained/Terminate──▶
//! ```
//!
//! Demand starts at the sink capacity, drops by one for every element the
//! sink accepts and grows back (never above capacity) as the sink drains.
//! Chunks that arrived but were not written yet hold their slot, so a sink
//! that stops draining never has more than its capacity produced for it.

use std::fmt;
use std::future::poll_fn;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::{self, Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::adapter::Outcome;
use super::cursor::StreamCursor;
use super::message::Message;
use crate::bus::ReplyHandler;
use crate::error::BusError;

/// Rate-limited destination for a regulated stream.
pub trait WriteSink<T>: Send {
    /// Elements the sink holds before reporting full. At least one.
    fn capacity(&self) -> usize;

    /// Hand one element to the sink.
    fn write(&mut self, item: T) -> Result<(), BusError>;

    fn is_full(&self) -> bool;

    /// Resolves once the sink has room again, with the number of slots freed
    /// since the previous drain.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<usize>;
}

/// A pull waiting at the gate.
pub(crate) struct PendingPull {
    message: Message,
    body: Value,
    handler: ReplyHandler,
}

impl PendingPull {
    pub(crate) fn new(message: Message, body: Value, handler: ReplyHandler) -> Self {
        Self { message, body, handler }
    }

    /// Send the pull to the producer. Intermediate chunks carry no timeout.
    pub(crate) fn issue(self) {
        self.message.reply_with_handler(self.body, self.handler);
    }
}

enum Signal {
    Seed(usize),
    Pull(PendingPull),
    /// Chunks the exchange delivered before the gate was attached.
    Attached(u64),
    Arrived,
    Accepted,
    Full,
    Drained(usize),
    Terminate,
}

/// Sending side of a gate.
#[derive(Clone)]
pub(crate) struct GateHandle {
    signals: mpsc::UnboundedSender<Signal>,
}

impl GateHandle {
    fn signal(&self, signal: Signal) -> bool {
        self.signals.send(signal).is_ok()
    }

    pub(crate) fn submit(&self, pull: PendingPull) -> Result<(), BusError> {
        if self.signal(Signal::Pull(pull)) {
            Ok(())
        } else {
            Err(BusError::Protocol("regulator gate is closed".to_string()))
        }
    }

    pub(crate) fn attached(&self, chunks: u64) {
        self.signal(Signal::Attached(chunks));
    }

    pub(crate) fn arrived(&self) {
        self.signal(Signal::Arrived);
    }

    pub(crate) fn terminate(&self) {
        self.signal(Signal::Terminate);
    }
}

#[derive(Debug, Default)]
struct GateMetrics {
    pulls_issued: AtomicU64,
    chunks_arrived: AtomicU64,
    accepted: AtomicU64,
    max_outstanding: AtomicU64,
}

/// Counters observed by a regulator's gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegulatorStats {
    /// Pulls released to the producer.
    pub pulls_issued: u64,
    /// Chunks that arrived while the gate was attached.
    pub chunks_arrived: u64,
    /// Elements written to the sink.
    pub accepted: u64,
    /// Largest number of released pulls awaiting their chunk at once.
    pub max_outstanding: u64,
}

impl fmt::Display for RegulatorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pulls={} arrived={} accepted={} max_outstanding={}",
            self.pulls_issued, self.chunks_arrived, self.accepted, self.max_outstanding
        )
    }
}

struct Gate {
    demand: i64,
    capacity: i64,
    unaccepted: i64,
    parked: Option<PendingPull>,
    outstanding: u64,
    suspended: bool,
    metrics: Arc<GateMetrics>,
}

impl Gate {
    fn new(metrics: Arc<GateMetrics>) -> Self {
        Self {
            demand: 0,
            capacity: 0,
            unaccepted: 0,
            parked: None,
            outstanding: 0,
            suspended: false,
            metrics,
        }
    }

    async fn run(mut self, mut signals: mpsc::UnboundedReceiver<Signal>) {
        while let Some(signal) = signals.recv().await {
            match signal {
                Signal::Seed(capacity) => {
                    self.capacity = capacity.max(1) as i64;
                    self.demand = self.capacity;
                }
                Signal::Pull(pull) => {
                    if self.parked.replace(pull).is_some() {
                        warn!("parked pull replaced before release");
                    }
                }
                Signal::Attached(chunks) => self.unaccepted += chunks as i64,
                Signal::Arrived => {
                    self.outstanding = self.outstanding.saturating_sub(1);
                    self.unaccepted += 1;
                    self.metrics.chunks_arrived.fetch_add(1, Ordering::Relaxed);
                }
                Signal::Accepted => {
                    self.demand -= 1;
                    self.unaccepted = (self.unaccepted - 1).max(0);
                }
                Signal::Full => self.suspended = true,
                Signal::Drained(freed) => {
                    self.suspended = false;
                    self.demand = self.demand.saturating_add(freed as i64).min(self.capacity);
                }
                Signal::Terminate => {
                    if self.parked.take().is_some() {
                        debug!("gate terminated with a parked pull");
                    }
                    break;
                }
            }
            self.release();
        }
        trace!("regulator gate stopped");
    }

    fn release(&mut self) {
        if self.outstanding > 0 || self.suspended || self.demand - self.unaccepted <= 0 {
            return;
        }
        let Some(pull) = self.parked.take() else {
            return;
        };
        self.outstanding += 1;
        self.metrics.pulls_issued.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .max_outstanding
            .fetch_max(self.outstanding, Ordering::Relaxed);
        trace!(demand = self.demand, unaccepted = self.unaccepted, "pull released");
        pull.issue();
    }
}

/// Consumer side: moves elements from the source into the sink and reports
/// the sink's state to the gate.
struct Driver<T, K> {
    source: Pin<Box<dyn Stream<Item = Outcome<T>> + Send>>,
    sink: K,
    gate: GateHandle,
    metrics: Arc<GateMetrics>,
    capacity: i64,
    credit: i64,
}

impl<T, K: WriteSink<T>> Driver<T, K> {
    async fn step(&mut self) -> Option<Outcome<T>>
    where
        T: Clone,
    {
        if self.credit <= 0 || self.sink.is_full() {
            self.gate.signal(Signal::Full);
            let sink = &mut self.sink;
            let freed = poll_fn(|cx| sink.poll_drain(cx)).await.max(1);
            self.credit = self.credit.saturating_add(freed as i64).min(self.capacity);
            self.gate.signal(Signal::Drained(freed));
        }

        let item = match self.source.next().await? {
            Ok(item) => item,
            Err(err) => return Some(Err(err)),
        };
        if let Err(err) = self.sink.write(item.clone()) {
            return Some(Err(err));
        }
        self.credit -= 1;
        self.metrics.accepted.fetch_add(1, Ordering::Relaxed);
        self.gate.signal(Signal::Accepted);
        Some(Ok(item))
    }
}

/// Paces a streaming exchange to the speed of a [`WriteSink`].
///
/// Must be created inside a Tokio runtime: construction spawns the gate.
/// One regulator serves one exchange.
#[derive(Clone)]
pub struct Regulator {
    gate: GateHandle,
    metrics: Arc<GateMetrics>,
}

impl Default for Regulator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Regulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Regulator").field("stats", &self.stats()).finish()
    }
}

impl Regulator {
    pub fn new() -> Self {
        let (signals, receiver) = mpsc::unbounded_channel();
        let metrics = Arc::new(GateMetrics::default());
        tokio::spawn(Gate::new(Arc::clone(&metrics)).run(receiver));
        Self {
            gate: GateHandle { signals },
            metrics,
        }
    }

    /// Route the pulls of every cursor in `source` through this regulator.
    pub fn lift<S>(&self, source: S) -> impl Stream<Item = Outcome<StreamCursor>> + Send
    where
        S: Stream<Item = Outcome<StreamCursor>> + Send,
    {
        let gate = self.gate.clone();
        source.map(move |item| {
            if let Ok(cursor) = &item {
                cursor.attach_gate(&gate);
            }
            item
        })
    }

    /// Drive `source` into `sink`, yielding every element the sink accepted.
    ///
    /// Ends after the source ends or after the first error (source or sink),
    /// which is yielded. The gate is shut down either way.
    pub fn stream<T, S, K>(&self, source: S, sink: K) -> impl Stream<Item = Outcome<T>> + Send
    where
        T: Clone + Send + 'static,
        S: Stream<Item = Outcome<T>> + Send + 'static,
        K: WriteSink<T> + 'static,
    {
        let capacity = sink.capacity().max(1);
        self.gate.signal(Signal::Seed(capacity));
        let driver = Driver {
            source: Box::pin(source),
            sink,
            gate: self.gate.clone(),
            metrics: Arc::clone(&self.metrics),
            capacity: capacity as i64,
            credit: capacity as i64,
        };

        stream::unfold(Some(driver), |state| async move {
            let Some(mut driver) = state else {
                return None;
            };
            match driver.step().await {
                Some(Ok(item)) => Some((Ok(item), Some(driver))),
                Some(Err(err)) => {
                    driver.gate.terminate();
                    Some((Err(err), None))
                }
                None => {
                    driver.gate.terminate();
                    None
                }
            }
        })
    }

    pub fn stats(&self) -> RegulatorStats {
        RegulatorStats {
            pulls_issued: self.metrics.pulls_issued.load(Ordering::Relaxed),
            chunks_arrived: self.metrics.chunks_arrived.load(Ordering::Relaxed),
            accepted: self.metrics.accepted.load(Ordering::Relaxed),
            max_outstanding: self.metrics.max_outstanding.load(Ordering::Relaxed),
        }
    }

    /// The gate has shut down.
    pub fn is_closed(&self) -> bool {
        self.gate.signals.is_closed()
    }
}
