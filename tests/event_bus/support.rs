//! Fixtures shared by the event bus suite.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::StreamExt;
use rx_eventbus::bus::{
    CloseHandler, EventBus, HandlerId, InMemoryBus, MessageHandler, RawMessage, ReplyHandler,
};
use rx_eventbus::{BusError, Message, Observable, ReplyError, RxBus, StreamCursor, WriteSink};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant, Sleep};

/// Install a test-writer subscriber once; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Buses
// ============================================================================

/// In-memory bus that counts what goes through it.
pub struct CountingBus {
    inner: InMemoryBus,
    sends: AtomicUsize,
    unregistered: AtomicUsize,
}

impl CountingBus {
    pub fn new() -> Self {
        Self {
            inner: InMemoryBus::new(),
            sends: AtomicUsize::new(0),
            unregistered: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &InMemoryBus {
        &self.inner
    }

    /// Point-to-point sends, with or without timeout.
    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    /// Successful unregistrations.
    pub fn unregistered(&self) -> usize {
        self.unregistered.load(Ordering::SeqCst)
    }
}

impl EventBus for CountingBus {
    fn send(&self, address: &str, body: Value, reply: Option<ReplyHandler>) {
        self.sends.fetch_add(1, Ordering::SeqCst);
        self.inner.send(address, body, reply);
    }

    fn send_with_timeout(&self, address: &str, body: Value, timeout: Duration, reply: ReplyHandler) {
        self.sends.fetch_add(1, Ordering::SeqCst);
        self.inner.send_with_timeout(address, body, timeout, reply);
    }

    fn publish(&self, address: &str, body: Value) {
        self.inner.publish(address, body);
    }

    fn register_handler(&self, address: &str, handler: MessageHandler) -> HandlerId {
        self.inner.register_handler(address, handler)
    }

    fn register_local_handler(&self, address: &str, handler: MessageHandler) -> HandlerId {
        self.inner.register_local_handler(address, handler)
    }

    fn unregister_handler(&self, address: &str, id: HandlerId) -> bool {
        let removed = self.inner.unregister_handler(address, id);
        if removed {
            self.unregistered.fetch_add(1, Ordering::SeqCst);
        }
        removed
    }

    fn close(&self, done: CloseHandler) {
        self.inner.close(done);
    }
}

pub fn counting_bus() -> RxBus<CountingBus> {
    RxBus::new(CountingBus::new())
}

// ============================================================================
// Servers
// ============================================================================

/// Answer every message at `address` through the reactive handler stream.
pub fn respond<B, F>(rx: &RxBus<B>, address: &str, answer: F) -> JoinHandle<()>
where
    B: EventBus,
    F: Fn(Message) + Send + 'static,
{
    let mut requests = rx.register_handler(address).subscribe();
    tokio::spawn(async move {
        while let Some(Ok(message)) = requests.next().await {
            answer(message);
        }
    })
}

/// Reply `"pong" + body` to every string message at `address`.
pub fn serve_echo<B: EventBus>(rx: &RxBus<B>, address: &str) -> JoinHandle<()> {
    respond(rx, address, |message| {
        let body = format!("pong{}", message.body().as_str().unwrap_or_default());
        message.reply(body);
    })
}

/// Numbers per countdown chunk.
pub const CHUNK: i64 = 10;

/// Serve `{"from": n}` as chunks of ten numbers counting down from `n`.
/// Every chunk but the one starting at zero invites a follow-up request.
/// Returns the number of chunks produced so far.
pub fn serve_countdown<B: EventBus>(bus: &B, address: &str) -> Arc<AtomicUsize> {
    let produced = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&produced);
    bus.register_handler(address, Arc::new(move |request: RawMessage| send_batch(request, Arc::clone(&counter))));
    produced
}

fn send_batch(request: RawMessage, produced: Arc<AtomicUsize>) {
    let from = request.body()["from"].as_i64().unwrap_or(0);
    let items: Vec<i64> = (0..CHUNK).map(|i| from - i).collect();
    let chunk = json!({ "start": from, "items": items });
    produced.fetch_add(1, Ordering::SeqCst);
    if from > 0 {
        let next: ReplyHandler = Box::new(move |outcome: Result<RawMessage, ReplyError>| {
            if let Ok(request) = outcome {
                send_batch(request, produced);
            }
        });
        request.reply(chunk, Some(next));
    } else {
        request.reply(chunk, None);
    }
}

/// Ask the countdown server for the chunk after `cursor`, unless it was the last.
pub fn pull_next(cursor: &StreamCursor) -> Result<(), BusError> {
    if cursor.is_last() {
        return Ok(());
    }
    let start = cursor.value()["start"].as_i64().unwrap_or(0);
    cursor.request_next(json!({ "from": start - CHUNK }))
}

pub fn chunk_start(chunk: &Value) -> i64 {
    chunk["start"].as_i64().expect("chunk has a start")
}

// ============================================================================
// Stream helpers
// ============================================================================

/// Re-subscribe on error up to `retries` times and return the first element.
pub async fn first_with_retry<T>(observable: &Observable<T>, retries: usize) -> Result<T, BusError>
where
    T: Clone + Send + 'static,
{
    let mut attempt = 0;
    loop {
        match observable.subscribe().next().await {
            Some(Ok(value)) => return Ok(value),
            Some(Err(_)) if attempt < retries => attempt += 1,
            Some(Err(err)) => return Err(err),
            None => return Err(BusError::Protocol("completed without an element".to_string())),
        }
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Write log shared between a [`RatedSink`] and the test.
pub type WriteLog = Arc<Mutex<Vec<(Duration, Value)>>>;

/// Accepts at most `per_window` writes per window. The window opens at its
/// first write and drains completely when it closes.
pub struct RatedSink {
    per_window: usize,
    window: Duration,
    written: usize,
    timer: Pin<Box<Sleep>>,
    started: Instant,
    log: WriteLog,
}

impl RatedSink {
    pub fn new(per_window: usize, window: Duration) -> Self {
        Self {
            per_window,
            window,
            written: 0,
            timer: Box::pin(sleep(window)),
            started: Instant::now(),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn log(&self) -> WriteLog {
        Arc::clone(&self.log)
    }
}

impl WriteSink<Value> for RatedSink {
    fn capacity(&self) -> usize {
        self.per_window
    }

    fn write(&mut self, item: Value) -> Result<(), BusError> {
        if self.is_full() {
            return Err(BusError::Sink("write rate exceeded".to_string()));
        }
        if self.written == 0 {
            let deadline = Instant::now() + self.window;
            self.timer.as_mut().reset(deadline);
        }
        self.written += 1;
        self.log.lock().unwrap().push((self.started.elapsed(), item));
        Ok(())
    }

    fn is_full(&self) -> bool {
        self.written >= self.per_window
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<usize> {
        match self.timer.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(std::mem::take(&mut self.written)),
            Poll::Pending => Poll::Pending,
        }
    }
}
