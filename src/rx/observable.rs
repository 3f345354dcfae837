//! Cold stream factories over bus actions.

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::trace;

use super::adapter::{Emitter, FireMode, Outcome};
use super::subscription::Subscription;
use crate::sync::lock;

type OnSubscribe<T> = Arc<dyn Fn(Emitter<T>) + Send + Sync>;

/// A stream factory that triggers a bus action and feeds its callbacks to
/// subscribers, according to its [`FireMode`].
///
/// Nothing happens until [`subscribe`](Self::subscribe) (or
/// [`start`](Self::start) for memoized observables).
pub struct Observable<T> {
    source: Source<T>,
}

enum Source<T> {
    Memoized(Arc<MemoCell<T>>),
    Fresh {
        mode: FireMode,
        on_subscribe: OnSubscribe<T>,
    },
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        let source = match &self.source {
            Source::Memoized(cell) => Source::Memoized(Arc::clone(cell)),
            Source::Fresh { mode, on_subscribe } => Source::Fresh {
                mode: *mode,
                on_subscribe: Arc::clone(on_subscribe),
            },
        };
        Self { source }
    }
}

impl<T> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable").field("mode", &self.mode()).finish()
    }
}

impl<T> Observable<T> {
    pub fn mode(&self) -> FireMode {
        match &self.source {
            Source::Memoized(_) => FireMode::Memoized,
            Source::Fresh { mode, .. } => *mode,
        }
    }
}

impl<T: Clone + Send + 'static> Observable<T> {
    /// Wrap a bus action. `on_subscribe` receives the emitter its callbacks
    /// must drive; for memoized observables it runs at most once.
    pub fn new<F>(mode: FireMode, on_subscribe: F) -> Self
    where
        F: Fn(Emitter<T>) + Send + Sync + 'static,
    {
        let on_subscribe: OnSubscribe<T> = Arc::new(on_subscribe);
        let source = match mode {
            FireMode::Memoized => Source::Memoized(Arc::new(MemoCell::new(on_subscribe))),
            mode => Source::Fresh { mode, on_subscribe },
        };
        Self { source }
    }

    /// Trigger a memoized action now, before anyone subscribes. No-op for
    /// other modes or if the action already ran.
    pub fn start(&self) {
        if let Source::Memoized(cell) = &self.source {
            cell.start();
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        match &self.source {
            Source::Memoized(cell) => cell.subscribe(),
            Source::Fresh { mode, on_subscribe } => {
                let (emitter, subscription) = Emitter::attach(*mode);
                on_subscribe(emitter);
                subscription
            }
        }
    }
}

/// Shared cache of a memoized observable's single outcome.
pub(crate) struct MemoCell<T> {
    state: Mutex<Memo<T>>,
}

struct Memo<T> {
    execute: Option<OnSubscribe<T>>,
    /// `Some(None)` means completed without an element.
    resolved: Option<Option<Outcome<T>>>,
    waiters: Vec<Emitter<T>>,
}

impl<T: Clone + Send + 'static> MemoCell<T> {
    fn new(execute: OnSubscribe<T>) -> Self {
        Self {
            state: Mutex::new(Memo {
                execute: Some(execute),
                resolved: None,
                waiters: Vec::new(),
            }),
        }
    }

    fn start(self: &Arc<Self>) {
        let execute = lock(&self.state).execute.take();
        if let Some(execute) = execute {
            trace!("starting memoized action");
            execute(Emitter::feeding(Arc::clone(self)));
        }
    }

    fn subscribe(self: &Arc<Self>) -> Subscription<T> {
        let (emitter, subscription) = Emitter::attach(FireMode::Memoized);
        let cached = {
            let mut memo = lock(&self.state);
            match &memo.resolved {
                Some(last) => Some(last.clone()),
                None => {
                    memo.waiters.retain(|waiter| waiter.is_active());
                    memo.waiters.push(emitter.clone());
                    None
                }
            }
        };
        if let Some(last) = cached {
            emitter.settle(last);
        }
        self.start();
        subscription
    }

    pub(crate) fn resolve(&self, last: Option<Outcome<T>>) {
        let waiters = {
            let mut memo = lock(&self.state);
            if memo.resolved.is_some() {
                return;
            }
            memo.resolved = Some(last.clone());
            std::mem::take(&mut memo.waiters)
        };
        for waiter in waiters {
            waiter.settle(last.clone());
        }
    }
}
