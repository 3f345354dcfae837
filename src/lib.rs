//! Reactive streams over a callback-driven message bus.
//!
//! [`bus`] describes the bus (send/publish/reply/register) and ships an
//! in-memory implementation. [`rx`] adapts it to `futures::Stream`:
//! single-fire replies, re-firing sends, registered listeners, chunked
//! streaming exchanges and a backpressure regulator.

pub mod bus;
mod config;
mod error;
pub mod rx;
mod sync;

pub use config::{BusConfig, DEFAULT_TIMEOUT_ENV, DEFAULT_TIMEOUT_MS};
pub use error::{BusError, ReplyError, ReplyFailure};
pub use rx::{
    Completion, Emitter, FireMode, Message, Observable, Outcome, Regulator, RegulatorStats,
    RxBus, StreamCursor, Subscription, WriteSink,
};
