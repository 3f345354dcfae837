//! Reactive layer: bus operations as `futures::Stream`s.
//!
//! An [`Observable`] is a cold stream factory; each call to
//! [`Observable::subscribe`] produces a [`Subscription`], which is a
//! `Stream<Item = Result<T, BusError>>`. Callbacks from the bus are adapted
//! according to a [`FireMode`]:
//!
//! - **memoized**: one bus action, outcome cached and replayed
//! - **per subscription**: one bus action per subscriber
//! - **multi-fire**: every callback is an element; cancelling tears down
//!
//! Streams end after an error. Dropping a subscription cancels it.

mod adapter;
mod cursor;
mod message;
mod observable;
mod regulator;
mod rx_bus;
mod subscription;

pub use adapter::{Completion, Emitter, FireMode, Outcome};
pub use cursor::StreamCursor;
pub use message::Message;
pub use observable::Observable;
pub use regulator::{Regulator, RegulatorStats, WriteSink};
pub use rx_bus::RxBus;
pub use subscription::Subscription;
