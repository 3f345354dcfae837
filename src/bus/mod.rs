//! Event bus - the callback-driven messaging substrate.
//!
//! This module defines the interface the reactive layer consumes from an
//! addressable message bus, plus an in-memory implementation.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 RxBus (crate::rx, streams)                   │
//! │  send / observe_send / register_handler / observe_stream    │
//! └─────────────────────────────────────────────────────────────┘
//!                            │ callbacks
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 EventBus + Envelope traits                   │
//! │  send(addr, body, reply?) / publish / register / close      │
//! │  reply(body, continuation?) / fail(code, msg)               │
//! └─────────────────────────────────────────────────────────────┘
//!          │                                   │
//!          ▼                                   ▼
//! ┌─────────────────┐              ┌─────────────────────────────┐
//! │  InMemoryBus    │              │ clustered / brokered buses  │
//! │  (included)     │              │        (external)           │
//! └─────────────────┘              └─────────────────────────────┘
//! ```
//!
//! Point-to-point (`send`) reaches one handler; `publish` fans out to every
//! handler registered at the address. A message sent with a reply handler
//! carries a reply address; replying with a continuation keeps the
//! conversation going, which is how reply-to-reply chains and chunked
//! streaming exchanges are built.

mod envelope;
mod event_bus;
#[cfg(feature = "in-memory")]
mod in_memory;

pub use envelope::{Envelope, RawMessage};
pub use event_bus::{CloseHandler, EventBus, HandlerId, MessageHandler, ReplyHandler};
#[cfg(feature = "in-memory")]
pub use in_memory::InMemoryBus;
