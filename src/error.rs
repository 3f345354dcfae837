//! Error types shared by the bus interface and the reactive adapters.

use std::fmt;

use thiserror::Error;

/// Why a reply callback was completed with a failure instead of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyFailure {
    /// No reply arrived before the timeout elapsed.
    Timeout,
    /// Nobody is registered at the target address.
    NoHandlers,
    /// The recipient explicitly failed the message.
    Recipient,
    /// The bus was closed while the reply was pending.
    Closed,
}

impl fmt::Display for ReplyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyFailure::Timeout => write!(f, "timeout"),
            ReplyFailure::NoHandlers => write!(f, "no handlers"),
            ReplyFailure::Recipient => write!(f, "recipient failure"),
            ReplyFailure::Closed => write!(f, "bus closed"),
        }
    }
}

/// Failure handed to a reply callback by the bus.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{failure} ({code}): {message}")]
pub struct ReplyError {
    pub failure: ReplyFailure,
    pub code: i32,
    pub message: String,
}

impl ReplyError {
    pub fn new(failure: ReplyFailure, code: i32, message: impl Into<String>) -> Self {
        Self {
            failure,
            code,
            message: message.into(),
        }
    }

    /// Reply timed out.
    pub fn timeout(address: &str) -> Self {
        Self::new(
            ReplyFailure::Timeout,
            -1,
            format!("timed out waiting for a reply from {}", address),
        )
    }

    /// Nobody listening at `address`.
    pub fn no_handlers(address: &str) -> Self {
        Self::new(
            ReplyFailure::NoHandlers,
            -1,
            format!("no handlers for address {}", address),
        )
    }

    /// The recipient called `fail(code, message)`.
    pub fn recipient(code: i32, message: impl Into<String>) -> Self {
        Self::new(ReplyFailure::Recipient, code, message)
    }

    pub fn closed() -> Self {
        Self::new(ReplyFailure::Closed, -1, "event bus closed")
    }
}

/// Error type surfaced on reactive streams.
///
/// Every bus-side failure ends up here as an `Err` stream item so that
/// downstream operators (retry, fallback, ...) can treat them uniformly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// Remote failure, timeout or unroutable address reported by the bus.
    #[error("reply failed: {0}")]
    Reply(#[from] ReplyError),
    /// Local misuse of an adapter, e.g. pulling past the end of an exchange.
    #[error("protocol misuse: {0}")]
    Protocol(String),
    /// Message body could not be decoded into the requested type.
    #[error("decode failed: {0}")]
    Decode(String),
    /// A regulated sink refused an element.
    #[error("sink rejected element: {0}")]
    Sink(String),
    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The bus has been closed.
    #[error("event bus closed")]
    Closed,
}

impl BusError {
    /// The reply failure carried by this error, if it came from the bus.
    pub fn reply_failure(&self) -> Option<ReplyFailure> {
        match self {
            BusError::Reply(e) => Some(e.failure),
            _ => None,
        }
    }

    /// Failure code supplied by the remote side, if any.
    pub fn code(&self) -> Option<i32> {
        match self {
            BusError::Reply(e) => Some(e.code),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.reply_failure() == Some(ReplyFailure::Timeout)
    }

    pub fn is_no_handlers(&self) -> bool {
        self.reply_failure() == Some(ReplyFailure::NoHandlers)
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, BusError::Protocol(_))
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Decode(err.to_string())
    }
}
