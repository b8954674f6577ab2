//! # Queue Transport
//!
//! Loopback TCP channels between the foreman and worker processes. Three
//! delivery patterns share one lifecycle contract: push-bind/pull-connect
//! fan-out for analysis events, and request-connect against a buffered
//! reply binder for task dispatch, where a dedicated responder thread owns
//! the socket and drains a bounded in-process buffer.

mod frame;
mod push;
mod reply;

pub use frame::{FRAME_LIMIT_BYTES, Frame, FrameBuf, encode_frame};
pub(crate) use frame::{read_frame, write_frame};
pub use push::{PullConnectQueue, PushBindQueue};
pub use reply::{BufferedReplyBindQueue, RequestConnectQueue};

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is empty")]
    Empty,
    #[error("queue is full")]
    Full,
    #[error("queue not started")]
    NotStarted,
    #[error("queue already started")]
    AlreadyStarted,
    #[error("queue already closed")]
    AlreadyClosed,
    #[error("queue closed")]
    Closed,
    #[error("endpoint setup failed: {0}")]
    Bind(String),
    #[error("frame exceeds limit: {0} bytes")]
    Oversize(usize),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// One popped unit: either a payload or the abort sentinel.
#[derive(Debug, PartialEq)]
pub enum Popped<T> {
    Item(T),
    Abort,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    pub timeout_seconds: f64,
    pub linger_seconds: f64,
    pub buffer_size: usize,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout_seconds: 5.0,
            linger_seconds: 5.0,
            buffer_size: 300,
        }
    }

    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_seconds.max(0.0))
    }

    pub(crate) fn linger(&self) -> Duration {
        Duration::from_secs_f64(self.linger_seconds.max(0.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Lifecycle {
    Created,
    Open,
    Closed,
}

/// Open/close lifecycle shared by every pattern. Opening twice fails with
/// `AlreadyStarted`; closing twice without abort fails with
/// `AlreadyClosed`; closing with abort never fails. Binders honor
/// `linger_seconds` on graceful close, waiting for connected consumers to
/// finish reading; connectors drop their socket immediately.
pub trait Queue {
    fn name(&self) -> &str;
    /// Local port for binders, peer port for connectors. `None` before open.
    fn port(&self) -> Option<u16>;
    fn open(&mut self) -> Result<(), QueueError>;
    fn close(&mut self, abort: bool) -> Result<(), QueueError>;
}

pub trait ItemProducer<T: Serialize> {
    /// Blocking push: retries until the queue timeout, then fails `Full`.
    fn push_item(&self, item: &T) -> Result<(), QueueError>;
    /// Single attempt: `Ok(false)` means no room right now, try again later.
    fn try_push_item(&self, item: &T) -> Result<bool, QueueError>;
    /// Queue the abort sentinel without blocking. `Ok(false)` means it did
    /// not fit; callers on the shutdown path tolerate that.
    fn push_abort(&self) -> Result<bool, QueueError>;
}

pub trait ItemConsumer<T: DeserializeOwned> {
    /// Blocking pop: `Empty` after the queue timeout, `Closed` once the
    /// peer is logically gone.
    fn pop_item(&mut self) -> Result<Popped<T>, QueueError>;
}
