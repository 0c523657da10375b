//! Lock-free message channels.
//!
//! Three ring layouts share one cache-line slot format (see [`primitives`]):
//!
//! - [`ump`]: epoch-bit SPSC ring with an acknowledgement word (default)
//! - [`ffq`]: FastForward SPSC ring with per-slot full/empty words
//! - [`swmr`]: single-writer multi-reader ring for shared-memory clusters
//!
//! Producers implement [`Sender`], consumers [`Receiver`]. A bidirectional
//! link implements [`Channel`], whose provided `send`/`recv` methods busy-poll
//! the non-blocking operations under a [`RetryPolicy`].

pub mod ffq;
pub(crate) mod primitives;
pub mod retry;
pub mod swmr;
pub mod ump;

use serde::{Deserialize, Serialize};

use crate::error::CollectiveResult;
use crate::message::Message;

pub use ffq::{FfqRx, FfqTx};
pub use primitives::{MAX_SLOTS, PAYLOAD_WORDS};
pub use retry::{CancelToken, RetryPolicy};
pub use swmr::{SwmrReader, SwmrWriter};
pub use ump::{AckPolicy, UmpRx, UmpTx};

/// Producing half of a ring.
pub trait Sender: Send + Sync {
    /// Publish `msg`, or fail with `QueueFull`.
    fn try_send(&self, msg: &Message) -> CollectiveResult<()>;

    /// Publish a zero-word message, or fail with `QueueFull`.
    fn try_notify(&self) -> CollectiveResult<()>;

    fn can_send(&self) -> bool;

    /// Messages that can be in flight at once.
    fn capacity(&self) -> usize;
}

/// Consuming half of a ring.
pub trait Receiver: Send + Sync {
    /// Copy the next message into `msg`, or fail with `QueueEmpty`.
    fn try_recv(&self, msg: &mut Message) -> CollectiveResult<()>;

    fn can_recv(&self) -> bool;

    fn capacity(&self) -> usize;
}

/// Ring layout used for point-to-point queue pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    #[default]
    Ump,
    Ffq,
}

impl QueueKind {
    /// Messages a ring of `slots` lines can hold.
    pub fn capacity(self, slots: usize) -> usize {
        match self {
            QueueKind::Ump => slots.saturating_sub(1),
            QueueKind::Ffq => slots,
        }
    }
}

/// Producer of either SPSC layout, chosen at construction.
#[derive(Debug)]
pub enum TxQueue {
    Ump(UmpTx),
    Ffq(FfqTx),
}

/// Consumer of either SPSC layout, chosen at construction.
#[derive(Debug)]
pub enum RxQueue {
    Ump(UmpRx),
    Ffq(FfqRx),
}

impl Sender for TxQueue {
    #[inline]
    fn try_send(&self, msg: &Message) -> CollectiveResult<()> {
        match self {
            TxQueue::Ump(q) => q.try_send(msg),
            TxQueue::Ffq(q) => q.try_send(msg),
        }
    }

    #[inline]
    fn try_notify(&self) -> CollectiveResult<()> {
        match self {
            TxQueue::Ump(q) => q.try_notify(),
            TxQueue::Ffq(q) => q.try_notify(),
        }
    }

    #[inline]
    fn can_send(&self) -> bool {
        match self {
            TxQueue::Ump(q) => q.can_send(),
            TxQueue::Ffq(q) => q.can_send(),
        }
    }

    fn capacity(&self) -> usize {
        match self {
            TxQueue::Ump(q) => q.capacity(),
            TxQueue::Ffq(q) => q.capacity(),
        }
    }
}

impl Receiver for RxQueue {
    #[inline]
    fn try_recv(&self, msg: &mut Message) -> CollectiveResult<()> {
        match self {
            RxQueue::Ump(q) => q.try_recv(msg),
            RxQueue::Ffq(q) => q.try_recv(msg),
        }
    }

    #[inline]
    fn can_recv(&self) -> bool {
        match self {
            RxQueue::Ump(q) => q.can_recv(),
            RxQueue::Ffq(q) => q.can_recv(),
        }
    }

    fn capacity(&self) -> usize {
        match self {
            RxQueue::Ump(q) => q.capacity(),
            RxQueue::Ffq(q) => q.capacity(),
        }
    }
}

/// A bidirectional link as seen from one of its ends.
pub trait Channel: Send + Sync {
    fn try_send(&self, msg: &Message) -> CollectiveResult<()>;

    fn try_notify(&self) -> CollectiveResult<()>;

    fn try_recv(&self, msg: &mut Message) -> CollectiveResult<()>;

    fn can_send(&self) -> bool;

    fn can_recv(&self) -> bool;

    /// Send, retrying `QueueFull` under `policy`.
    fn send(&self, msg: &Message, policy: &RetryPolicy) -> CollectiveResult<()> {
        policy.run("send", || self.try_send(msg))
    }

    /// Send a notification, retrying `QueueFull` under `policy`.
    fn notify(&self, policy: &RetryPolicy) -> CollectiveResult<()> {
        policy.run("notify", || self.try_notify())
    }

    /// Receive, retrying `QueueEmpty` under `policy`.
    fn recv(&self, msg: &mut Message, policy: &RetryPolicy) -> CollectiveResult<()> {
        policy.run("recv", || self.try_recv(msg))
    }

    /// Receive and discard one zero-word notification.
    fn recv_notification(&self, policy: &RetryPolicy) -> CollectiveResult<()> {
        let mut msg = Message::notification();
        self.recv(&mut msg, policy)
    }
}
