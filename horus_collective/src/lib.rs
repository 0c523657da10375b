//! # HORUS Collectives
//!
//! Multicore collective communication over lock-free shared-memory channels.
//!
//! A [`Topology`] arranges nodes (one per core) into a rooted tree, a
//! [`Context`] materialises every tree edge as a [`QueuePair`] of cache-line
//! rings, and the [`collective`] functions (broadcast, reduction, barrier)
//! walk that layout. The [`DisseminationBarrier`] synchronises a core list
//! without any tree.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use horus_collective::prelude::*;
//!
//! # fn main() -> horus_collective::Result<()> {
//! let topology = Arc::new(Topology::binary_tree(4, "quad")?);
//! let ctx = Context::new(topology)?;
//!
//! // One thread per node, pinned unless `pin_threads = false` is configured
//! let sums = ctx.run(|node| {
//!     let mut total = Message::default();
//!     reduce_all(&ctx, node.id(), &Message::word(1), &mut total, ops::sum)
//!         .map(|_| total.first_word())
//! })?;
//! assert!(sums.into_iter().all(|s| matches!(s, Ok(4))));
//! # Ok(())
//! # }
//! ```
//!
//! ## Design
//!
//! - Channels never block: `try_send`/`try_recv` report `QueueFull` or
//!   `QueueEmpty`, and the blocking forms busy-poll under a [`RetryPolicy`]
//! - The payload store is published by a release store of the slot's control
//!   word and observed with an acquire load; cursors, epochs and counters have
//!   a single writer each, so no read-modify-write is used on the hot path
//! - Nodes are identified explicitly in every call; there is no thread-local
//!   "current node"

pub mod channel;
pub mod collective;
pub mod config;
pub mod context;
pub mod error;
pub mod message;
pub mod node;
pub mod platform;
pub mod queuepair;
pub mod topology;

pub(crate) mod utils;

pub use channel::{AckPolicy, CancelToken, Channel, QueueKind, Receiver, RetryPolicy, Sender};
pub use collective::{
    barrier_wait, broadcast, broadcast_notify, ops, reduce, reduce_all, reduce_notify,
    DisseminationBarrier,
};
pub use config::CollectiveConfig;
pub use context::{ClusterChannel, Context};
pub use error::{CollectiveError, CollectiveResult, Result};
pub use message::Message;
pub use node::{Node, NodeId};
pub use platform::{run_nodes, spawn_node, NodeHandle};
pub use queuepair::{Endpoint, QueueOptions, QueuePair};
pub use topology::{Model, Topology, TopologySet};

/// Commonly used types
pub mod prelude {
    pub use crate::channel::{Channel, RetryPolicy};
    pub use crate::collective::{
        barrier_wait, broadcast, broadcast_notify, ops, reduce, reduce_all, reduce_notify,
        DisseminationBarrier,
    };
    pub use crate::config::CollectiveConfig;
    pub use crate::context::Context;
    pub use crate::error::{CollectiveError, CollectiveResult};
    pub use crate::message::Message;
    pub use crate::node::{Node, NodeId};
    pub use crate::platform::run_nodes;
    pub use crate::topology::{Model, Topology};
}
