//! Participants of a collective.
//!
//! A [`Node`] is one execution unit bound to one core. Its identity is passed
//! explicitly to every channel and collective call; nothing in this crate
//! keeps a thread-local "current node".

use std::fmt;

use serde::{Deserialize, Serialize};

/// Numeric identity of a participant (`0..N-1` for generated topologies)
pub type NodeId = u32;

/// One logical participant, pinned to one core for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    id: NodeId,
    core: usize,
}

impl Node {
    pub fn new(id: NodeId, core: usize) -> Self {
        Self { id, core }
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Core the node's thread is pinned to.
    #[inline]
    pub fn core(&self) -> usize {
        self.core
    }

    /// One node per core, ids assigned in list order.
    pub fn from_cores(cores: &[usize]) -> Vec<Node> {
        cores
            .iter()
            .enumerate()
            .map(|(id, &core)| Node::new(id as NodeId, core))
            .collect()
    }

    /// `count` nodes mapped round-robin onto the cores available to this process.
    pub fn sequential(count: usize) -> Vec<Node> {
        let cpus = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(1);
        (0..count)
            .map(|i| Node::new(i as NodeId, i % cpus))
            .collect()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {}@core {}", self.id, self.core)
    }
}
