//! Task service: one OS thread per node, optionally pinned to the node's core.
//!
//! The node identity is handed to the entry function explicitly; there is no
//! thread-local "current node".

use std::any::Any;
use std::thread::JoinHandle;

use log::{debug, warn};

use crate::error::{CollectiveError, CollectiveResult};
use crate::node::{Node, NodeId};

use super::affinity::pin_thread_to_core;

/// Handle to a running node thread.
#[derive(Debug)]
pub struct NodeHandle<T> {
    node: Node,
    handle: JoinHandle<T>,
}

impl<T> NodeHandle<T> {
    pub fn node(&self) -> Node {
        self.node
    }

    /// Wait for the node's entry function to return.
    pub fn join(self) -> CollectiveResult<T> {
        let id = self.node.id();
        self.handle.join().map_err(|payload| CollectiveError::NodeJoin {
            node: id,
            message: panic_message(payload.as_ref()),
        })
    }
}

/// Start `entry` on a new thread for `node`.
pub fn spawn_node<T, F>(node: Node, pin: bool, entry: F) -> CollectiveResult<NodeHandle<T>>
where
    T: Send + 'static,
    F: FnOnce(Node) -> T + Send + 'static,
{
    let handle = std::thread::Builder::new()
        .name(thread_name(node.id()))
        .spawn(move || {
            if pin {
                pin_node(node);
            }
            entry(node)
        })
        .map_err(|e| CollectiveError::NodeStart {
            node: node.id(),
            message: e.to_string(),
        })?;
    debug!("started {}", node);
    Ok(NodeHandle { node, handle })
}

/// Run `entry` once per node on scoped threads and collect the results in
/// node order. The entry function may borrow from the caller's stack.
pub fn run_nodes<T, F>(nodes: &[Node], pin: bool, entry: F) -> CollectiveResult<Vec<T>>
where
    T: Send,
    F: Fn(Node) -> T + Sync,
{
    let entry = &entry;
    let joined = crossbeam::scope(|scope| {
        let mut handles = Vec::with_capacity(nodes.len());
        for &node in nodes {
            let handle = scope
                .builder()
                .name(thread_name(node.id()))
                .spawn(move |_| {
                    if pin {
                        pin_node(node);
                    }
                    entry(node)
                })
                .map_err(|e| CollectiveError::NodeStart {
                    node: node.id(),
                    message: e.to_string(),
                })?;
            handles.push((node, handle));
        }

        handles
            .into_iter()
            .map(|(node, handle)| {
                handle.join().map_err(|payload| CollectiveError::NodeJoin {
                    node: node.id(),
                    message: panic_message(payload.as_ref()),
                })
            })
            .collect::<CollectiveResult<Vec<T>>>()
    });

    // A spawn failure leaves earlier threads running until the scope joins
    // them; any panic they raise surfaces here.
    match joined {
        Ok(results) => results,
        Err(payload) => Err(CollectiveError::NodeJoin {
            node: nodes.first().map(|n| n.id()).unwrap_or_default(),
            message: panic_message(payload.as_ref()),
        }),
    }
}

fn pin_node(node: Node) {
    if let Err(e) = pin_thread_to_core(node.core()) {
        warn!("could not pin {}: {}", node, e);
    }
}

fn thread_name(id: NodeId) -> String {
    format!("horus-node-{}", id)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "node panicked".to_string()
    }
}
