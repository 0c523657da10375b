//! Tree broadcast.

use crate::channel::Channel;
use crate::context::Context;
use crate::error::CollectiveResult;
use crate::message::Message;
use crate::node::NodeId;

/// Deliver the root's `msg` to every node.
///
/// At the root `msg` is sent; everywhere else it is overwritten with the
/// received payload and forwarded to the node's children in topology order,
/// then to its shared-memory cluster.
pub fn broadcast(ctx: &Context, node: NodeId, msg: &mut Message) -> CollectiveResult<()> {
    let policy = ctx.retry_policy();
    if let Some(parent) = ctx.parent_channel(node)? {
        parent.recv(msg, policy)?;
    }
    send_to_subtree(ctx, node, msg)
}

/// Forward `msg` to `node`'s children and cluster without receiving first.
pub(crate) fn send_to_subtree(ctx: &Context, node: NodeId, msg: &Message) -> CollectiveResult<()> {
    let policy = ctx.retry_policy();
    for child in ctx.child_endpoints(node)? {
        child.send(msg, policy)?;
    }
    if let Some(cluster) = ctx.cluster(node)? {
        cluster.publish(msg, policy)?;
    }
    Ok(())
}

/// Payload-free broadcast: every node returns once the root has called it.
pub fn broadcast_notify(ctx: &Context, node: NodeId) -> CollectiveResult<()> {
    let policy = ctx.retry_policy();
    if let Some(parent) = ctx.parent_channel(node)? {
        parent.recv_notification(policy)?;
    }
    for child in ctx.child_endpoints(node)? {
        child.notify(policy)?;
    }
    if let Some(cluster) = ctx.cluster(node)? {
        cluster.publish_notify(policy)?;
    }
    Ok(())
}
