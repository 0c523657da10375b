//! Tree reduction.

use crate::channel::Channel;
use crate::context::Context;
use crate::error::CollectiveResult;
use crate::message::Message;
use crate::node::NodeId;

use super::broadcast::broadcast;

/// Fold every node's `input` into `result` at the root.
///
/// Each node combines its children in topology order, then its shared-memory
/// members in position order, then its own `input` last, and sends the
/// accumulator to its parent. `op` folds its second argument into the first
/// and must be associative across that order. On non-root nodes `result`
/// holds the subtree's partial value.
pub fn reduce<F>(
    ctx: &Context,
    node: NodeId,
    input: &Message,
    result: &mut Message,
    op: F,
) -> CollectiveResult<()>
where
    F: Fn(&mut Message, &Message) -> CollectiveResult<()>,
{
    let policy = ctx.retry_policy();
    let mut received = false;
    let mut scratch = Message::default();

    for child in ctx.child_endpoints(node)? {
        if received {
            child.recv(&mut scratch, policy)?;
            op(result, &scratch)?;
        } else {
            child.recv(result, policy)?;
            received = true;
        }
    }
    if let Some(cluster) = ctx.cluster(node)? {
        for member in 0..cluster.members() {
            if received {
                cluster.recv_from(member, &mut scratch, policy)?;
                op(result, &scratch)?;
            } else {
                cluster.recv_from(member, result, policy)?;
                received = true;
            }
        }
    }

    if received {
        op(result, input)?;
    } else {
        result.copy_from(input)?;
    }

    if let Some(parent) = ctx.parent_channel(node)? {
        parent.send(result, policy)?;
    }
    Ok(())
}

/// [`reduce`] followed by a broadcast of the root's result to every node.
pub fn reduce_all<F>(
    ctx: &Context,
    node: NodeId,
    input: &Message,
    result: &mut Message,
    op: F,
) -> CollectiveResult<()>
where
    F: Fn(&mut Message, &Message) -> CollectiveResult<()>,
{
    reduce(ctx, node, input, result, op)?;
    broadcast(ctx, node, result)
}

/// Payload-free reduction: the root returns once every node has called it.
pub fn reduce_notify(ctx: &Context, node: NodeId) -> CollectiveResult<()> {
    let policy = ctx.retry_policy();
    for child in ctx.child_endpoints(node)? {
        child.recv_notification(policy)?;
    }
    if let Some(cluster) = ctx.cluster(node)? {
        let mut note = Message::notification();
        for member in 0..cluster.members() {
            cluster.recv_from(member, &mut note, policy)?;
        }
    }
    if let Some(parent) = ctx.parent_channel(node)? {
        parent.notify(policy)?;
    }
    Ok(())
}
