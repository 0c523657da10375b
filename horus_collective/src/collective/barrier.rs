//! Tree barrier.

use crate::context::Context;
use crate::error::CollectiveResult;
use crate::node::NodeId;

use super::broadcast::broadcast_notify;
use super::reduction::reduce_notify;

/// Block until every node of `ctx` has entered the barrier.
///
/// Notifications flow up to the root, then back down. Each call is a
/// self-contained round, so the barrier can be reused immediately.
pub fn barrier_wait(ctx: &Context, node: NodeId) -> CollectiveResult<()> {
    reduce_notify(ctx, node)?;
    broadcast_notify(ctx, node)
}
