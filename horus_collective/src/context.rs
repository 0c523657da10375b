//! Live channel layout for a topology.
//!
//! A [`Context`] allocates one [`QueuePair`] per message-passing tree edge
//! (parent side = `src`) and one [`ClusterChannel`] per shared-memory
//! coordinator. Every node's record lists its children links in topology
//! order, with the cluster (if any) after them; each child's record points
//! back at the link that connects it to its parent.
//!
//! The context is built single-threaded and is read-only afterwards, so it
//! can be shared by reference across all node threads.

use std::sync::Arc;

use log::{debug, info};

use crate::channel::ffq::{ffq_channel, FfqRx, FfqTx};
use crate::channel::swmr::{self, swmr_channel, SwmrReader, SwmrWriter};
use crate::channel::{Channel, Receiver, RetryPolicy, Sender};
use crate::config::CollectiveConfig;
use crate::error::{CollectiveError, CollectiveResult};
use crate::message::Message;
use crate::node::{Node, NodeId};
use crate::platform::{
    numa_node_of_cpu, run_nodes, NumaAllocator, SystemAllocator, CACHELINE_SIZE,
};
use crate::queuepair::{Endpoint, QueueOptions, QueuePair};
use crate::topology::Topology;

// ============================================================================
// Shared-memory clusters
// ============================================================================

/// Coordinator side of a cluster: one ring read by every member, one mailbox
/// per member for upward traffic.
#[derive(Debug)]
pub struct ClusterCoordinator {
    writer: SwmrWriter,
    mailboxes: Vec<FfqRx>,
}

impl ClusterCoordinator {
    pub fn members(&self) -> usize {
        self.mailboxes.len()
    }

    pub fn try_publish(&self, msg: &Message) -> CollectiveResult<()> {
        self.writer.try_send(msg)
    }

    pub fn try_publish_notify(&self) -> CollectiveResult<()> {
        self.writer.try_notify()
    }

    /// Deliver `msg` to every member.
    pub fn publish(&self, msg: &Message, policy: &RetryPolicy) -> CollectiveResult<()> {
        policy.run("cluster publish", || self.writer.try_send(msg))
    }

    pub fn publish_notify(&self, policy: &RetryPolicy) -> CollectiveResult<()> {
        policy.run("cluster notify", || self.writer.try_notify())
    }

    pub fn try_recv_from(&self, member: usize, msg: &mut Message) -> CollectiveResult<()> {
        self.mailbox(member)?.try_recv(msg)
    }

    /// Receive the next upward message from member `member`.
    pub fn recv_from(
        &self,
        member: usize,
        msg: &mut Message,
        policy: &RetryPolicy,
    ) -> CollectiveResult<()> {
        let mailbox = self.mailbox(member)?;
        policy.run("cluster recv", || mailbox.try_recv(msg))
    }

    pub fn can_recv_from(&self, member: usize) -> bool {
        self.mailboxes.get(member).is_some_and(|m| m.can_recv())
    }

    fn mailbox(&self, member: usize) -> CollectiveResult<&FfqRx> {
        self.mailboxes.get(member).ok_or_else(|| {
            CollectiveError::invalid(format!(
                "cluster has {} members, no member {}",
                self.mailboxes.len(),
                member
            ))
        })
    }
}

/// Member side of a cluster; acts as the member's parent link.
#[derive(Debug)]
pub struct ClusterMember {
    node: NodeId,
    coordinator: NodeId,
    reader: SwmrReader,
    mailbox: FfqTx,
}

impl ClusterMember {
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn coordinator(&self) -> NodeId {
        self.coordinator
    }

    /// Position within the cluster.
    pub fn position(&self) -> usize {
        self.reader.index()
    }
}

impl Channel for ClusterMember {
    fn try_send(&self, msg: &Message) -> CollectiveResult<()> {
        self.mailbox.try_send(msg)
    }

    fn try_notify(&self) -> CollectiveResult<()> {
        self.mailbox.try_notify()
    }

    fn try_recv(&self, msg: &mut Message) -> CollectiveResult<()> {
        self.reader.try_recv(msg)
    }

    fn can_send(&self) -> bool {
        self.mailbox.can_send()
    }

    fn can_recv(&self) -> bool {
        self.reader.can_recv()
    }
}

/// Coordinator plus members of one shared-memory cluster.
#[derive(Debug)]
pub struct ClusterChannel {
    coordinator_id: NodeId,
    coordinator: ClusterCoordinator,
    members: Vec<ClusterMember>,
}

impl ClusterChannel {
    /// Allocate the fan-out ring and the member mailboxes on the
    /// coordinator's NUMA node.
    pub fn create(
        coordinator: Node,
        members: &[Node],
        slots: usize,
        numa_aware: bool,
        alloc: &dyn NumaAllocator,
    ) -> CollectiveResult<Self> {
        let numa = numa_node_of_cpu(coordinator.core());
        let place = |bytes: usize| {
            if numa_aware {
                alloc.alloc_on_node(bytes, CACHELINE_SIZE, numa)
            } else {
                alloc.alloc(bytes, CACHELINE_SIZE)
            }
        };

        let ring = place(swmr::buffer_bytes(slots, members.len()))?;
        let (writer, readers) =
            swmr_channel(Arc::new(ring), slots, members.len()).map_err(CollectiveError::chan_create)?;

        let mut mailboxes = Vec::with_capacity(members.len());
        let mut ends = Vec::with_capacity(members.len());
        for (node, reader) in members.iter().zip(readers) {
            let buf = place(CACHELINE_SIZE)?;
            let (tx, rx) = ffq_channel(Arc::new(buf), 1).map_err(CollectiveError::chan_create)?;
            mailboxes.push(rx);
            ends.push(ClusterMember {
                node: node.id(),
                coordinator: coordinator.id(),
                reader,
                mailbox: tx,
            });
        }

        debug!(
            "cluster at {}: {} members, {} slots",
            coordinator,
            members.len(),
            slots
        );
        Ok(Self {
            coordinator_id: coordinator.id(),
            coordinator: ClusterCoordinator { writer, mailboxes },
            members: ends,
        })
    }

    pub fn coordinator_id(&self) -> NodeId {
        self.coordinator_id
    }

    pub fn coordinator(&self) -> &ClusterCoordinator {
        &self.coordinator
    }

    pub fn member(&self, position: usize) -> Option<&ClusterMember> {
        self.members.get(position)
    }

    pub fn members(&self) -> &[ClusterMember] {
        &self.members
    }
}

// ============================================================================
// Context
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParentLink {
    /// `children[slot]` of `owner`
    Pair { owner: NodeId, slot: usize },
    /// Member `position` of `owner`'s cluster
    Cluster { owner: NodeId, position: usize },
}

#[derive(Debug)]
struct NodeRecord {
    node: Node,
    parent: Option<ParentLink>,
    children: Vec<QueuePair>,
    cluster: Option<ClusterChannel>,
}

/// A topology materialised into channels.
#[derive(Debug)]
pub struct Context {
    topology: Arc<Topology>,
    records: Vec<NodeRecord>,
    /// node id -> record position, sized `max_id + 1`
    index: Vec<Option<usize>>,
    retry: RetryPolicy,
    options: QueueOptions,
    pin_threads: bool,
}

impl Context {
    /// Default configuration, one node per id mapped round-robin onto cores.
    pub fn new(topology: Arc<Topology>) -> CollectiveResult<Self> {
        let nodes = Node::sequential(topology.len());
        Self::create(topology, &nodes, &CollectiveConfig::default(), &SystemAllocator)
    }

    /// Allocate every link of `topology`. `nodes[i]` describes node id `i`.
    ///
    /// On failure everything allocated so far is released; the error names
    /// the edge that could not be wired.
    pub fn create(
        topology: Arc<Topology>,
        nodes: &[Node],
        config: &CollectiveConfig,
        alloc: &dyn NumaAllocator,
    ) -> CollectiveResult<Self> {
        config.validate()?;
        if nodes.len() != topology.len() {
            return Err(CollectiveError::invalid(format!(
                "topology '{}' has {} nodes, {} given",
                topology.name(),
                topology.len(),
                nodes.len()
            )));
        }
        if let Some((i, n)) = nodes.iter().enumerate().find(|(i, n)| n.id() as usize != *i) {
            return Err(CollectiveError::invalid(format!(
                "node at position {} has id {}",
                i,
                n.id()
            )));
        }

        let options = QueueOptions::from(config);
        let mut records = Vec::with_capacity(topology.len());

        for tnode in topology.iter() {
            let node = nodes[tnode.id() as usize];
            let mut children = Vec::with_capacity(tnode.children().len());
            for &child in tnode.children() {
                let pair = QueuePair::create(node, nodes[child as usize], options, alloc)
                    .map_err(|e| edge_error(node.id(), child, e))?;
                children.push(pair);
            }

            let cluster = if tnode.does_shared_memory() {
                let members: Vec<Node> = tnode
                    .shm_children()
                    .iter()
                    .map(|&m| nodes[m as usize])
                    .collect();
                let cluster =
                    ClusterChannel::create(node, &members, options.slots, options.numa_aware, alloc)
                        .map_err(|e| edge_error(node.id(), members[0].id(), e))?;
                Some(cluster)
            } else {
                None
            };

            records.push(NodeRecord {
                node,
                parent: None,
                children,
                cluster,
            });
        }

        // Children are created before their own record exists; resolve the
        // parent side through the id index once every record is in place.
        let max_id = records.iter().map(|r| r.node.id()).max().unwrap_or(0) as usize;
        let mut index = vec![None; max_id + 1];
        for (pos, record) in records.iter().enumerate() {
            index[record.node.id() as usize] = Some(pos);
        }

        let mut links = Vec::new();
        for record in &records {
            let owner = record.node.id();
            for (slot, pair) in record.children.iter().enumerate() {
                links.push((pair.dst().node(), ParentLink::Pair { owner, slot }));
            }
            if let Some(cluster) = &record.cluster {
                for member in cluster.members() {
                    let link = ParentLink::Cluster {
                        owner,
                        position: member.position(),
                    };
                    links.push((member.node(), link));
                }
            }
        }
        for (child, link) in links {
            let pos = index[child as usize].ok_or(CollectiveError::NodeInvalid(child))?;
            records[pos].parent = Some(link);
        }

        let pairs: usize = records.iter().map(|r| r.children.len()).sum();
        let clusters = records.iter().filter(|r| r.cluster.is_some()).count();
        info!(
            "context for '{}': {} nodes, {} queue pairs, {} clusters",
            topology.name(),
            records.len(),
            pairs,
            clusters
        );

        Ok(Self {
            topology,
            records,
            index,
            retry: config.retry_policy(),
            options,
            pin_threads: config.pin_threads,
        })
    }

    /// Replace the retry policy used by collectives on this context.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Participants in id order.
    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.records.iter().map(|r| r.node).collect();
        nodes.sort_by_key(|n| n.id());
        nodes
    }

    pub fn node(&self, id: NodeId) -> Option<Node> {
        self.record(id).map(|r| r.node)
    }

    /// Whether [`Context::run`] pins node threads to their cores.
    pub fn pins_threads(&self) -> bool {
        self.pin_threads
    }

    /// Run `entry` once per participant on its own thread, pinned when the
    /// configuration asks for it. Results come back in id order.
    pub fn run<T, F>(&self, entry: F) -> CollectiveResult<Vec<T>>
    where
        T: Send,
        F: Fn(Node) -> T + Sync,
    {
        run_nodes(&self.nodes(), self.pin_threads, entry)
    }

    /// Consume the context. Its channels and buffers are freed when it drops;
    /// callers must ensure no node is mid-operation.
    pub fn destroy(self) {
        debug!("destroying context for '{}'", self.topology.name());
    }

    // === Queries (fail closed for unknown ids) ===

    pub fn is_root(&self, id: NodeId) -> bool {
        self.record(id).is_some() && self.topology.is_root(id)
    }

    pub fn is_leaf(&self, id: NodeId) -> bool {
        self.record(id).is_some() && self.topology.is_leaf(id)
    }

    pub fn does_shared_memory(&self, id: NodeId) -> bool {
        self.record(id).is_some_and(|r| r.cluster.is_some())
    }

    // === Link lookup ===

    #[inline]
    fn record(&self, id: NodeId) -> Option<&NodeRecord> {
        self.index
            .get(id as usize)
            .copied()
            .flatten()
            .map(|pos| &self.records[pos])
    }

    fn record_or_err(&self, id: NodeId) -> CollectiveResult<&NodeRecord> {
        self.record(id).ok_or(CollectiveError::NodeInvalid(id))
    }

    /// The link `id` uses to reach its parent or coordinator.
    pub fn parent_channel(&self, id: NodeId) -> CollectiveResult<Option<&dyn Channel>> {
        let record = self.record_or_err(id)?;
        let Some(link) = record.parent else {
            return Ok(None);
        };
        let channel: &dyn Channel = match link {
            ParentLink::Pair { owner, slot } => {
                self.record_or_err(owner)?.children[slot].dst() as &dyn Channel
            }
            ParentLink::Cluster { owner, position } => self
                .record_or_err(owner)?
                .cluster
                .as_ref()
                .and_then(|c| c.member(position))
                .ok_or_else(|| {
                    crate::collective_internal!("cluster link {} of node {} missing", position, owner)
                })? as &dyn Channel,
        };
        Ok(Some(channel))
    }

    /// `id`'s side of each message-passing child link, in child order.
    pub fn child_endpoints(
        &self,
        id: NodeId,
    ) -> CollectiveResult<impl ExactSizeIterator<Item = &Endpoint> + '_> {
        Ok(self.record_or_err(id)?.children.iter().map(|pair| pair.src()))
    }

    /// Coordinator side of `id`'s cluster, if it has shared-memory children.
    pub fn cluster(&self, id: NodeId) -> CollectiveResult<Option<&ClusterCoordinator>> {
        Ok(self
            .record_or_err(id)?
            .cluster
            .as_ref()
            .map(|c| c.coordinator()))
    }

    /// Point-to-point link from `from` to its tree neighbour `to`.
    pub fn link(&self, from: NodeId, to: NodeId) -> CollectiveResult<&dyn Channel> {
        self.record_or_err(to)?;
        let record = self.record_or_err(from)?;
        let tnode = self
            .topology
            .node(from)
            .ok_or(CollectiveError::NodeInvalid(from))?;

        if tnode.upstream() == Some(to) {
            return self
                .parent_channel(from)?
                .ok_or_else(|| crate::collective_internal!("node {} has no parent link", from));
        }
        if let Some(slot) = tnode.children().iter().position(|&c| c == to) {
            return Ok(record.children[slot].src());
        }
        if tnode.shm_children().contains(&to) {
            return Err(CollectiveError::invalid(format!(
                "node {} reaches shared-memory member {} only through its cluster",
                from, to
            )));
        }
        Err(CollectiveError::invalid(format!(
            "nodes {} and {} are not tree neighbours",
            from, to
        )))
    }

    // === Point-to-point messaging ===

    pub fn send(&self, from: NodeId, to: NodeId, msg: &Message) -> CollectiveResult<()> {
        self.link(from, to)?.send(msg, &self.retry)
    }

    pub fn notify(&self, from: NodeId, to: NodeId) -> CollectiveResult<()> {
        self.link(from, to)?.notify(&self.retry)
    }

    /// Receive at `at` the next message from neighbour `from`.
    pub fn recv(&self, at: NodeId, from: NodeId, msg: &mut Message) -> CollectiveResult<()> {
        self.link(at, from)?.recv(msg, &self.retry)
    }

    pub fn can_send(&self, from: NodeId, to: NodeId) -> CollectiveResult<bool> {
        Ok(self.link(from, to)?.can_send())
    }

    pub fn can_recv(&self, at: NodeId, from: NodeId) -> CollectiveResult<bool> {
        Ok(self.link(at, from)?.can_recv())
    }
}

fn edge_error(parent: NodeId, child: NodeId, source: CollectiveError) -> CollectiveError {
    CollectiveError::ContextCreate {
        parent,
        child,
        source: Box::new(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::RetryPolicy;
    use crate::platform::AlignedBuffer;
    use crate::topology::Model;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn binary(n: usize) -> Context {
        Context::new(Arc::new(Topology::binary_tree(n, "test").unwrap()))
            .unwrap()
            .with_retry(RetryPolicy::bounded(100_000))
    }

    #[test]
    fn test_layout_mirrors_tree() {
        let ctx = binary(7);
        assert_eq!(ctx.len(), 7);
        for id in 0..7u32 {
            let children = ctx.topology().children(id).to_vec();
            let peers: Vec<NodeId> = ctx.child_endpoints(id).unwrap().map(|e| e.peer()).collect();
            assert_eq!(peers, children);
            assert_eq!(ctx.parent_channel(id).unwrap().is_some(), id != 0);
        }
        assert!(ctx.is_root(0));
        assert!(ctx.is_leaf(6));
        assert!(!ctx.is_leaf(2));
    }

    #[test]
    fn test_queries_fail_closed() {
        let ctx = binary(3);
        assert!(!ctx.is_root(42));
        assert!(!ctx.is_leaf(42));
        assert!(!ctx.does_shared_memory(42));
        assert!(matches!(
            ctx.parent_channel(42),
            Err(CollectiveError::NodeInvalid(42))
        ));
    }

    #[test]
    fn test_point_to_point_along_edges() {
        let ctx = binary(3);
        ctx.send(0, 2, &Message::word(5)).unwrap();
        assert!(ctx.can_recv(2, 0).unwrap());
        let mut out = Message::default();
        ctx.recv(2, 0, &mut out).unwrap();
        assert_eq!(out.first_word(), 5);

        ctx.notify(1, 0).unwrap();
        let mut note = Message::notification();
        ctx.recv(0, 1, &mut note).unwrap();
        assert!(note.is_empty());

        assert!(matches!(
            ctx.send(1, 2, &Message::word(1)),
            Err(CollectiveError::InvalidArgument(_))
        ));
        assert!(matches!(
            ctx.send(0, 9, &Message::word(1)),
            Err(CollectiveError::NodeInvalid(9))
        ));
    }

    #[test]
    fn test_cluster_links() {
        let model = Model {
            root: 0,
            leaves: vec![],
            matrix: vec![
                vec![0, 1, 0, 0],
                vec![99, 0, 70, 71],
                vec![0, 50, 0, 0],
                vec![0, 50, 0, 0],
            ],
        };
        let topo = Arc::new(Topology::from_model(&model, "shm").unwrap());
        let ctx = Context::new(topo).unwrap();
        assert!(ctx.does_shared_memory(1));
        assert!(!ctx.does_shared_memory(0));

        let coord = ctx.cluster(1).unwrap().unwrap();
        assert_eq!(coord.members(), 2);
        let policy = RetryPolicy::bounded(1000);
        coord.publish(&Message::word(8), &policy).unwrap();

        let mut out = Message::default();
        for member in [2u32, 3] {
            ctx.recv(member, 1, &mut out).unwrap();
            assert_eq!(out.first_word(), 8);
        }

        ctx.send(3, 1, &Message::word(30)).unwrap();
        coord.recv_from(1, &mut out, &policy).unwrap();
        assert_eq!(out.first_word(), 30);
        assert!(!coord.can_recv_from(0));
        assert!(ctx.link(1, 2).is_err());
    }

    struct CountingAllocator {
        budget: usize,
        calls: AtomicUsize,
    }

    impl NumaAllocator for CountingAllocator {
        fn alloc(&self, bytes: usize, align: usize) -> CollectiveResult<AlignedBuffer> {
            if self.calls.fetch_add(1, Ordering::SeqCst) >= self.budget {
                return Err(CollectiveError::MallocFail { bytes });
            }
            SystemAllocator.alloc(bytes, align)
        }

        fn alloc_on_node(
            &self,
            bytes: usize,
            align: usize,
            _numa_node: usize,
        ) -> CollectiveResult<AlignedBuffer> {
            self.alloc(bytes, align)
        }
    }

    #[test]
    fn test_allocation_failure_names_edge() {
        let topo = Arc::new(Topology::binary_tree(4, "oom").unwrap());
        let alloc = CountingAllocator {
            budget: 3,
            calls: AtomicUsize::new(0),
        };
        let err = Context::create(
            topo,
            &Node::sequential(4),
            &CollectiveConfig::default(),
            &alloc,
        )
        .unwrap_err();
        match &err {
            CollectiveError::ContextCreate { parent, child, .. } => {
                assert_eq!((*parent, *child), (0, 2));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(matches!(err.root_cause(), CollectiveError::MallocFail { .. }));
    }

    #[test]
    fn test_run_follows_pin_setting() {
        let topo = Arc::new(Topology::binary_tree(3, "run").unwrap());
        let config = CollectiveConfig {
            pin_threads: false,
            ..Default::default()
        };
        let ctx = Context::create(topo.clone(), &Node::sequential(3), &config, &SystemAllocator)
            .unwrap()
            .with_retry(RetryPolicy::bounded(1_000_000));
        assert!(!ctx.pins_threads());

        let results = ctx
            .run(|node| {
                let name = std::thread::current().name().map(str::to_owned);
                let value = match node.id() {
                    0 => {
                        ctx.send(0, 1, &Message::word(11)).unwrap();
                        0
                    }
                    1 => {
                        let mut out = Message::default();
                        ctx.recv(1, 0, &mut out).unwrap();
                        out.first_word()
                    }
                    _ => 0,
                };
                (name, value)
            })
            .unwrap();
        assert_eq!(results[1].1, 11);
        for (id, (name, _)) in results.iter().enumerate() {
            assert_eq!(name.as_deref(), Some(format!("horus-node-{}", id).as_str()));
        }

        let pinned = Context::create(
            topo,
            &Node::sequential(3),
            &CollectiveConfig::default(),
            &SystemAllocator,
        )
        .unwrap();
        assert!(pinned.pins_threads());
    }

    #[test]
    fn test_node_list_must_match() {
        let topo = Arc::new(Topology::binary_tree(3, "t").unwrap());
        let err = Context::create(
            topo,
            &Node::sequential(2),
            &CollectiveConfig::default(),
            &SystemAllocator,
        )
        .unwrap_err();
        assert!(matches!(err, CollectiveError::InvalidArgument(_)));
    }
}
